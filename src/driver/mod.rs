//! 设备驱动模块，块缓存通过这里的接口访问磁盘

use crate::fs::Buf;

pub mod ramdisk;

pub use ramdisk::RamDisk;

/// 块设备接口
///
/// 块缓存只依赖这一个操作：在缓冲块与设备之间同步传输一整块。
/// 实现必须在返回前完成传输；出错时直接 panic，块缓存不负责重试。
pub trait BlockDevice: Send + Sync {
    /// 按 `buf.dev()` 与 `buf.blockno()` 读写一个块
    ///
    /// # 参数
    /// - `buf`: 要读写的缓冲区，调用者持有其睡眠锁
    /// - `writing`: 操作类型（true=写，false=读）
    fn rw(&self, buf: &mut Buf<'_>, writing: bool);
}
