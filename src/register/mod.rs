//! 内核所需寄存器的接口
//!
//! 宿主环境中每个线程扮演一个 hart，寄存器以线程局部变量的形式保存，
//! 读写语义与 RISC-V 上的对应寄存器保持一致。

pub mod sstatus;

/// 线程指针寄存器 (tp) 操作
///
/// # 功能说明
/// 内核约定 tp 中保存当前 hart 的编号，`CpuManager::cpu_id` 由此读取
pub mod tp {
    use std::cell::Cell;

    std::thread_local! {
        static TP: Cell<usize> = const { Cell::new(0) };
    }

    /// 读取 tp 寄存器值
    ///
    /// # 返回值
    /// 当前存储的线程指针值
    pub unsafe fn read() -> usize {
        TP.with(Cell::get)
    }

    /// 设置 tp 寄存器值
    ///
    /// # 安全性
    /// 调用者需保证写入的值是合法的 hart 编号，
    /// 否则后续按 hart 编号索引的结构会越界
    pub unsafe fn write(tp: usize) {
        TP.with(|r| r.set(tp));
    }
}
