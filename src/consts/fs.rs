//! 文件系统与块缓存相关常量

/// 单次文件系统操作最多写入的块数
pub const MAXOPBLOCKS: usize = 10;

/// 块缓存中的缓冲块数量
pub const NBUF: usize = MAXOPBLOCKS * 3;

/// 块大小（字节）
pub const BSIZE: usize = 1024;

/// 块缓存哈希桶（桶锁）的数量
pub const NBUCKET: usize = 13;
