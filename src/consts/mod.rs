//! 内核常量

pub mod fs;

/// 系统支持的最大 CPU（hart）数量
pub const NCPU: usize = 8;

/// 页内偏移的位数
pub const PGSHIFT: usize = 12;

/// 每页字节数
pub const PGSIZE: usize = 1 << PGSHIFT;

/// kfree 时填充的垃圾字节，用于暴露悬垂引用
pub const FREE_JUNK: u8 = 1;

/// kalloc 返回前填充的垃圾字节，用于暴露未初始化读取
pub const ALLOC_JUNK: u8 = 5;
