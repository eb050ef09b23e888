//! 文件系统模块，目前只包含块缓存层

pub mod bio;

pub use bio::{Bcache, BcacheConfig, Buf, BufData, BufStat};
