//! xv6 内核的内存子系统：块缓存与按 CPU 划分的物理页分配器。
//!
//! 每个宿主线程扮演一个 hart，`tp` 与 `sstatus` 寄存器由线程局部变量模拟，
//! 锁与中断开关的语义与内核中一致。

#![warn(rust_2018_idioms)]

#[macro_use]
pub mod printf;

pub mod consts;
pub mod driver;
pub mod fs;
pub mod mm;
pub mod process;
pub mod register;
pub mod sleeplock;
pub mod spinlock;

pub use driver::{BlockDevice, RamDisk};
pub use fs::{Bcache, BcacheConfig, Buf, BufStat};
pub use mm::{KallocError, KernelMemory, PhysAddr, PhysRegion};
