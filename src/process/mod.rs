//! 处理器管理

mod cpu;

pub use cpu::{pop_off, push_off, CpuManager, IntrGuard};
