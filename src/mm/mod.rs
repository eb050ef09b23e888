//! 内存管理模块

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use crate::consts::PGSIZE;

pub use addr::{Addr, PhysAddr};
pub use kalloc::{KallocError, KernelMemory};

mod addr;
pub mod kalloc;
mod list;

/// 一段由分配器管理的物理内存，对应内核中 `end` 到 `PHYSTOP` 的区间。
///
/// 宿主环境下这段内存从进程堆上按页对齐地申请，区间内的地址就是
/// `kalloc` 交给调用者的物理地址。区间在析构时归还。
pub struct PhysRegion {
    base: NonNull<u8>,
    layout: Layout,
}

// 区间内的内存只通过分配器（持锁）或调用者持有的页访问
unsafe impl Send for PhysRegion {}
unsafe impl Sync for PhysRegion {}

impl PhysRegion {
    /// 申请 `npages` 个物理页大小、页对齐的区间，内容清零。
    ///
    /// # 可能的错误
    /// - `npages` 为 0 时触发 panic；
    /// - 宿主内存不足时按标准库约定中止。
    pub fn new(npages: usize) -> Self {
        if npages == 0 {
            panic!("PhysRegion: empty region");
        }
        let layout = match npages
            .checked_mul(PGSIZE)
            .map(|size| Layout::from_size_align(size, PGSIZE))
        {
            Some(Ok(layout)) => layout,
            _ => panic!("PhysRegion: {} pages overflow", npages),
        };
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let base = match NonNull::new(raw) {
            Some(base) => base,
            None => alloc::handle_alloc_error(layout),
        };
        Self { base, layout }
    }

    /// 区间起始地址
    #[inline]
    pub fn start(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// 区间结束地址（不含）
    #[inline]
    pub fn end(&self) -> usize {
        self.start() + self.layout.size()
    }

    /// 区间包含的页数
    #[inline]
    pub fn npages(&self) -> usize {
        self.layout.size() / PGSIZE
    }

    /// 判断 `pa` 是否落在 `[start, end)` 之内
    #[inline]
    pub fn contains(&self, pa: usize) -> bool {
        pa >= self.start() && pa < self.end()
    }
}

impl Drop for PhysRegion {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) }
    }
}

/// 向上取整到页边界
#[inline]
pub fn pg_round_up(address: usize) -> usize {
    (address + (PGSIZE - 1)) & !(PGSIZE - 1)
}

/// 向下取整到页边界
#[inline]
pub fn pg_round_down(address: usize) -> usize {
    address & !(PGSIZE - 1)
}
