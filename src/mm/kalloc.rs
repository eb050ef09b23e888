//! 物理页分配器，为用户进程、内核栈、页表页和管道缓冲区分配整页内存。
//!
//! 每个 CPU 拥有各自的空闲页链表和锁，本地链表为空时从其他 CPU 的链表窃取。

use core::ptr;

use array_macro::array;
use log::{debug, info, warn};

use crate::consts::{ALLOC_JUNK, FREE_JUNK, NCPU, PGSIZE};
use crate::process::{CpuManager, IntrGuard};
use crate::spinlock::SpinLock;

use super::list::FreeList;
use super::{pg_round_up, Addr, PhysAddr, PhysRegion};

/// 物理页分配失败的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum KallocError {
    #[error("out of physical memory")]
    OutOfMemory,
}

/// 按 CPU 划分的物理页分配器。
///
/// `KernelMemory` 管理一段 [`PhysRegion`]，把其中的每一页挂在某个 CPU 的
/// 空闲链表上。分配与释放都在关中断的情况下进行，保证读取 CPU 编号与
/// 操作该 CPU 的链表之间当前线程不会换到别的 hart 上。
///
/// 分配器通过 [`KernelMemory::kinit`] 一次性构造，之后以共享引用使用。
pub struct KernelMemory {
    /// 每个 CPU 一个空闲链表，各自由一把自旋锁保护
    kmem: [SpinLock<FreeList>; NCPU],

    /// 被管理的物理内存，必须比所有空闲链表活得更久
    region: PhysRegion,
}

impl KernelMemory {
    /// 初始化分配器。
    ///
    /// # 流程解释
    /// 1. 为每个 CPU 建立一把锁和一个空链表；
    /// 2. 对区间内每个完整的页调用 `kfree`，
    ///    既填充了空闲链表，也在启动时走了一遍释放路径。
    ///
    /// 所有页都会落在调用者当前所在 hart 的链表上，
    /// 其他 CPU 第一次分配时从这里窃取。
    pub fn kinit(region: PhysRegion) -> Self {
        let kmem = Self {
            kmem: array![_ => SpinLock::new(FreeList::new(), "kmem"); NCPU],
            region,
        };
        unsafe { kmem.free_range(kmem.region.start(), kmem.region.end()) };

        info!(
            "kinit: {} pages in [{:#x}, {:#x})",
            kmem.nfree(),
            kmem.region.start(),
            kmem.region.end()
        );
        #[cfg(feature = "verbose_init_info")]
        for id in 0..NCPU {
            info!("kinit: hart {} holds {} free pages", id, kmem.nfree_on(id));
        }

        kmem
    }

    /// 释放 `[pa_start, pa_end)` 中的每个完整页
    unsafe fn free_range(&self, pa_start: usize, pa_end: usize) {
        let mut pa = PhysAddr::from_raw(pg_round_up(pa_start));
        while pa.as_usize() + PGSIZE <= pa_end {
            self.kfree(pa);
            pa.add_page();
        }
    }

    /// 释放一页物理内存，`pa` 通常来自此前的 `kalloc()`
    /// （初始化时的 `kinit` 例外）。
    ///
    /// # 流程解释
    /// 1. 检查地址页对齐且落在被管理的区间内；
    /// 2. 用垃圾字节填满整页，以便暴露悬垂引用；
    /// 3. 关中断，取当前 hart 的编号，在该 hart 的锁下把页压入链表头部；
    /// 4. 恢复中断。
    ///
    /// # 可能的错误
    /// 地址未对齐或越界时触发 panic（`"kfree"`），这表示内核自身有缺陷。
    ///
    /// # 安全性
    /// 调用者必须保证此后不再通过任何指针访问这一页。
    pub unsafe fn kfree(&self, mut pa: PhysAddr) {
        if pa.as_usize() % PGSIZE != 0 || !self.region.contains(pa.as_usize()) {
            panic!("kfree");
        }

        // Fill with junk to catch dangling refs.
        ptr::write_bytes(pa.as_mut_ptr(), FREE_JUNK, PGSIZE);

        let _intr = IntrGuard::new();
        let id = CpuManager::cpu_id();
        self.kmem[id].lock().push(pa.into_raw());
    }

    /// 分配一页物理内存。
    ///
    /// # 流程解释
    /// 1. 关中断，从当前 hart 的链表弹出一页；
    /// 2. 本地链表为空时，按编号顺序依次尝试其他 hart 的链表，
    ///    在第一个非空链表上窃取一页；
    /// 3. 恢复中断，用另一种垃圾字节填满整页后返回。
    ///
    /// # 返回值
    /// - `Ok(PhysAddr)`：页对齐的物理页地址，内容为垃圾字节；
    /// - `Err(KallocError::OutOfMemory)`：所有链表均为空。
    pub fn kalloc(&self) -> Result<PhysAddr, KallocError> {
        let intr = IntrGuard::new();
        let id = unsafe { CpuManager::cpu_id() };
        let mut page = self.kmem[id].lock().pop();
        if page.is_none() {
            page = self.steal(id);
        }
        drop(intr);

        match page {
            Some(raw) => {
                let mut pa = unsafe { PhysAddr::from_raw(raw) };
                // fill with junk
                unsafe { ptr::write_bytes(pa.as_mut_ptr(), ALLOC_JUNK, PGSIZE) };
                Ok(pa)
            }
            None => {
                warn!("kalloc: out of memory on hart {}", id);
                Err(KallocError::OutOfMemory)
            }
        }
    }

    /// 从编号为 `id` 以外的 hart 窃取一页，调用时中断必须已关闭
    fn steal(&self, id: usize) -> Option<usize> {
        let (victim, raw) = (0..NCPU)
            .filter(|&other| other != id)
            .find_map(|other| self.kmem[other].lock().pop().map(|raw| (other, raw)))?;
        debug!("kalloc: hart {} stole page {:#x} from hart {}", id, raw, victim);
        Some(raw)
    }

    /// 所有 CPU 链表上的空闲页总数。
    ///
    /// 各链表依次加锁统计，并发分配或释放时结果只是一个近似值。
    pub fn nfree(&self) -> usize {
        (0..NCPU).map(|id| self.nfree_on(id)).sum()
    }

    /// 编号为 `id` 的 hart 链表上的空闲页数
    pub fn nfree_on(&self, id: usize) -> usize {
        self.kmem[id].lock().len()
    }

    /// 被管理的物理内存区间
    pub fn region(&self) -> &PhysRegion {
        &self.region
    }
}
