//! 侵入式单向空闲页链表

use core::ptr;

/// 空闲页链表节点，直接存放在空闲页的起始处
///
/// # 内存布局
/// - `#[repr(C)]` 确保C兼容内存布局
/// - 节点只占用页的前 `size_of::<Run>()` 字节
#[repr(C)]
struct Run {
    next: *mut Run,
}

/// 单向空闲页链表，在表头压入和弹出（后进先出）
///
/// # 安全说明
/// - 链表不拥有页内存，只是把空闲页本身当作节点串起来
/// - 所有访问都应在对应的自旋锁保护下进行
pub struct FreeList {
    head: *mut Run,
    len: usize,
}

// 链表只在 SpinLock 内部使用，裸指针只在持锁时访问
unsafe impl Send for FreeList {}

impl FreeList {
    pub const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            len: 0,
        }
    }

    /// 将地址为 `raw_addr` 的空闲页压入表头
    ///
    /// # 安全性
    /// - `raw_addr` 必须指向可写、按 `Run` 对齐的内存
    /// - 该页在弹出之前不得被其他人访问
    pub unsafe fn push(&mut self, raw_addr: usize) {
        let run = raw_addr as *mut Run;
        ptr::write(run, Run { next: self.head });
        self.head = run;
        self.len += 1;
    }

    /// 从表头弹出一页，返回其地址
    pub fn pop(&mut self) -> Option<usize> {
        if self.head.is_null() {
            return None;
        }
        let run = self.head;
        // push 写入的节点在弹出之前一直有效
        self.head = unsafe { (*run).next };
        self.len -= 1;
        Some(run as usize)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }
}
