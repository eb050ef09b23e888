//! 自旋锁模块
//! 自旋锁将数据包裹在自身内部以保护这些数据。

use core::cell::UnsafeCell;
use core::hint;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut, Drop};
use core::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};

use crate::process::{pop_off, push_off, CpuManager};

/// 表示一个自旋锁结构，用于在多核环境下保护共享数据。
///
/// `SpinLock` 提供了互斥访问内部数据的能力，通过忙等待（busy-waiting）实现锁机制。
/// 获取锁之前会关闭当前 hart 的中断，释放后按嵌套计数恢复。
/// 该锁还跟踪持有者的执行上下文，用于发现重入与错误释放。
///
/// # 字段说明
/// - `lock`: 原子布尔值，表示锁的状态（`false`=未锁定，`true`=已锁定）；
/// - `name`: 锁的名称，用于调试和标识；
/// - `holder`: 当前持有锁的执行上下文（0 表示无人持有）；
/// - `data`: 被保护的数据，通过`UnsafeCell`实现内部可变性。
#[derive(Debug)]
pub struct SpinLock<T: ?Sized> {
    lock: AtomicBool,
    name: &'static str,
    holder: AtomicUsize,
    data: UnsafeCell<T>,
}

// 为SpinLock实现Sync trait，允许跨线程共享（要求T是Send）
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// 创建一个新的自旋锁实例。
    ///
    /// # 参数
    /// - `data`: 需要被保护的数据；
    /// - `name`: 锁的标识名称，用于调试。
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: AtomicBool::new(false),
            name,
            holder: AtomicUsize::new(0),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// 获取自旋锁并返回一个守卫对象。
    ///
    /// 守卫对象实现了`Deref`和`DerefMut`，允许直接访问被保护数据。
    /// 当守卫对象离开作用域时，自动释放锁。
    ///
    /// # 示例
    /// ```
    /// use xv6_kmem::spinlock::SpinLock;
    ///
    /// let lock = SpinLock::new(0, "test");
    /// {
    ///     let mut guard = lock.lock(); // 获取锁
    ///     *guard = 42; // 修改受保护数据
    /// } // 守卫离开作用域，自动释放锁
    /// assert_eq!(*lock.lock(), 42);
    /// ```
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.acquire();
        SpinLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
            _not_send: PhantomData,
        }
    }

    /// 检查当前执行上下文是否持有此锁。
    pub fn holding(&self) -> bool {
        self.lock.load(Ordering::Relaxed)
            && self.holder.load(Ordering::Relaxed) == CpuManager::context_id()
    }

    /// 锁的名称
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// 获取锁的核心实现（内部方法）。
    ///
    /// # 流程解释
    /// 1. 调用`push_off()`禁用中断；
    /// 2. 检查是否已持有锁（防止死锁）；
    /// 3. 使用原子比较交换（CAS）忙等待获取锁；
    /// 4. 获取成功后设置内存屏障；
    /// 5. 记录持有者。
    fn acquire(&self) {
        push_off();
        if self.holding() {
            panic!("spinlock {} acquire", self.name);
        }
        while self
            .lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            hint::spin_loop();
        }
        fence(Ordering::SeqCst);
        self.holder.store(CpuManager::context_id(), Ordering::Relaxed);
    }

    /// 释放锁的核心实现（内部方法），通过守卫的`Drop`调用。
    fn release(&self) {
        if !self.holding() {
            panic!("spinlock {} release", self.name);
        }
        self.holder.store(0, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        self.lock.store(false, Ordering::Release);
        pop_off();
    }
}

/// 自旋锁守卫对象，提供对受保护数据的访问。
///
/// 守卫离开作用域时自动释放锁。守卫必须在获取它的执行上下文中释放，
/// 因此不能跨线程传递。
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    data: &'a mut T,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T: ?Sized> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SpinLockGuard<'a, T> {
    /// 调用关联自旋锁的`release()`方法释放锁，
    /// 并恢复中断状态（通过`pop_off`）
    fn drop(&mut self) {
        self.lock.release();
    }
}
