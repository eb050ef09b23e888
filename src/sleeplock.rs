//! 睡眠锁模块
//! 提供基于休眠/唤醒机制的同步原语，适用于可能长时间持有的锁。
//!
//! 当锁被占用时，尝试获取锁的线程会进入休眠状态，避免忙等待。

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut, Drop};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::process::CpuManager;

/// 睡眠锁结构，提供阻塞式同步机制
///
/// 与自旋锁不同，当锁被占用时，尝试获取的线程会在条件变量上休眠，
/// 直到锁被释放后被唤醒。
///
/// # 字段说明
/// - `lock`: 保护`locked`与持有者信息的短临界区互斥锁
/// - `wait`: 等待该睡眠锁的线程在此休眠
/// - `name`: 锁的标识名称，用于调试
/// - `data`: 被保护的数据，通过`UnsafeCell`实现内部可变性
pub struct SleepLock<T: ?Sized> {
    lock: Mutex<SleepState>,
    wait: Condvar,
    name: &'static str,
    data: UnsafeCell<T>,
}

struct SleepState {
    locked: bool,
    /// 持有者的执行上下文，未上锁时为 0
    holder: usize,
}

// 为SleepLock实现Sync，允许跨线程共享（要求T是Send）
unsafe impl<T: ?Sized + Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    /// 创建一个新的睡眠锁实例
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: Mutex::new(SleepState {
                locked: false,
                holder: 0,
            }),
            wait: Condvar::new(),
            name,
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SleepLock<T> {
    /// 获取睡眠锁（可能阻塞当前线程）
    ///
    /// # 流程解释
    /// 1. 获取内部互斥锁保护临界区
    /// 2. 检查`locked`状态：
    ///   - 如果已锁定：在条件变量上休眠，被唤醒后重新检查
    ///   - 如果未锁定：设置`locked=true`并记录持有者
    /// 3. 释放内部互斥锁并返回守卫
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let mut state = self.state();
        while state.locked {
            state = self
                .wait
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.locked = true;
        state.holder = CpuManager::context_id();
        drop(state);

        SleepLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    /// 检查当前执行上下文是否持有该睡眠锁
    pub fn holding(&self) -> bool {
        let state = self.state();
        state.locked && state.holder == CpuManager::context_id()
    }

    /// 锁的名称
    pub fn name(&self) -> &'static str {
        self.name
    }

    fn state(&self) -> MutexGuard<'_, SleepState> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 释放锁（内部方法，由守卫的Drop调用），唤醒一个等待者
    fn unlock(&self) {
        let mut state = self.state();
        state.locked = false;
        state.holder = 0;
        drop(state);
        self.wait.notify_one();
    }
}

/// 睡眠锁守卫，提供对受保护数据的访问
///
/// 守卫离开作用域时自动释放锁。
pub struct SleepLockGuard<'a, T: ?Sized> {
    lock: &'a SleepLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> SleepLockGuard<'a, T> {
    /// 检查当前执行上下文是否仍是该锁的持有者
    pub fn holding(&self) -> bool {
        self.lock.holding()
    }
}

impl<'a, T: ?Sized> Deref for SleepLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SleepLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SleepLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
