//! 处理器状态管理，用于记录当前 hart 的编号与中断开关

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::consts::NCPU;
use crate::register::{sstatus, tp};

std::thread_local! {
    /// 当前执行上下文所在 hart 的中断嵌套状态。
    ///
    /// 宿主环境里一个线程就是一个执行上下文，关中断只影响本线程，
    /// 因此 `Cpu` 按线程保存，而不是按 hart 编号放在全局表里。
    static CPU: Cpu = const { Cpu::new() };

    /// 当前执行上下文的唯一标识，从 1 开始分配
    static CONTEXT: usize = NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed);
}

static NEXT_CONTEXT: AtomicUsize = AtomicUsize::new(1);

/// CPU 管理器，提供 hart 编号与执行上下文的查询。
pub struct CpuManager;

impl CpuManager {
    /// 必须在禁用中断的情况下调用，
    /// 以防止与进程被迁移到另一个 CPU 时出现竞争条件。
    #[inline]
    pub unsafe fn cpu_id() -> usize {
        tp::read()
    }

    /// 将当前线程绑定到编号为 `id` 的 hart。
    ///
    /// # 可能的错误
    /// `id` 不小于 `NCPU` 时触发 panic。
    pub fn bind_hart(id: usize) {
        if id >= NCPU {
            panic!("bind_hart: hart {} out of range", id);
        }
        unsafe { tp::write(id) };
    }

    /// 返回当前执行上下文的标识，锁用它记录持有者。
    ///
    /// 标识永不为 0，0 留给"无人持有"。
    #[inline]
    pub fn context_id() -> usize {
        CONTEXT.with(|c| *c)
    }

    /// 当前 hart 上 `push_off` 的嵌套层数
    pub fn noff() -> u8 {
        CPU.with(|c| c.noff.get())
    }
}

/// 单个执行上下文的中断嵌套状态
struct Cpu {
    /// 关闭中断的嵌套计数，表示当前中断被禁止的层数。
    /// 每调用一次 `push_off` 计数加 1，每调用一次 `pop_off` 计数减 1。
    noff: Cell<u8>,

    /// 中断使能标志，记录关闭中断之前的中断使能状态，
    /// 用于恢复中断使能。
    intena: Cell<bool>,
}

impl Cpu {
    const fn new() -> Self {
        Self {
            noff: Cell::new(0),
            intena: Cell::new(false),
        }
    }
}

/// # 功能说明
/// 关闭中断并增加嵌套计数，与 `pop_off()` 成对使用。
/// 只有最外层的 `push_off()` 会记录关闭前的中断状态。
pub fn push_off() {
    let old = sstatus::intr_get();
    sstatus::intr_off();
    CPU.with(|c| {
        if c.noff.get() == 0 {
            c.intena.set(old);
        }
        c.noff.set(c.noff.get() + 1);
    });
}

/// # 功能说明
/// 解除之前通过 `push_off()` 关闭的中断，
/// 通过嵌套计数控制中断恢复，
/// 只有所有嵌套的关闭操作都对应调用后，
/// 才真正重新开启中断。
///
/// # 可能的错误
/// - 调用时中断处于开启状态，触发 panic；
/// - 嵌套计数已为 0，触发 panic。
pub fn pop_off() {
    if sstatus::intr_get() {
        panic!("pop_off(): interruptable");
    }
    CPU.with(|c| {
        let noff = match c.noff.get().checked_sub(1) {
            Some(noff) => noff,
            None => panic!("pop_off(): count not match"),
        };
        c.noff.set(noff);
        if noff == 0 && c.intena.get() {
            sstatus::intr_on();
        }
    });
}

/// 关中断的 RAII 守卫，创建时调用 `push_off()`，析构时调用 `pop_off()`。
///
/// 守卫可以嵌套，且不能跨线程传递。
pub struct IntrGuard {
    _not_send: PhantomData<*const ()>,
}

impl IntrGuard {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        push_off();
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Default for IntrGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IntrGuard {
    fn drop(&mut self) {
        pop_off();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_off_nests() {
        assert!(sstatus::intr_get());
        push_off();
        push_off();
        assert_eq!(CpuManager::noff(), 2);
        pop_off();
        assert!(!sstatus::intr_get());
        pop_off();
        assert_eq!(CpuManager::noff(), 0);
        assert!(sstatus::intr_get());
    }

    #[test]
    fn push_off_keeps_interrupts_off_if_they_were_off() {
        sstatus::intr_off();
        {
            let _outer = IntrGuard::new();
            let _inner = IntrGuard::new();
        }
        assert!(!sstatus::intr_get());
        sstatus::intr_on();
    }

    #[test]
    #[should_panic(expected = "count not match")]
    fn unbalanced_pop_off() {
        sstatus::intr_off();
        pop_off();
    }

    #[test]
    #[should_panic(expected = "interruptable")]
    fn pop_off_with_interrupts_on() {
        pop_off();
    }

    #[test]
    fn bind_hart_sets_cpu_id() {
        CpuManager::bind_hart(NCPU - 1);
        let _g = IntrGuard::new();
        assert_eq!(unsafe { CpuManager::cpu_id() }, NCPU - 1);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn bind_hart_rejects_bad_id() {
        CpuManager::bind_hart(NCPU);
    }

    #[test]
    fn context_ids_are_distinct() {
        let here = CpuManager::context_id();
        let there = std::thread::spawn(CpuManager::context_id).join().unwrap();
        assert_ne!(here, 0);
        assert_ne!(here, there);
    }
}
