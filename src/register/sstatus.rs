//! 监督状态寄存器 (sstatus) 操作模块

use std::cell::Cell;

use bit_field::BitField;

const SIE: usize = 1; // supervisor interrupt enable

std::thread_local! {
    /// 每个 hart 启动时中断处于开启状态
    static SSTATUS: Cell<usize> = const { Cell::new(1 << SIE) };
}

/// 读取 sstatus 寄存器的当前值
#[inline]
pub fn read() -> usize {
    SSTATUS.with(Cell::get)
}

/// 写入 sstatus 寄存器
///
/// # 注意事项
/// 直接修改整个寄存器可能影响多个状态位，
/// 建议使用特定功能函数进行部分修改
#[inline]
pub fn write(x: usize) {
    SSTATUS.with(|r| r.set(x));
}

/// 启用监督模式全局中断 (SIE)
#[inline]
pub fn intr_on() {
    let mut x = read();
    x.set_bit(SIE, true);
    write(x);
}

/// 禁用监督模式全局中断 (SIE)
///
/// # 使用场景
/// 进入关键代码段前：
/// ```
/// use xv6_kmem::register::sstatus;
///
/// sstatus::intr_off();
/// assert!(!sstatus::intr_get());
/// sstatus::intr_on();
/// ```
#[inline]
pub fn intr_off() {
    let mut x = read();
    x.set_bit(SIE, false);
    write(x);
}

/// 检查全局中断是否已启用
///
/// # 返回值
/// - `true`: 中断已启用 (SIE = 1)
/// - `false`: 中断已禁用 (SIE = 0)
#[inline]
pub fn intr_get() -> bool {
    read().get_bit(SIE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupts_start_enabled() {
        assert!(intr_get());
    }

    #[test]
    fn intr_off_clears_only_sie() {
        write(read() | (1 << 8));
        intr_off();
        assert!(!intr_get());
        assert_eq!(read(), 1 << 8);
        intr_on();
        assert!(intr_get());
    }

    #[test]
    fn state_is_per_thread() {
        intr_off();
        let other = std::thread::spawn(intr_get).join().unwrap();
        assert!(other);
        assert!(!intr_get());
        intr_on();
    }
}
