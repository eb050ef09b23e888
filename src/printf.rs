//! 定义内核的输出方法与日志后端

use std::fmt;
use std::io::{self, Write as _};

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

use crate::spinlock::SpinLock;

/// 零大小类型（ZST）的打印结构体，用于在多个 CPU 之间对打印操作进行排序。
struct Print;

impl fmt::Write for Print {
    /// 将字符串写入控制台（宿主环境下为标准错误）
    fn write_str(&mut self, s: &str) -> fmt::Result {
        io::stderr().write_all(s.as_bytes()).map_err(|_| fmt::Error)
    }
}

/// 核心打印函数（被宏调用）
///
/// 使用自旋锁保证多核输出不会交错。
///
/// # 注意
/// 此函数被声明为pub，因为需要在宏中调用
pub fn _print(args: fmt::Arguments<'_>) {
    use fmt::Write;
    static PRINT: SpinLock<()> = SpinLock::new((), "print");

    let guard = PRINT.lock();
    // 控制台不可写时无处报告，丢弃输出
    let _ = Print.write_fmt(args);
    drop(guard);
}

/// 在终端输出一串字符
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::printf::_print(format_args!($($arg)*));
    };
}

/// 在终端输出一行字符
#[macro_export]
macro_rules! println {
    () => {$crate::print!("\n")};
    ($fmt:expr) => {$crate::print!(concat!($fmt, "\n"))};
    ($fmt:expr, $($arg:tt)*) => {
        $crate::print!(concat!($fmt, "\n"), $($arg)*)
    };
}

/// `log` 门面的后端，每条记录输出为一行 `[LEVEL] target: message`
pub struct KernelLogger {
    max_level: LevelFilter,
}

impl KernelLogger {
    #[must_use]
    pub const fn new(max_level: LevelFilter) -> Self {
        Self { max_level }
    }
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        println!(
            "[{}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

/// 安装日志后端，启动时调用一次。
///
/// # 可能的错误
/// 已经安装过日志后端时返回 `SetLoggerError`。
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    let logger: &'static KernelLogger = Box::leak(Box::new(KernelLogger::new(level)));
    log::set_logger(logger)?;
    log::set_max_level(level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use log::Level;

    #[test]
    fn logger_filters_by_level() {
        let logger = KernelLogger::new(LevelFilter::Info);
        let info = Metadata::builder().level(Level::Info).build();
        let debug = Metadata::builder().level(Level::Debug).build();
        assert!(logger.enabled(&info));
        assert!(!logger.enabled(&debug));
    }

    #[test]
    fn init_only_once() {
        // 同一进程内的其他测试可能已经安装过
        let _ = init(LevelFilter::Warn);
        assert!(init(LevelFilter::Warn).is_err());
    }

    #[test]
    fn println_simo() {
        println!("printf: {} {}", "smoke", 1);
        print!("\n");
    }
}
