//! Console print utilities.
//!
//! An environment does not own a serial port; it writes through whatever
//! [`Console`] was registered with [`set_console`] (normally the `cputs`
//! system call). Until a console is registered, output is dropped.

use core::fmt::Write;
use crossbeam_utils::atomic::AtomicCell;

/// A sink for console output.
pub trait Console: Sync {
    /// Write a string to the console.
    fn write_str(&self, s: &str);
}

static CONSOLE: AtomicCell<Option<&'static dyn Console>> = AtomicCell::new(None);

/// Register the console that receives all printed messages.
///
/// Returns the previously registered console, if any.
pub fn set_console(console: &'static dyn Console) -> Option<&'static dyn Console> {
    CONSOLE.swap(Some(console))
}

/// Unregister the console. Subsequent output is dropped.
pub fn clear_console() -> Option<&'static dyn Console> {
    CONSOLE.swap(None)
}

struct Sink(&'static dyn Console);

impl Write for Sink {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

#[doc(hidden)]
pub fn _print(fmt: core::fmt::Arguments<'_>) {
    if let Some(console) = CONSOLE.load() {
        let _ = write!(Sink(console), "{fmt}");
    }
}

/// Prints out the message.
///
/// Use the format! syntax to write data to the registered console.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::kprint::_print(format_args!($($arg)*)));
}

/// Prints out the message with a newline.
///
/// Use the format! syntax to write data to the registered console.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// Display an information message.
///
/// Suppressed while [`QUITE`](crate::QUITE) is set.
#[macro_export]
macro_rules! info {
    () => (if !$crate::QUITE.load(core::sync::atomic::Ordering::SeqCst) { $crate::print!("[INFO]\n") });
    ($($arg:tt)*) => (if !$crate::QUITE.load(core::sync::atomic::Ordering::SeqCst) { $crate::print!("[INFO] {}\n", format_args!($($arg)*)) });
}

/// Display a warning message.
///
/// Suppressed while [`QUITE`](crate::QUITE) is set.
#[macro_export]
macro_rules! warning {
    () => (if !$crate::QUITE.load(core::sync::atomic::Ordering::SeqCst) { $crate::print!("[WARN]\n") });
    ($($arg:tt)*) => (if !$crate::QUITE.load(core::sync::atomic::Ordering::SeqCst) { $crate::print!("[WARN] {}\n", format_args!($($arg)*)) });
}

/// Display a debug message.
///
/// Suppressed while [`QUITE`](crate::QUITE) is set.
#[macro_export]
macro_rules! debug {
    () => (if !$crate::QUITE.load(core::sync::atomic::Ordering::SeqCst) { $crate::print!("[DEBUG]\n") });
    ($($arg:tt)*) => (if !$crate::QUITE.load(core::sync::atomic::Ordering::SeqCst) { $crate::print!("[DEBUG] {}\n", format_args!($($arg)*))} );
}
