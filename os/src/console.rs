//! Console output, for text printed by the kernel
//!
//! The kernel does not own a device; whoever embeds it registers a sink with
//! [`set_sink`]. Output printed before that is dropped.
use core::fmt::{self, Write};

use spin::Mutex;

/// Where console text ends up.
pub trait ConsoleSink: Sync {
    /// write str to the device
    fn write_str(&self, s: &str);
}

static SINK: Mutex<Option<&'static dyn ConsoleSink>> = Mutex::new(None);

/// Register the console device.
pub fn set_sink(sink: &'static dyn ConsoleSink) {
    *SINK.lock() = Some(sink);
}

struct Stdout<'a>(&'a dyn ConsoleSink);

impl Write for Stdout<'_> {
    /// write str to console
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

/// print to the console using the format string and arguments.
pub fn print(args: fmt::Arguments) {
    let sink = *SINK.lock();
    if let Some(sink) = sink {
        let _ = Stdout(sink).write_fmt(args);
    }
}

/// Print! macro to the console using the format string and arguments.
#[macro_export]
macro_rules! print {
    ($fmt: literal $(, $($arg: tt)+)?) => {
        $crate::console::print(format_args!($fmt $(, $($arg)+)?))
    }
}

/// Println! macro to the console using the format string and arguments.
#[macro_export]
macro_rules! println {
    ($fmt: literal $(, $($arg: tt)+)?) => {
        $crate::console::print(format_args!(concat!($fmt, "\n") $(, $($arg)+)?))
    }
}
