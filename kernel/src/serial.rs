use core::fmt::{self, Write};

use conquer_once::spin::Lazy;
use spin::Mutex;
use uart_16550::SerialPort;

use crate::output::{Level, LogSink};

/// COM1, the kernel's diagnostic console.
pub static SERIAL1: Lazy<Mutex<SerialPort>> = Lazy::new(|| {
    let mut serial_port = unsafe { SerialPort::new(0x3F8) };
    serial_port.init();
    Mutex::new(serial_port)
});

/// Log sink writing colored lines to [`SERIAL1`].
///
/// A line is dropped rather than waited for when the port is already held,
/// e.g. when an interrupt handler logs while the interrupted code was
/// mid-line.
pub struct SerialSink;

impl LogSink for SerialSink {
    fn write_line(&self, level: Level, args: fmt::Arguments<'_>) {
        if let Some(mut port) = SERIAL1.try_lock() {
            let _ = writeln!(port, "{} {}", level.tag(), args);
        }
    }
}

pub static SERIAL_SINK: SerialSink = SerialSink;

/// Routes the logging macros to COM1.
pub fn init_serial_logging() {
    crate::output::install_sink(&SERIAL_SINK);
}
