//! Serial debug sink.
//!
//! COM1 (I/O port 0x3F8) carries all `[SUBSYS]`-tagged diagnostics. The
//! UART is brought up on first use and sits behind a single interrupt-safe
//! lock; the `log` facade writes through the same sink, so every line of
//! serial output funnels through `SerialSink::with_port`.

use core::fmt::{self, Write};

use spin::Mutex;
use uart_16550::SerialPort;
use x86_64::instructions::interrupts;

const COM1_BASE: u16 = 0x3F8;

/// The one serial output sink.
struct SerialSink {
    port: Mutex<Option<SerialPort>>,
}

static SINK: SerialSink = SerialSink {
    port: Mutex::new(None),
};

impl SerialSink {
    /// Run `f` against the UART, initializing it on first use. Interrupts
    /// are disabled for the duration so an interrupt handler logging
    /// mid-line cannot deadlock on the port lock.
    fn with_port(&self, f: impl FnOnce(&mut SerialPort)) {
        interrupts::without_interrupts(|| {
            let mut guard = self.port.lock();
            let port = guard.get_or_insert_with(|| {
                // SAFETY: COM1_BASE is the standard COM1 register block.
                let mut port = unsafe { SerialPort::new(COM1_BASE) };
                port.init();
                port
            });
            f(port);
        });
    }

    fn write_fmt(&self, args: fmt::Arguments) {
        self.with_port(|port| {
            // Serial is the diagnostics channel of last resort; a failed
            // write has nowhere better to be reported.
            let _ = port.write_fmt(args);
        });
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    SINK.write_fmt(args);
}

/// `log` facade backend writing through the sink.
struct SerialLogger;

static LOGGER: SerialLogger = SerialLogger;

impl log::Log for SerialLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            SINK.write_fmt(format_args!("[{}] {}\n", record.level(), record.args()));
        }
    }

    fn flush(&self) {}
}

/// Install the serial logger as the `log` facade backend.
pub fn init_logger() {
    let _ = log::set_logger(&LOGGER).map(|()| log::set_max_level(log::LevelFilter::Info));
}
