//! Programmable Interval Timer.
//!
//! Channel 0 in rate-generator mode at 100 Hz. Every tick bumps the global
//! counter, drives the scheduler, and fires the optional tick callback.

use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;
use x86_64::instructions::port::Port;

use super::{Driver, DriverKind, DriverStatus};
use crate::error::KernelError;

const PIT_INPUT_HZ: u32 = 1_193_182;

/// Tick rate the kernel runs at.
pub const TICK_RATE_HZ: u32 = 100;

const PIT_CHANNEL0: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;

/// Channel 0, lobyte/hibyte access, rate generator.
const PIT_MODE_RATE_GENERATOR: u8 = 0x36;

static TICKS: AtomicU64 = AtomicU64::new(0);
static CALLBACK: Mutex<Option<fn()>> = Mutex::new(None);

fn driver_init() -> Result<(), KernelError> {
    let divisor = (PIT_INPUT_HZ / TICK_RATE_HZ).clamp(1, 65535);

    let mut command: Port<u8> = Port::new(PIT_COMMAND);
    let mut data: Port<u8> = Port::new(PIT_CHANNEL0);

    // SAFETY: Programming PIT channel 0; the command byte selects the
    // lobyte/hibyte sequence the two data writes then complete.
    unsafe {
        command.write(PIT_MODE_RATE_GENERATOR);
        data.write((divisor & 0xFF) as u8);
        data.write((divisor >> 8) as u8);
    }

    TICKS.store(0, Ordering::SeqCst);
    serial_println!("[PIT] Configured for {} Hz", TICK_RATE_HZ);
    Ok(())
}

/// Put the PIT on the driver registry (priority 20, after the IDT).
pub fn register_driver() -> Result<(), KernelError> {
    super::register(Driver {
        name: "PIT",
        kind: DriverKind::Timer,
        version: 1,
        priority: 20,
        status: DriverStatus::Uninitialized,
        init: driver_init,
        cleanup: None,
        depends_on: Some("IDT"),
    })
}

/// Install a callback invoked on every timer tick.
pub fn set_callback(callback: Option<fn()>) {
    x86_64::instructions::interrupts::without_interrupts(|| {
        *CALLBACK.lock() = callback;
    });
}

/// Ticks since boot.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Whole seconds since boot.
pub fn uptime_seconds() -> u64 {
    ticks() / TICK_RATE_HZ as u64
}

/// Timer interrupt body. Runs in IRQ0 context with interrupts disabled; the
/// scheduler tick below may context switch away and resume here later.
pub fn handle_tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);

    crate::sched::tick();

    let callback = *CALLBACK.lock();
    if let Some(callback) = callback {
        callback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn divisor_is_in_range() {
        let divisor = PIT_INPUT_HZ / TICK_RATE_HZ;
        assert!(divisor >= 1 && divisor <= 65535);
    }

    #[test_case]
    fn ticks_are_monotonic() {
        let a = ticks();
        let b = ticks();
        assert!(b >= a);
    }
}
