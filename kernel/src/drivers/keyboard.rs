//! PS/2 keyboard driver.
//!
//! The IRQ1 handler reads a scancode from port 0x60 and feeds it through the
//! `pc_keyboard` decoder (scancode set 1, US layout, shift and modifier
//! tracking included). Decoded ASCII bytes are delivered to the TTY line
//! discipline.

use pc_keyboard::{layouts, DecodedKey, HandleControl, Keyboard, ScancodeSet1};
use spin::Mutex;

use super::{Driver, DriverKind, DriverStatus};
use crate::error::KernelError;

static KEYBOARD: Mutex<Option<Keyboard<layouts::Us104Key, ScancodeSet1>>> = Mutex::new(None);

fn driver_init() -> Result<(), KernelError> {
    let keyboard = Keyboard::new(
        ScancodeSet1::new(),
        layouts::Us104Key,
        HandleControl::Ignore,
    );
    *KEYBOARD.lock() = Some(keyboard);
    Ok(())
}

/// Put the keyboard on the driver registry (priority 20, after the IDT).
pub fn register_driver() -> Result<(), KernelError> {
    super::register(Driver {
        name: "Keyboard",
        kind: DriverKind::Input,
        version: 1,
        priority: 20,
        status: DriverStatus::Uninitialized,
        init: driver_init,
        cleanup: None,
        depends_on: Some("IDT"),
    })
}

/// Decode one scancode and deliver the resulting character to the TTY.
///
/// Runs in IRQ1 context with interrupts disabled; key releases and
/// modifier-only events decode to nothing and are dropped here.
pub fn handle_scancode(scancode: u8) {
    let mut guard = KEYBOARD.lock();
    let Some(keyboard) = guard.as_mut() else {
        return;
    };

    if let Ok(Some(key_event)) = keyboard.add_byte(scancode) {
        if let Some(DecodedKey::Unicode(ch)) = keyboard.process_keyevent(key_event) {
            if ch.is_ascii() {
                // Enter decodes as carriage return on set 1; the line
                // discipline works in newlines.
                let byte = if ch == '\r' { b'\n' } else { ch as u8 };
                crate::tty::input_char(byte);
            }
        }
    }
}
