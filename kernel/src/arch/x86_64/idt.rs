//! Interrupt descriptor table and legacy PIC setup.
//!
//! The 8259 pair is remapped to vectors 0x20..0x2F; only IRQ0 (PIT) and
//! IRQ1 (keyboard) are unmasked. The timer handler acknowledges the PIC
//! first and then runs the scheduler tick, which may context switch away
//! and resume later inside the same handler frame.

use lazy_static::lazy_static;
use pic8259::ChainedPics;
use spin::Mutex;
use x86_64::instructions::port::Port;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use crate::drivers::{keyboard, pit};
use crate::error::KernelError;

pub const PIC_1_OFFSET: u8 = 0x20;
pub const PIC_2_OFFSET: u8 = 0x28;

/// Master mask 0xFC: IRQ0 and IRQ1 enabled, everything else (including the
/// cascade) masked. Slave fully masked.
const PIC_1_MASK: u8 = 0xFC;
const PIC_2_MASK: u8 = 0xFF;

pub static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum InterruptIndex {
    Timer = PIC_1_OFFSET,
    Keyboard,
}

impl InterruptIndex {
    fn as_u8(self) -> u8 {
        self as u8
    }
}

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_fault_handler);
        idt.double_fault.set_handler_fn(double_fault_handler);
        idt[InterruptIndex::Timer.as_u8()].set_handler_fn(timer_interrupt_handler);
        idt[InterruptIndex::Keyboard.as_u8()].set_handler_fn(keyboard_interrupt_handler);
        idt
    };
}

fn driver_init() -> Result<(), KernelError> {
    IDT.load();

    x86_64::instructions::interrupts::without_interrupts(|| {
        let mut pics = PICS.lock();
        // SAFETY: Remapping the PICs to non-conflicting vectors and masking
        // every line except PIT and keyboard.
        unsafe {
            pics.initialize();
            pics.write_masks(PIC_1_MASK, PIC_2_MASK);
        }
    });

    serial_println!("[IDT] Gates installed, PIC remapped to {:#x}", PIC_1_OFFSET);
    Ok(())
}

/// Put the IDT on the driver registry (priority 10; everything interrupt
/// driven depends on it by name).
pub fn register_driver() -> Result<(), KernelError> {
    crate::drivers::register(crate::drivers::Driver {
        name: "IDT",
        kind: crate::drivers::DriverKind::Fundamental,
        version: 1,
        priority: 10,
        status: crate::drivers::DriverStatus::Uninitialized,
        init: driver_init,
        cleanup: None,
        depends_on: None,
    })
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    println!("EXCEPTION: BREAKPOINT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    panic!("EXCEPTION: DOUBLE FAULT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    use x86_64::registers::control::Cr2;

    serial_println!("EXCEPTION: PAGE FAULT");
    serial_println!("Accessed Address: {:?}", Cr2::read());
    serial_println!("Error Code: {:?}", error_code);
    panic!("Page fault\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn general_protection_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    serial_println!("EXCEPTION: GENERAL PROTECTION FAULT, code {:#x}", error_code);
    panic!("General protection fault\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn timer_interrupt_handler(_stack_frame: InterruptStackFrame) {
    // EOI first: the scheduler tick below may switch to another task, and
    // the PIC must be able to deliver the next tick while it runs.
    // SAFETY: Acknowledging the interrupt we are currently servicing.
    unsafe {
        PICS.lock()
            .notify_end_of_interrupt(InterruptIndex::Timer.as_u8());
    }

    pit::handle_tick();
}

extern "x86-interrupt" fn keyboard_interrupt_handler(_stack_frame: InterruptStackFrame) {
    let mut port: Port<u8> = Port::new(0x60);
    // SAFETY: Reading the PS/2 data port consumes the pending scancode.
    let scancode = unsafe { port.read() };

    // SAFETY: Acknowledging the interrupt we are currently servicing.
    unsafe {
        PICS.lock()
            .notify_end_of_interrupt(InterruptIndex::Keyboard.as_u8());
    }

    keyboard::handle_scancode(scancode);
}
