//! Custom test framework for the bare-metal test kernel.
//!
//! `#[test_case]` functions are collected by the custom test runner, which
//! reports over serial and exits QEMU through the isa-debug-exit device.

use core::panic::PanicInfo;

/// Anything runnable as a test case.
pub trait Testable {
    fn run(&self);
}

impl<T> Testable for T
where
    T: Fn(),
{
    fn run(&self) {
        serial_print!("{}...\t", core::any::type_name::<T>());
        self();
        serial_println!("[ok]");
    }
}

pub fn test_runner(tests: &[&dyn Testable]) {
    serial_println!("Running {} tests", tests.len());
    for test in tests {
        test.run();
    }
    exit_qemu(QemuExitCode::Success);
}

pub fn test_panic_handler(info: &PanicInfo) -> ! {
    serial_println!("[failed]");
    serial_println!("Error: {}", info);
    exit_qemu(QemuExitCode::Failed);
    // exit_qemu only returns when the isa-debug-exit device is absent.
    loop {
        x86_64::instructions::hlt();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    Success = 0x10,
    Failed = 0x11,
}

/// Exit QEMU via the isa-debug-exit device at port 0xF4.
pub fn exit_qemu(exit_code: QemuExitCode) {
    use x86_64::instructions::port::Port;

    // SAFETY: Writing the exit code to the debug-exit port; on real
    // hardware the write is ignored.
    unsafe {
        let mut port = Port::new(0xF4);
        port.write(exit_code as u32);
    }
}
