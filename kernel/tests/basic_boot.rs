//! Basic boot smoke tests for the IGNIS kernel.

#![no_std]
#![no_main]

use core::panic::PanicInfo;

use bootloader_api::{entry_point, BootInfo};
use ignis_kernel::{exit_qemu, serial_println, test_panic_handler, QemuExitCode};

entry_point!(test_main, config = &ignis_kernel::BOOTLOADER_CONFIG);

fn test_main(_boot_info: &'static mut BootInfo) -> ! {
    serial_println!("Starting basic boot tests...");

    test_serial_output();
    test_memory_bring_up();
    test_error_taxonomy();

    serial_println!("All tests passed!");
    exit_qemu(QemuExitCode::Success);
    loop {
        x86_64::instructions::hlt();
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    test_panic_handler(info)
}

fn test_serial_output() {
    serial_println!("test_serial_output output");
}

fn test_memory_bring_up() {
    ignis_kernel::mm::init().expect("memory initialization failed");

    let total = ignis_kernel::mm::pmm::total_pages();
    let expected = ((ignis_kernel::mm::PHYS_MEMORY_END - ignis_kernel::mm::PHYS_FREE_START)
        / ignis_kernel::mm::PAGE_SIZE as u64) as usize;
    assert_eq!(total, expected);

    // The buddy region was claimed from the PMM during bring-up.
    assert!(ignis_kernel::mm::pmm::used_pages() >= 1);

    serial_println!("Kernel memory is up: {} pages", total);
}

fn test_error_taxonomy() {
    use ignis_kernel::KernelError;
    assert_eq!(KernelError::NotFound.as_str(), "not found");
}
