//! Allocator-stack integration test: boots the memory subsystem and runs
//! alloc-heavy workloads through the global kmalloc dispatch.

#![no_std]
#![no_main]

extern crate alloc;

use core::panic::PanicInfo;

use alloc::{boxed::Box, vec, vec::Vec};
use bootloader_api::{entry_point, BootInfo};
use ignis_kernel::mm::{buddy, kmalloc};
use ignis_kernel::{exit_qemu, serial_println, test_panic_handler, QemuExitCode};

entry_point!(test_main, config = &ignis_kernel::BOOTLOADER_CONFIG);

fn test_main(_boot_info: &'static mut BootInfo) -> ! {
    serial_println!("Starting heap tests...");

    ignis_kernel::mm::init().expect("memory initialization failed");

    test_box_round_trip();
    test_vec_growth();
    test_large_allocation();
    test_buddy_merge_cycle();

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

fn test_box_round_trip() {
    let value = Box::new(41u64);
    assert_eq!(*value + 1, 42);
    serial_println!("test_box_round_trip [ok]");
}

fn test_vec_growth() {
    let mut values = Vec::new();
    for i in 0..1000u64 {
        values.push(i);
    }
    assert_eq!(values.iter().sum::<u64>(), 499_500);
    serial_println!("test_vec_growth [ok]");
}

fn test_large_allocation() {
    // One megabyte routes through the buddy path.
    let used_before = buddy::used_memory();
    let buffer = vec![0xA5u8; 1024 * 1024];
    assert!(buffer.iter().all(|&b| b == 0xA5));
    drop(buffer);
    assert_eq!(buddy::used_memory(), used_before);
    serial_println!("test_large_allocation [ok]");
}

fn test_buddy_merge_cycle() {
    let merges_before = buddy::merges();

    let a = kmalloc::alloc_pages(1);
    let b = kmalloc::alloc_pages(1);
    assert!(!a.is_null() && !b.is_null());

    kmalloc::free_pages(b, 1);
    kmalloc::free_pages(a, 1);

    assert!(buddy::merges() > merges_before);
    assert!(buddy::verify_invariants());
    serial_println!("test_buddy_merge_cycle [ok]");
}
