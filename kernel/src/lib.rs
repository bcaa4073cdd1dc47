//! IGNIS kernel library.
//!
//! A small 64-bit monolithic kernel for x86-64: physical and virtual memory
//! management, a buddy/slab/kmalloc allocator stack, a preemptive
//! round-robin scheduler, a driver registry, ATA and NVMe block drivers, a
//! line-discipline TTY and an in-RAM filesystem behind a VFS. This library
//! holds the whole kernel; the `ignis-kernel` binary is a thin boot shim
//! over it.

#![no_std]
#![cfg_attr(all(test, target_os = "none"), no_main)]
#![feature(custom_test_frameworks)]
#![feature(abi_x86_interrupt)]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]
// Custom test runner only for bare-metal; host builds use the standard
// harness machinery.
#![cfg_attr(target_os = "none", test_runner(crate::test_framework::test_runner))]
#![cfg_attr(target_os = "none", reexport_test_harness_main = "test_main")]

extern crate alloc;

// Host target: link std so test code can run under the system allocator.
#[cfg(not(target_os = "none"))]
extern crate std;

#[macro_use]
pub mod print;

pub mod arch;
pub mod console;
pub mod drivers;
pub mod error;
pub mod fs;
pub mod mm;
pub mod panic;
pub mod sched;
pub mod shell;
pub mod test_framework;
pub mod tty;

pub use error::KernelError;
pub use test_framework::{exit_qemu, test_panic_handler, QemuExitCode, Testable};

use bootloader_api::config::{BootloaderConfig, Mapping};

/// Boot contract: all physical memory direct-mapped at the fixed
/// higher-half base the kernel's memory model assumes.
pub static BOOTLOADER_CONFIG: BootloaderConfig = {
    let mut config = BootloaderConfig::new_default();
    config.mappings.physical_memory = Some(Mapping::FixedAddress(mm::DIRECT_MAP_BASE));
    config
};

// On bare metal the kernel's own kmalloc dispatch is the global allocator;
// host builds delegate to the system allocator.
#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: mm::kmalloc::KernelAllocator = mm::kmalloc::KernelAllocator;

#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

/// Heap allocation failure in a no_std kernel is unrecoverable.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("Allocation error: {:?}", layout);
}

// ---------------------------------------------------------------------------
// Bare-metal test kernel entry
// ---------------------------------------------------------------------------

#[cfg(all(test, target_os = "none"))]
mod test_boot {
    use bootloader_api::{entry_point, BootInfo};

    entry_point!(test_kernel_main, config = &crate::BOOTLOADER_CONFIG);

    fn test_kernel_main(_boot_info: &'static mut BootInfo) -> ! {
        crate::mm::init().expect("memory initialization failed");
        crate::test_main();
        loop {
            x86_64::instructions::hlt();
        }
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        crate::test_framework::test_panic_handler(info)
    }
}
