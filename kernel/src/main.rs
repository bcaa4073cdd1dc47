//! IGNIS kernel binary: boot entry and bring-up order.

#![no_std]
#![no_main]

use core::panic::PanicInfo;

use bootloader_api::{entry_point, BootInfo};
use ignis_kernel::{arch, console, drivers, fs, mm, println, sched, shell, tty};

entry_point!(kernel_main, config = &ignis_kernel::BOOTLOADER_CONFIG);

fn kernel_main(_boot_info: &'static mut BootInfo) -> ! {
    console::init(&console::VGA_BACKEND).expect("console init failed");
    console::clear();

    println!("Welcome!");
    console::puts_color(
        concat!("IGNIS v", env!("CARGO_PKG_VERSION"), "\n"),
        console::ColorAttr::new(console::Color::Red, console::Color::Black),
    );
    console::puts_color(
        "---- A 64-bit monolithic kernel ----\n\n",
        console::ColorAttr::new(console::Color::LightBlue, console::Color::Black),
    );

    arch::x86_64::serial::init_logger();
    log::info!("IGNIS kernel starting");

    mm::init().expect("memory initialization failed");
    sched::init().expect("scheduler initialization failed");
    tty::init().expect("tty initialization failed");

    fs::init().expect("vfs initialization failed");
    fs::mount(fs::ramfs::RamFs::new(), "/").expect("ramfs mount failed");

    arch::x86_64::idt::register_driver().expect("driver registration failed");
    drivers::pit::register_driver().expect("driver registration failed");
    drivers::keyboard::register_driver().expect("driver registration failed");
    drivers::block::register_driver().expect("driver registration failed");
    drivers::nvme::register_driver().expect("driver registration failed");
    drivers::ata::register_driver().expect("driver registration failed");

    drivers::init_all();

    sched::spawn("shell", shell::shell_task).expect("shell spawn failed");

    console::puts_color("Ready! System is running.\n\n", console::SUCCESS);
    log::info!("bring-up complete");

    x86_64::instructions::interrupts::enable();

    // The boot thread becomes the idle task from the first context switch
    // onward.
    loop {
        x86_64::instructions::hlt();
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    ignis_kernel::panic::panic_screen(info)
}
