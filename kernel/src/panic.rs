//! Kernel panic screen.
//!
//! Writes directly to the VGA buffer (bypassing the console, which may be
//! the thing that broke), mirrors the report to the serial log, and halts.
//! A reentry guard turns a panic inside the panic path into a bare halt.

use core::fmt::{self, Write};
use core::panic::PanicInfo;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::drivers::pit;
use crate::mm::{self, phys_to_virt, pmm, PhysAddr};

static PANIC_IN_PROGRESS: AtomicBool = AtomicBool::new(false);

const VGA_WIDTH: usize = 80;
const VGA_HEIGHT: usize = 25;

const BG: u8 = 1; // blue
const FG: u8 = 15; // white
const HEADER_FG: u8 = 11; // light cyan
const ERROR_FG: u8 = 12; // light red

/// Raw cell writer over the hardware buffer.
struct PanicVga {
    row: usize,
    col: usize,
    fg: u8,
}

impl PanicVga {
    fn buffer() -> *mut u16 {
        phys_to_virt(PhysAddr::new(0xB8000)).as_mut_ptr()
    }

    fn clear() {
        let blank = ((BG as u16) << 12) | ((FG as u16) << 8) | b' ' as u16;
        for i in 0..VGA_WIDTH * VGA_HEIGHT {
            // SAFETY: i < 80*25 stays inside the VGA text buffer.
            unsafe { Self::buffer().add(i).write_volatile(blank) };
        }
    }

    fn putc(&mut self, c: u8) {
        if c == b'\n' {
            self.col = 0;
            self.row = (self.row + 1).min(VGA_HEIGHT - 1);
            return;
        }
        if self.col >= VGA_WIDTH {
            self.col = 0;
            self.row = (self.row + 1).min(VGA_HEIGHT - 1);
        }

        let cell = ((BG as u16) << 12) | ((self.fg as u16) << 8) | c as u16;
        let pos = self.row * VGA_WIDTH + self.col;
        // SAFETY: pos < 80*25 by the clamping above.
        unsafe { Self::buffer().add(pos).write_volatile(cell) };
        self.col += 1;
    }
}

impl Write for PanicVga {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.putc(if byte.is_ascii() { byte } else { b'?' });
        }
        Ok(())
    }
}

fn read_registers() -> (u64, u64) {
    let (rsp, rbp): (u64, u64);
    // SAFETY: Reading RSP and RBP has no side effects.
    unsafe {
        core::arch::asm!("mov {}, rsp", "mov {}, rbp", out(reg) rsp, out(reg) rbp);
    }
    (rsp, rbp)
}

/// Paint the panic screen and halt forever.
pub fn panic_screen(info: &PanicInfo) -> ! {
    x86_64::instructions::interrupts::disable();

    if PANIC_IN_PROGRESS.swap(true, Ordering::SeqCst) {
        // Panic inside the panic path: nothing left to report with.
        crate::arch::halt();
    }

    serial_println!("\n[PANIC] {}", info);

    let (rsp, rbp) = read_registers();
    let ticks = pit::ticks();
    let seconds = ticks / pit::TICK_RATE_HZ as u64;

    PanicVga::clear();
    let mut vga = PanicVga {
        row: 1,
        col: 0,
        fg: HEADER_FG,
    };

    let _ = writeln!(vga, "  ========================================");
    let _ = writeln!(vga, "  ||                                    ||");
    let _ = writeln!(vga, "  ||      KERNEL PANIC - IGNIS OS       ||");
    let _ = writeln!(vga, "  ||                                    ||");
    let _ = writeln!(vga, "  ========================================");
    let _ = writeln!(vga);

    vga.fg = ERROR_FG;
    let _ = writeln!(vga, "  {}", info.message());
    if let Some(location) = info.location() {
        let _ = writeln!(vga, "  at {}:{}", location.file(), location.line());
    }
    let _ = writeln!(vga);

    vga.fg = FG;
    let _ = writeln!(
        vga,
        "  System Uptime: {}h {}m {}s",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    );
    let _ = writeln!(
        vga,
        "  Free Memory:   {} KB / {} KB",
        pmm::free_memory() / 1024,
        pmm::total_memory() / 1024
    );
    let _ = writeln!(vga);
    let _ = writeln!(vga, "  Register Dump:");
    let _ = writeln!(vga, "    RSP: {:#018x}", rsp);
    let _ = writeln!(vga, "    RBP: {:#018x}", rbp);
    let _ = writeln!(vga);
    let _ = writeln!(vga, "  System halted.");

    serial_println!(
        "[PANIC] uptime {}s, rsp {:#x}, rbp {:#x}, {} KB free",
        seconds,
        rsp,
        rbp,
        mm::pmm::free_memory() / 1024
    );

    crate::arch::halt();
}
