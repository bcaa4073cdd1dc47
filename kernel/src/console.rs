//! Console abstraction.
//!
//! A polymorphic text sink with a pluggable back-end. The kernel talks to
//! `ConsoleBackend` trait objects only; the VGA text mode implementation
//! below is the default back-end, and the serial port can stand in for it
//! when VGA is unavailable.

use core::fmt;

use spin::RwLock;

use crate::arch::x86_64::vga;
use crate::error::KernelError;

/// Back-end agnostic console colors (VGA palette numbering).
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Color {
    Black = 0,
    Blue = 1,
    Green = 2,
    Cyan = 3,
    Red = 4,
    Magenta = 5,
    Brown = 6,
    LightGray = 7,
    DarkGray = 8,
    LightBlue = 9,
    LightGreen = 10,
    LightCyan = 11,
    LightRed = 12,
    Pink = 13,
    Yellow = 14,
    White = 15,
}

/// Foreground/background attribute pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorAttr {
    pub foreground: Color,
    pub background: Color,
}

impl ColorAttr {
    pub const fn new(foreground: Color, background: Color) -> Self {
        Self {
            foreground,
            background,
        }
    }
}

pub const DEFAULT: ColorAttr = ColorAttr::new(Color::White, Color::Black);
pub const SUCCESS: ColorAttr = ColorAttr::new(Color::Green, Color::Black);
pub const FAILURE: ColorAttr = ColorAttr::new(Color::Red, Color::Black);
pub const WARNING: ColorAttr = ColorAttr::new(Color::Yellow, Color::Black);
pub const INFO: ColorAttr = ColorAttr::new(Color::LightCyan, Color::Black);

/// Operations a console back-end must provide.
pub trait ConsoleBackend: Send + Sync {
    fn clear(&self);
    fn putc(&self, c: u8);
    fn puts(&self, s: &str) {
        for byte in s.bytes() {
            self.putc(byte);
        }
    }
    fn set_color(&self, color: ColorAttr);
    fn get_color(&self) -> ColorAttr;
    fn backspace(&self, count: usize);
}

static BACKEND: RwLock<Option<&'static dyn ConsoleBackend>> = RwLock::new(None);

/// Install a console back-end. Must run before the first `println!`.
pub fn init(backend: &'static dyn ConsoleBackend) -> Result<(), KernelError> {
    *BACKEND.write() = Some(backend);
    Ok(())
}

pub fn clear() {
    if let Some(backend) = *BACKEND.read() {
        backend.clear();
    }
}

pub fn putc(c: u8) {
    if let Some(backend) = *BACKEND.read() {
        backend.putc(c);
    }
}

pub fn puts(s: &str) {
    if let Some(backend) = *BACKEND.read() {
        backend.puts(s);
    }
}

/// Print with a temporary color, restoring the previous attribute after.
pub fn puts_color(s: &str, color: ColorAttr) {
    if let Some(backend) = *BACKEND.read() {
        let saved = backend.get_color();
        backend.set_color(color);
        backend.puts(s);
        backend.set_color(saved);
    }
}

pub fn set_color(color: ColorAttr) {
    if let Some(backend) = *BACKEND.read() {
        backend.set_color(color);
    }
}

pub fn get_color() -> ColorAttr {
    match *BACKEND.read() {
        Some(backend) => backend.get_color(),
        None => DEFAULT,
    }
}

pub fn backspace(count: usize) {
    if let Some(backend) = *BACKEND.read() {
        backend.backspace(count);
    }
}

/// Report a failure to the operator in the failure color.
pub fn perror(err: KernelError) {
    puts_color(err.as_str(), FAILURE);
    putc(b'\n');
}

struct ConsoleWriter;

impl fmt::Write for ConsoleWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        puts(s);
        Ok(())
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;

    // Fall back to the serial sink until a console back-end is installed so
    // early boot output is never lost.
    if BACKEND.read().is_none() {
        crate::arch::x86_64::serial::_print(args);
        return;
    }
    ConsoleWriter.write_fmt(args).expect("console write failed");
}

// ---------------------------------------------------------------------------
// VGA back-end
// ---------------------------------------------------------------------------

/// Console back-end over the VGA scrollback writer.
pub struct VgaBackend;

pub static VGA_BACKEND: VgaBackend = VgaBackend;

fn color_code(attr: ColorAttr) -> vga::ColorCode {
    vga::ColorCode::new(attr.foreground as u8, attr.background as u8)
}

fn color_from_nibble(value: u8) -> Color {
    // Palette numbering is shared with the VGA back-end, so the nibble maps
    // directly onto the enum.
    match value & 0x0F {
        0 => Color::Black,
        1 => Color::Blue,
        2 => Color::Green,
        3 => Color::Cyan,
        4 => Color::Red,
        5 => Color::Magenta,
        6 => Color::Brown,
        7 => Color::LightGray,
        8 => Color::DarkGray,
        9 => Color::LightBlue,
        10 => Color::LightGreen,
        11 => Color::LightCyan,
        12 => Color::LightRed,
        13 => Color::Pink,
        14 => Color::Yellow,
        _ => Color::White,
    }
}

impl ConsoleBackend for VgaBackend {
    fn clear(&self) {
        x86_64::instructions::interrupts::without_interrupts(|| {
            vga::WRITER.lock().clear();
        });
    }

    fn putc(&self, c: u8) {
        x86_64::instructions::interrupts::without_interrupts(|| {
            let mut writer = vga::WRITER.lock();
            writer.write_byte(c);
            writer.refresh();
        });
    }

    fn puts(&self, s: &str) {
        x86_64::instructions::interrupts::without_interrupts(|| {
            let mut writer = vga::WRITER.lock();
            writer.write_string(s);
            writer.refresh();
        });
    }

    fn set_color(&self, color: ColorAttr) {
        x86_64::instructions::interrupts::without_interrupts(|| {
            vga::WRITER.lock().set_color(color_code(color));
        });
    }

    fn get_color(&self) -> ColorAttr {
        x86_64::instructions::interrupts::without_interrupts(|| {
            let code = vga::WRITER.lock().color();
            ColorAttr::new(
                color_from_nibble(code.foreground()),
                color_from_nibble(code.background()),
            )
        })
    }

    fn backspace(&self, count: usize) {
        x86_64::instructions::interrupts::without_interrupts(|| {
            let mut writer = vga::WRITER.lock();
            writer.backspace(count);
            writer.refresh();
        });
    }
}
