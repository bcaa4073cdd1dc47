//! VGA text-mode back-end.
//!
//! Writes go into an 80-column virtual scrollback ring; the visible window is
//! the last 25 lines, flushed to the hardware buffer at 0xB8000 with
//! dirty-line tracking so a refresh only rewrites rows that changed.

use core::{fmt, ptr::write_volatile};

use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::instructions::port::Port;

/// VGA text-mode color palette. Not all variants are used but the full
/// 16-color palette is defined per the VGA specification.
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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct ColorCode(u8);

impl ColorCode {
    pub const fn new(foreground: u8, background: u8) -> ColorCode {
        ColorCode((background << 4) | (foreground & 0x0F))
    }

    pub const fn foreground(self) -> u8 {
        self.0 & 0x0F
    }

    pub const fn background(self) -> u8 {
        self.0 >> 4
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
struct ScreenChar {
    ascii_character: u8,
    color_code: ColorCode,
}

const BLANK: ScreenChar = ScreenChar {
    ascii_character: b' ',
    color_code: ColorCode::new(Color::White as u8, Color::Black as u8),
};

const BLANK_LINE: [ScreenChar; BUFFER_WIDTH] = [BLANK; BUFFER_WIDTH];

pub const BUFFER_HEIGHT: usize = 25;
pub const BUFFER_WIDTH: usize = 80;

/// Virtual scrollback depth in lines. The hardware buffer shows the last
/// `BUFFER_HEIGHT` of these.
pub const SCROLLBACK_LINES: usize = 200;

#[repr(transparent)]
struct Buffer {
    chars: [[ScreenChar; BUFFER_WIDTH]; BUFFER_HEIGHT],
}

pub struct Writer {
    /// Absolute index of the line the cursor is on (monotonically increasing;
    /// ring slot is `line % SCROLLBACK_LINES`).
    cursor_line: usize,
    column_position: usize,
    color_code: ColorCode,
    scrollback: [[ScreenChar; BUFFER_WIDTH]; SCROLLBACK_LINES],
    /// Dirty flags for the visible window rows.
    dirty: [bool; BUFFER_HEIGHT],
    buffer: &'static mut Buffer,
}

impl Writer {
    /// Absolute line shown on visible row `row`, if any line maps there yet.
    fn line_for_row(&self, row: usize) -> Option<usize> {
        let first = (self.cursor_line + 1).saturating_sub(BUFFER_HEIGHT);
        let line = first + row;
        if line <= self.cursor_line {
            Some(line)
        } else {
            None
        }
    }

    fn cursor_row(&self) -> usize {
        self.cursor_line.min(BUFFER_HEIGHT - 1)
    }

    pub fn set_color(&mut self, color: ColorCode) {
        self.color_code = color;
    }

    pub fn color(&self) -> ColorCode {
        self.color_code
    }

    pub fn write_byte(&mut self, byte: u8) {
        match byte {
            b'\n' => self.new_line(),
            byte => {
                if self.column_position >= BUFFER_WIDTH {
                    self.new_line();
                }

                let slot = self.cursor_line % SCROLLBACK_LINES;
                self.scrollback[slot][self.column_position] = ScreenChar {
                    ascii_character: byte,
                    color_code: self.color_code,
                };
                self.dirty[self.cursor_row()] = true;
                self.column_position += 1;
            }
        }
    }

    fn new_line(&mut self) {
        self.cursor_line += 1;
        self.column_position = 0;

        let slot = self.cursor_line % SCROLLBACK_LINES;
        self.scrollback[slot] = [BLANK; BUFFER_WIDTH];

        // The window slid by one line, every visible row changed.
        if self.cursor_line >= BUFFER_HEIGHT {
            self.dirty = [true; BUFFER_HEIGHT];
        } else {
            self.dirty[self.cursor_row()] = true;
        }
    }

    /// Erase up to `count` characters before the cursor on the current line.
    pub fn backspace(&mut self, count: usize) {
        let slot = self.cursor_line % SCROLLBACK_LINES;
        for _ in 0..count {
            if self.column_position == 0 {
                break;
            }
            self.column_position -= 1;
            self.scrollback[slot][self.column_position] = ScreenChar {
                ascii_character: b' ',
                color_code: self.color_code,
            };
        }
        self.dirty[self.cursor_row()] = true;
    }

    pub fn write_string(&mut self, s: &str) {
        for byte in s.bytes() {
            match byte {
                0x20..=0x7e | b'\n' => self.write_byte(byte),
                _ => self.write_byte(0xfe),
            }
        }
    }

    pub fn clear(&mut self) {
        self.scrollback = [[BLANK; BUFFER_WIDTH]; SCROLLBACK_LINES];
        self.cursor_line = 0;
        self.column_position = 0;
        self.dirty = [true; BUFFER_HEIGHT];
        self.refresh();
    }

    /// Copy dirty rows of the visible window into the hardware buffer and
    /// move the hardware cursor.
    pub fn refresh(&mut self) {
        for row in 0..BUFFER_HEIGHT {
            if !self.dirty[row] {
                continue;
            }

            let source = match self.line_for_row(row) {
                Some(line) => &self.scrollback[line % SCROLLBACK_LINES],
                None => &BLANK_LINE,
            };

            for col in 0..BUFFER_WIDTH {
                // SAFETY: The VGA buffer is memory-mapped I/O reached through
                // the direct map; write_volatile keeps the store from being
                // elided. Row < BUFFER_HEIGHT and col < BUFFER_WIDTH.
                unsafe {
                    write_volatile(&mut self.buffer.chars[row][col], source[col]);
                }
            }
            self.dirty[row] = false;
        }

        self.move_hardware_cursor();
    }

    fn move_hardware_cursor(&self) {
        let pos = (self.cursor_row() * BUFFER_WIDTH + self.column_position.min(BUFFER_WIDTH - 1))
            as u16;
        let mut index: Port<u8> = Port::new(0x3D4);
        let mut data: Port<u8> = Port::new(0x3D5);
        // SAFETY: CRT controller index/data ports; writing the cursor location
        // registers (0x0E high byte, 0x0F low byte) has no other side effect.
        unsafe {
            index.write(0x0Fu8);
            data.write((pos & 0xFF) as u8);
            index.write(0x0Eu8);
            data.write((pos >> 8) as u8);
        }
    }
}

impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_string(s);
        Ok(())
    }
}

lazy_static! {
    pub static ref WRITER: Mutex<Writer> = Mutex::new(Writer {
        cursor_line: 0,
        column_position: 0,
        color_code: ColorCode::new(Color::White as u8, Color::Black as u8),
        scrollback: [[BLANK; BUFFER_WIDTH]; SCROLLBACK_LINES],
        dirty: [true; BUFFER_HEIGHT],
        // SAFETY: 0xB8000 is the VGA text buffer, reached through the
        // physical direct map set up by the bootloader. The cast to
        // &'static mut Buffer is valid because the buffer has static
        // lifetime and is protected by the enclosing Mutex<Writer>.
        buffer: unsafe {
            &mut *(crate::mm::phys_to_virt(crate::mm::PhysAddr::new(0xB8000)).as_u64()
                as *mut Buffer)
        },
    });
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;

    use x86_64::instructions::interrupts;

    interrupts::without_interrupts(|| {
        let mut writer = WRITER.lock();
        writer.write_fmt(args).expect("VGA write_fmt failed");
        writer.refresh();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn color_code_packs_nibbles() {
        let code = ColorCode::new(Color::Red as u8, Color::Blue as u8);
        assert_eq!(code.foreground(), Color::Red as u8);
        assert_eq!(code.background(), Color::Blue as u8);
    }

    #[test_case]
    fn screen_char_is_two_bytes() {
        assert_eq!(core::mem::size_of::<ScreenChar>(), 2);
    }
}
