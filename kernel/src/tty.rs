//! TTY line discipline.
//!
//! A ring buffer fed by the keyboard interrupt and drained by a blocking
//! line read. The producer runs in interrupt context and the consumer in
//! task context; on this single core both sides take the buffer lock with
//! interrupts disabled, and the consumer re-scans after every wake so a
//! spurious unblock is harmless. At most one task waits at a time (one
//! keyboard, one shell reader).

use core::ptr::NonNull;

use spin::Mutex;
use x86_64::instructions::interrupts;

use crate::console;
use crate::error::KernelError;
use crate::sched::{self, Task};

pub const TTY_BUFFER_SIZE: usize = 256;

struct Tty {
    buffer: [u8; TTY_BUFFER_SIZE],
    read_pos: usize,
    write_pos: usize,
    count: usize,
    waiting_task: Option<NonNull<Task>>,
    echo_enabled: bool,
}

// SAFETY: The waiting-task pointer is only touched under the Mutex with
// interrupts disabled; tasks outlive their stay on the TTY.
unsafe impl Send for Tty {}

static TTY: Mutex<Tty> = Mutex::new(Tty {
    buffer: [0; TTY_BUFFER_SIZE],
    read_pos: 0,
    write_pos: 0,
    count: 0,
    waiting_task: None,
    echo_enabled: true,
});

pub fn init() -> Result<(), KernelError> {
    interrupts::without_interrupts(|| {
        let mut tty = TTY.lock();
        tty.read_pos = 0;
        tty.write_pos = 0;
        tty.count = 0;
        tty.waiting_task = None;
        tty.echo_enabled = true;
    });
    Ok(())
}

pub fn set_echo(enabled: bool) {
    interrupts::without_interrupts(|| {
        TTY.lock().echo_enabled = enabled;
    });
}

/// Producer side, called by the keyboard interrupt for every decoded byte.
///
/// Backspace retracts the newest unread byte; a newline wakes the waiting
/// reader, if any.
pub fn input_char(c: u8) {
    interrupts::without_interrupts(|| {
        let mut tty = TTY.lock();

        if c == 0x08 {
            if tty.count > 0 {
                tty.write_pos = (tty.write_pos + TTY_BUFFER_SIZE - 1) % TTY_BUFFER_SIZE;
                tty.count -= 1;
                if tty.echo_enabled {
                    console::backspace(1);
                }
            }
            return;
        }

        if tty.echo_enabled && c != b'\n' {
            console::putc(c);
        }

        if tty.count < TTY_BUFFER_SIZE {
            let pos = tty.write_pos;
            tty.buffer[pos] = c;
            tty.write_pos = (pos + 1) % TTY_BUFFER_SIZE;
            tty.count += 1;
        }

        if c == b'\n' {
            if tty.echo_enabled {
                console::putc(b'\n');
            }

            if let Some(task) = tty.waiting_task.take() {
                sched::unblock(task);
            }
        }
    });
}

/// Whether the unread bytes contain a newline.
fn has_line(tty: &Tty) -> bool {
    let mut pos = tty.read_pos;
    for _ in 0..tty.count {
        if tty.buffer[pos] == b'\n' {
            return true;
        }
        pos = (pos + 1) % TTY_BUFFER_SIZE;
    }
    false
}

/// Blocking line read. Returns once a full line is buffered, copying bytes
/// up to and including the newline (bounded by the buffer length) and
/// leaving the rest for the next read.
pub fn read(buffer: &mut [u8]) -> usize {
    if buffer.is_empty() {
        return 0;
    }

    loop {
        // Scan, register and block under one interrupts-disabled region so
        // no newline can slip in between the scan and the block. The lock
        // itself is dropped before blocking; another reader must be able to
        // take it while we sleep.
        let ready = interrupts::without_interrupts(|| {
            {
                let mut tty = TTY.lock();
                if has_line(&tty) {
                    return true;
                }
                tty.waiting_task = sched::current_task();
            }
            sched::block_current();
            false
        });

        if ready {
            break;
        }
    }

    interrupts::without_interrupts(|| {
        let mut tty = TTY.lock();
        let mut bytes_read = 0;

        while tty.count > 0 && bytes_read < buffer.len() {
            let c = tty.buffer[tty.read_pos];
            buffer[bytes_read] = c;
            bytes_read += 1;

            tty.read_pos = (tty.read_pos + 1) % TTY_BUFFER_SIZE;
            tty.count -= 1;

            if c == b'\n' {
                break;
            }
        }

        bytes_read
    })
}

/// Pass-through write to the console.
pub fn write(s: &str) {
    console::puts(s);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain() {
        interrupts::without_interrupts(|| {
            let mut tty = TTY.lock();
            tty.read_pos = 0;
            tty.write_pos = 0;
            tty.count = 0;
        });
    }

    #[test_case]
    fn line_detection_sees_only_buffered_newlines() {
        drain();
        set_echo(false);

        input_char(b'l');
        input_char(b's');
        interrupts::without_interrupts(|| assert!(!has_line(&TTY.lock())));

        input_char(b'\n');
        interrupts::without_interrupts(|| assert!(has_line(&TTY.lock())));

        let mut buffer = [0u8; 16];
        let n = read(&mut buffer);
        assert_eq!(&buffer[..n], b"ls\n");
        set_echo(true);
    }

    #[test_case]
    fn backspace_retracts_unread_bytes() {
        drain();
        set_echo(false);

        input_char(b'a');
        input_char(b'b');
        input_char(0x08);
        input_char(b'c');
        input_char(b'\n');

        let mut buffer = [0u8; 16];
        let n = read(&mut buffer);
        assert_eq!(&buffer[..n], b"ac\n");
        set_echo(true);
    }

    #[test_case]
    fn reads_consume_one_line_at_a_time() {
        drain();
        set_echo(false);

        for &c in b"one\ntwo\n" {
            input_char(c);
        }

        let mut buffer = [0u8; 16];
        let n = read(&mut buffer);
        assert_eq!(&buffer[..n], b"one\n");
        let n = read(&mut buffer);
        assert_eq!(&buffer[..n], b"two\n");
        set_echo(true);
    }
}
