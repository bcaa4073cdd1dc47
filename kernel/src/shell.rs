//! Interactive shell.
//!
//! Runs as a kernel task: reads newline-terminated lines from the TTY,
//! splits them on whitespace, and dispatches on the first token. Error
//! messages go to the console in red.

use alloc::vec;

use crate::console;
use crate::drivers::{self, block, pit};
use crate::error::KernelError;
use crate::fs;
use crate::mm::{buddy, heap, pmm, slab};
use crate::sched;
use crate::tty;

const CMD_BUFFER_SIZE: usize = 256;
const MAX_ARGS: usize = 16;

struct ShellCommand {
    name: &'static str,
    help: &'static str,
    run: fn(&[&str]),
}

static COMMANDS: &[ShellCommand] = &[
    ShellCommand { name: "help", help: "Display available commands", run: cmd_help },
    ShellCommand { name: "clear", help: "Clear the screen", run: cmd_clear },
    ShellCommand { name: "echo", help: "Print text to screen", run: cmd_echo },
    ShellCommand { name: "about", help: "About IGNIS OS", run: cmd_about },
    ShellCommand { name: "uptime", help: "Show system uptime", run: cmd_uptime },
    ShellCommand { name: "ticks", help: "Show PIT tick count", run: cmd_ticks },
    ShellCommand { name: "lsdrv", help: "Print registered drivers", run: cmd_lsdrv },
    ShellCommand { name: "meminfo", help: "Display memory statistics", run: cmd_meminfo },
    ShellCommand { name: "pmminfo", help: "Show PMM info", run: cmd_pmminfo },
    ShellCommand { name: "buddyinfo", help: "Display buddy allocator statistics", run: cmd_buddyinfo },
    ShellCommand { name: "buddytest", help: "Check buddy allocator invariants", run: cmd_buddytest },
    ShellCommand { name: "slabinfo", help: "Display slab allocator statistics", run: cmd_slabinfo },
    ShellCommand { name: "ls", help: "List directory contents", run: cmd_ls },
    ShellCommand { name: "tree", help: "Display directory tree", run: cmd_tree },
    ShellCommand { name: "touch", help: "Create a new file", run: cmd_touch },
    ShellCommand { name: "mkdir", help: "Create a new directory", run: cmd_mkdir },
    ShellCommand { name: "rm", help: "Remove a file or directory", run: cmd_rm },
    ShellCommand { name: "cat", help: "Display file contents", run: cmd_cat },
    ShellCommand { name: "write", help: "Write data to a file", run: cmd_write },
    ShellCommand { name: "cp", help: "Copy a file", run: cmd_cp },
    ShellCommand { name: "lsblk", help: "List block devices", run: cmd_lsblk },
    ShellCommand { name: "blkread", help: "Read a block from a device", run: cmd_blkread },
    ShellCommand { name: "blkwrite", help: "Write a pattern block to a device", run: cmd_blkwrite },
    ShellCommand { name: "ps", help: "Print task list", run: cmd_ps },
    ShellCommand { name: "sleep", help: "Sleep for N ticks", run: cmd_sleep },
    ShellCommand { name: "panic", help: "Test kernel panic (halts the system)", run: cmd_panic },
];

fn print_prompt() {
    console::puts_color(
        "ignis",
        console::ColorAttr::new(console::Color::LightGreen, console::Color::Black),
    );
    print!("$ ");
}

fn report(err: KernelError) {
    console::perror(err);
}

/// Shell task body.
pub fn shell_task() {
    println!("Type 'help' for a list of commands.\n");

    let mut line = [0u8; CMD_BUFFER_SIZE];
    loop {
        print_prompt();
        let n = tty::read(&mut line);

        let Ok(text) = core::str::from_utf8(&line[..n]) else {
            continue;
        };

        let mut args = [""; MAX_ARGS];
        let mut argc = 0;
        for token in text.split_whitespace() {
            if argc == MAX_ARGS {
                break;
            }
            args[argc] = token;
            argc += 1;
        }
        if argc == 0 {
            continue;
        }

        match COMMANDS.iter().find(|c| c.name == args[0]) {
            Some(command) => (command.run)(&args[..argc]),
            None => {
                console::puts_color("Unknown command: ", console::FAILURE);
                console::puts_color(args[0], console::FAILURE);
                console::putc(b'\n');
            }
        }
    }
}

fn cmd_help(_args: &[&str]) {
    println!("\nAvailable commands:");
    for command in COMMANDS {
        println!("  {:<12}{}", command.name, command.help);
    }
    println!();
}

fn cmd_clear(_args: &[&str]) {
    console::clear();
}

fn cmd_echo(args: &[&str]) {
    for (i, arg) in args.iter().skip(1).enumerate() {
        if i > 0 {
            print!(" ");
        }
        print!("{}", arg);
    }
    println!();
}

fn cmd_about(_args: &[&str]) {
    println!("IGNIS v{}", env!("CARGO_PKG_VERSION"));
    println!("A small 64-bit monolithic kernel for x86-64 PCs.");
}

fn cmd_uptime(_args: &[&str]) {
    let seconds = pit::uptime_seconds();
    println!(
        "Uptime: {}h {}m {}s",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    );
}

fn cmd_ticks(_args: &[&str]) {
    println!("{} ticks ({} Hz)", pit::ticks(), pit::TICK_RATE_HZ);
}

fn cmd_lsdrv(_args: &[&str]) {
    drivers::list();
}

fn cmd_meminfo(_args: &[&str]) {
    pmm::print_stats();
    println!(
        "Early heap: {} KB used, {} KB free",
        heap::used_bytes() / 1024,
        heap::free_bytes() / 1024
    );
    println!(
        "Buddy heap: {} KB used, {} KB free\n",
        buddy::used_memory() / 1024,
        buddy::free_memory() / 1024
    );
}

fn cmd_pmminfo(_args: &[&str]) {
    pmm::print_stats();
}

fn cmd_buddyinfo(_args: &[&str]) {
    buddy::print_stats();
}

fn cmd_buddytest(_args: &[&str]) {
    if buddy::verify_invariants() {
        console::puts_color("Buddy invariants hold\n", console::SUCCESS);
    } else {
        console::puts_color("Buddy invariants VIOLATED (see serial log)\n", console::FAILURE);
    }
}

fn cmd_slabinfo(_args: &[&str]) {
    slab::print_stats();
}

fn cmd_ls(args: &[&str]) {
    let path = if args.len() > 1 { args[1] } else { "/" };
    if let Err(err) = fs::list(path) {
        report(err);
    }
}

fn cmd_tree(args: &[&str]) {
    let path = if args.len() > 1 { args[1] } else { "/" };
    if let Err(err) = fs::print_tree(path) {
        report(err);
    }
}

fn cmd_touch(args: &[&str]) {
    if args.len() < 2 {
        println!("usage: touch <path>");
        return;
    }
    if let Err(err) = fs::create_file(args[1]) {
        report(err);
    }
}

fn cmd_mkdir(args: &[&str]) {
    if args.len() < 2 {
        println!("usage: mkdir <path>");
        return;
    }
    if let Err(err) = fs::create_directory(args[1]) {
        report(err);
    }
}

fn cmd_rm(args: &[&str]) {
    if args.len() < 2 {
        println!("usage: rm <path>");
        return;
    }
    if let Err(err) = fs::delete(args[1]) {
        report(err);
    }
}

fn cmd_cat(args: &[&str]) {
    if args.len() < 2 {
        println!("usage: cat <path>");
        return;
    }

    let node = match fs::open(args[1]) {
        Ok(node) => node,
        Err(err) => return report(err),
    };

    let mut buffer = vec![0u8; node.size()];
    match node.read(&mut buffer) {
        Ok(n) => {
            for &byte in &buffer[..n] {
                console::putc(byte);
            }
            println!();
        }
        Err(err) => report(err),
    }
}

fn cmd_write(args: &[&str]) {
    if args.len() < 3 {
        println!("usage: write <path> <text...>");
        return;
    }

    let node = match fs::open(args[1]).or_else(|_| fs::create_file(args[1])) {
        Ok(node) => node,
        Err(err) => return report(err),
    };

    let mut content = alloc::string::String::new();
    for (i, arg) in args.iter().skip(2).enumerate() {
        if i > 0 {
            content.push(' ');
        }
        content.push_str(arg);
    }

    if let Err(err) = node.write(content.as_bytes()) {
        report(err);
    }
}

fn cmd_cp(args: &[&str]) {
    if args.len() < 3 {
        println!("usage: cp <source> <dest>");
        return;
    }
    if let Err(err) = fs::copy_file(args[2], args[1]) {
        report(err);
    }
}

fn cmd_lsblk(_args: &[&str]) {
    block::list();
}

fn parse_u64(text: &str) -> Option<u64> {
    text.parse().ok()
}

fn cmd_blkread(args: &[&str]) {
    let (Some(id), Some(lba)) = (
        args.get(1).and_then(|a| parse_u64(a)),
        args.get(2).and_then(|a| parse_u64(a)),
    ) else {
        println!("usage: blkread <device> <lba>");
        return;
    };

    let mut buffer = vec![0u8; block::BLOCK_SIZE];
    match block::read(id as u8, lba, &mut buffer) {
        Ok(()) => {
            // First 64 bytes, hexdump style.
            for (i, byte) in buffer.iter().take(64).enumerate() {
                if i % 16 == 0 {
                    print!("\n{:04x}: ", i);
                }
                print!("{:02x} ", byte);
            }
            println!();
        }
        Err(err) => report(err),
    }
}

fn cmd_blkwrite(args: &[&str]) {
    let (Some(id), Some(lba)) = (
        args.get(1).and_then(|a| parse_u64(a)),
        args.get(2).and_then(|a| parse_u64(a)),
    ) else {
        println!("usage: blkwrite <device> <lba>");
        return;
    };

    let mut buffer = vec![0u8; block::BLOCK_SIZE];
    for (i, byte) in buffer.iter_mut().enumerate() {
        *byte = i as u8;
    }

    match block::write(id as u8, lba, &buffer) {
        Ok(()) => println!("Wrote pattern block to device {} LBA {}", id, lba),
        Err(err) => report(err),
    }
}

fn cmd_ps(_args: &[&str]) {
    println!("\n{:<6}{:<16}{:<12}{}", "PID", "Name", "State", "Runtime");
    sched::for_each_task(|task| {
        println!(
            "{:<6}{:<16}{:<12}{}",
            task.pid,
            task.name,
            task.state.as_str(),
            task.total_runtime
        );
    });
    println!();
}

fn cmd_sleep(args: &[&str]) {
    let Some(ticks) = args.get(1).and_then(|a| parse_u64(a)) else {
        println!("usage: sleep <ticks>");
        return;
    };

    let before = pit::ticks();
    sched::sleep_ticks(ticks);
    println!("Slept {} ticks", pit::ticks() - before);
}

fn cmd_panic(_args: &[&str]) {
    panic!("User requested panic from shell");
}
