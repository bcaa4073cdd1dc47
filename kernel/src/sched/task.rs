//! Task structure and lifecycle.

use core::{alloc::Layout, ptr::NonNull};

use alloc::boxed::Box;

use crate::arch::x86_64::context::{seed_context, TaskContext};

/// Fixed kernel stack size per task (8 KiB).
pub const TASK_STACK_SIZE: usize = 8192;

/// Capacity of the task table.
pub const MAX_TASKS: usize = 64;

const TIME_SLICE_TICKS: u32 = 10; // 100 ms at 100 Hz

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Blocked,
    Sleeping,
    Terminated,
}

impl TaskState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            TaskState::Ready => "ready",
            TaskState::Running => "running",
            TaskState::Blocked => "blocked",
            TaskState::Sleeping => "sleeping",
            TaskState::Terminated => "terminated",
        }
    }
}

pub struct Task {
    pub pid: u32,
    pub name: &'static str,
    pub state: TaskState,
    /// Saved context; points into the task's stack while switched out.
    pub context: *mut TaskContext,
    pub stack_base: *mut u8,
    pub stack_top: u64,
    /// Remaining ticks before preemption.
    pub time_slice: u32,
    /// Total ticks this task has run.
    pub total_runtime: u64,
    /// Tick at which a sleeping task becomes ready again.
    pub wake_time: u64,
    /// Intrusive link for the ready and sleep queues.
    pub next: Option<NonNull<Task>>,
}

impl Task {
    pub const fn default_time_slice() -> u32 {
        TIME_SLICE_TICKS
    }

    fn stack_layout() -> Layout {
        // The seeded context requires 16-byte alignment of the stack top.
        Layout::from_size_align(TASK_STACK_SIZE, 16).expect("stack layout")
    }

    /// Allocate a task and its stack, seeding the initial context so the
    /// first switch lands in `entry`.
    pub fn allocate(pid: u32, name: &'static str, entry: fn()) -> Option<NonNull<Task>> {
        // SAFETY: stack_layout has non-zero size.
        let stack_base = unsafe { alloc::alloc::alloc(Self::stack_layout()) };
        if stack_base.is_null() {
            return None;
        }

        // SAFETY: stack_base points at TASK_STACK_SIZE fresh bytes.
        let stack_top = unsafe { stack_base.add(TASK_STACK_SIZE) };
        let context = seed_context(stack_top, entry);

        let task = Box::new(Task {
            pid,
            name,
            state: TaskState::Ready,
            context,
            stack_base,
            stack_top: stack_top as u64,
            time_slice: TIME_SLICE_TICKS,
            total_runtime: 0,
            wake_time: 0,
            next: None,
        });

        serial_println!("[TASK] Created task: {} (PID {})", name, pid);
        NonNull::new(Box::into_raw(task))
    }

    /// Reclaim a task's stack and structure. The task must be off every
    /// scheduler queue and must not be the running task.
    ///
    /// # Safety
    ///
    /// `task` must have come from `allocate` and must be unreachable from
    /// the scheduler.
    pub unsafe fn destroy(task: NonNull<Task>) {
        // SAFETY: per the function contract the task is unreachable, so we
        // hold the only pointer to it.
        unsafe {
            let boxed = Box::from_raw(task.as_ptr());
            serial_println!("[TASK] Destroying task: {}", boxed.name);
            alloc::alloc::dealloc(boxed.stack_base, Self::stack_layout());
            drop(boxed);
        }
    }
}
