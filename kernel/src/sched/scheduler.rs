//! Preemptive round-robin scheduler.
//!
//! Single core: exactly one task runs at a time, ready tasks wait FIFO on a
//! singly-linked queue, sleeping tasks wait on a singly-linked sleep queue
//! keyed by wake tick, blocked tasks sit on no queue at all and are
//! reachable only from the condition they block on. All state lives in one
//! cell guarded by disabling interrupts; the PIT interrupt drives
//! preemption through `tick`.

use core::{cell::UnsafeCell, ptr::NonNull};

use x86_64::instructions::interrupts;

use super::task::{Task, TaskState, MAX_TASKS};
use crate::arch::x86_64::context::context_switch;
use crate::drivers::pit;
use crate::error::KernelError;

struct SchedulerState {
    current: Option<NonNull<Task>>,
    idle: Option<NonNull<Task>>,
    ready_head: Option<NonNull<Task>>,
    ready_tail: Option<NonNull<Task>>,
    sleep_head: Option<NonNull<Task>>,
    table: [Option<NonNull<Task>>; MAX_TASKS],
    next_pid: u32,
}

struct SchedCell(UnsafeCell<SchedulerState>);

// SAFETY: The cell is only entered with interrupts disabled on a single
// core, which serializes every access.
unsafe impl Sync for SchedCell {}

static SCHED: SchedCell = SchedCell(UnsafeCell::new(SchedulerState {
    current: None,
    idle: None,
    ready_head: None,
    ready_tail: None,
    sleep_head: None,
    table: [None; MAX_TASKS],
    next_pid: 0,
}));

/// Run `f` against the scheduler state with interrupts disabled.
fn with_sched<R>(f: impl FnOnce(&mut SchedulerState) -> R) -> R {
    interrupts::without_interrupts(|| {
        // SAFETY: interrupts are off and the kernel is single-core, so this
        // is the only live reference.
        f(unsafe { &mut *SCHED.0.get() })
    })
}

fn idle_task_entry() {
    loop {
        x86_64::instructions::hlt();
    }
}

/// Create the idle task and adopt the boot context as the running task.
///
/// The idle task starts out as `current`: the first context switch saves the
/// boot thread's context into it, so the boot thread *becomes* the idle
/// task from then on.
pub fn init() -> Result<(), KernelError> {
    with_sched(|sched| {
        let idle = Task::allocate(sched.next_pid, "idle", idle_task_entry)
            .ok_or(KernelError::OutOfMemory)?;
        sched.table[sched.next_pid as usize] = Some(idle);
        sched.next_pid += 1;

        // SAFETY: idle is a live task we just allocated.
        unsafe { (*idle.as_ptr()).state = TaskState::Running };
        sched.idle = Some(idle);
        sched.current = Some(idle);

        serial_println!("[SCHEDULER] Scheduler initialized with idle task");
        Ok(())
    })
}

/// Create a task and put it on the ready queue.
pub fn spawn(name: &'static str, entry: fn()) -> Result<NonNull<Task>, KernelError> {
    with_sched(|sched| {
        let pid = sched.next_pid;
        if pid as usize >= MAX_TASKS {
            serial_println!("[TASK] Task table full!");
            return Err(KernelError::OutOfMemory);
        }

        let task = Task::allocate(pid, name, entry).ok_or(KernelError::OutOfMemory)?;
        sched.table[pid as usize] = Some(task);
        sched.next_pid += 1;

        enqueue_ready(sched, task);
        Ok(task)
    })
}

/// Currently running task.
pub fn current_task() -> Option<NonNull<Task>> {
    with_sched(|sched| sched.current)
}

fn enqueue_ready(sched: &mut SchedulerState, task: NonNull<Task>) {
    // SAFETY: task is live; queue links are only touched here and in
    // dequeue/remove, always under the scheduler cell.
    unsafe {
        (*task.as_ptr()).state = TaskState::Ready;
        (*task.as_ptr()).next = None;

        match sched.ready_tail {
            Some(tail) => {
                (*tail.as_ptr()).next = Some(task);
                sched.ready_tail = Some(task);
            }
            None => {
                sched.ready_head = Some(task);
                sched.ready_tail = Some(task);
            }
        }
    }
}

fn dequeue_ready(sched: &mut SchedulerState) -> Option<NonNull<Task>> {
    let head = sched.ready_head?;
    // SAFETY: head is a live queued task.
    unsafe {
        sched.ready_head = (*head.as_ptr()).next;
        if sched.ready_head.is_none() {
            sched.ready_tail = None;
        }
        (*head.as_ptr()).next = None;
    }
    Some(head)
}

fn remove_from_ready(sched: &mut SchedulerState, task: NonNull<Task>) {
    let mut prev: Option<NonNull<Task>> = None;
    let mut cursor = sched.ready_head;

    while let Some(node) = cursor {
        // SAFETY: all queue nodes are live tasks.
        unsafe {
            if node == task {
                match prev {
                    Some(p) => (*p.as_ptr()).next = (*node.as_ptr()).next,
                    None => sched.ready_head = (*node.as_ptr()).next,
                }
                if sched.ready_tail == Some(node) {
                    sched.ready_tail = prev;
                }
                (*node.as_ptr()).next = None;
                return;
            }
            prev = cursor;
            cursor = (*node.as_ptr()).next;
        }
    }
}

/// Move every sleeper whose wake time has passed to the ready queue.
fn wake_sleepers(sched: &mut SchedulerState) {
    let now = pit::ticks();
    let mut prev: Option<NonNull<Task>> = None;
    let mut cursor = sched.sleep_head;

    while let Some(node) = cursor {
        // SAFETY: sleep-queue nodes are live tasks.
        unsafe {
            let next = (*node.as_ptr()).next;
            if (*node.as_ptr()).wake_time <= now {
                match prev {
                    Some(p) => (*p.as_ptr()).next = next,
                    None => sched.sleep_head = next,
                }
                (*node.as_ptr()).next = None;
                enqueue_ready(sched, node);
            } else {
                prev = cursor;
            }
            cursor = next;
        }
    }
}

/// Pick the next runnable task: FIFO head, or the idle task.
fn pick_next(sched: &mut SchedulerState) -> Option<NonNull<Task>> {
    dequeue_ready(sched).or(sched.idle)
}

/// The per-tick scheduling decision. Wakes sleepers, charges the running
/// task, and performs a context switch when its slice is exhausted.
///
/// SAFETY contract: called with interrupts disabled (ISR context or inside
/// `with_sched`).
unsafe fn tick_locked() {
    // SAFETY: single-core, interrupts off — exclusive access.
    let sched = unsafe { &mut *SCHED.0.get() };

    let Some(current) = sched.current else {
        return;
    };

    wake_sleepers(sched);

    // SAFETY: current is live.
    unsafe {
        let current_mut = current.as_ptr();
        if (*current_mut).time_slice > 0 {
            (*current_mut).time_slice -= 1;
        }
        (*current_mut).total_runtime += 1;

        if (*current_mut).time_slice != 0 {
            return;
        }

        let Some(next) = pick_next(sched) else {
            (*current_mut).time_slice = Task::default_time_slice();
            return;
        };

        if next == current {
            (*current_mut).time_slice = Task::default_time_slice();
            return;
        }

        // Requeue the preempted task if it is still runnable. The idle task
        // never sits on the ready queue; it is the fallback pick instead.
        if (*current_mut).state == TaskState::Running {
            (*current_mut).time_slice = Task::default_time_slice();
            if Some(current) == sched.idle {
                (*current_mut).state = TaskState::Ready;
            } else {
                enqueue_ready(sched, current);
            }
        }

        let next_mut = next.as_ptr();
        (*next_mut).state = TaskState::Running;
        (*next_mut).time_slice = Task::default_time_slice();
        sched.current = Some(next);

        // SAFETY: both contexts belong to live tasks; interrupts are off.
        // Execution resumes here when `current` is next scheduled.
        context_switch(&mut (*current_mut).context, (*next_mut).context);
    }
}

/// Timer hook, called from the PIT interrupt on every tick.
pub fn tick() {
    interrupts::without_interrupts(|| {
        // SAFETY: interrupts disabled around the call.
        unsafe { tick_locked() }
    });
}

/// Give up the rest of the current time slice.
pub fn yield_now() {
    interrupts::without_interrupts(|| {
        // SAFETY: interrupts disabled around the call.
        unsafe {
            let sched = &mut *SCHED.0.get();
            if let Some(current) = sched.current {
                (*current.as_ptr()).time_slice = 0;
            }
            tick_locked();
        }
    });
}

/// Block the current task until `unblock` is called on it.
pub fn block_current() {
    interrupts::without_interrupts(|| {
        // SAFETY: interrupts disabled around the call.
        unsafe {
            let sched = &mut *SCHED.0.get();
            let Some(current) = sched.current else {
                return;
            };
            serial_println!("[TASK] Blocking task: {}", (*current.as_ptr()).name);
            (*current.as_ptr()).state = TaskState::Blocked;
            (*current.as_ptr()).time_slice = 0;
            tick_locked();
        }
    });
}

/// Make a blocked task runnable again. A task in any other state is left
/// alone, so a racing wake-up is harmless.
pub fn unblock(task: NonNull<Task>) {
    with_sched(|sched| {
        // SAFETY: task is a live task handle.
        unsafe {
            if (*task.as_ptr()).state != TaskState::Blocked {
                return;
            }
            serial_println!("[TASK] Unblocking task: {}", (*task.as_ptr()).name);
        }
        enqueue_ready(sched, task);
    });
}

/// Sleep for at least `ticks` timer ticks. The idle task never sleeps.
pub fn sleep_ticks(ticks: u64) {
    if ticks == 0 {
        return;
    }

    interrupts::without_interrupts(|| {
        // SAFETY: interrupts disabled around the call.
        unsafe {
            let sched = &mut *SCHED.0.get();
            let Some(current) = sched.current else {
                return;
            };
            if Some(current) == sched.idle {
                return;
            }

            let current_mut = current.as_ptr();
            (*current_mut).wake_time = pit::ticks() + ticks;
            (*current_mut).state = TaskState::Sleeping;
            (*current_mut).next = sched.sleep_head;
            sched.sleep_head = Some(current);
            (*current_mut).time_slice = 0;
            tick_locked();
        }
    });
}

/// Terminate the running task. Installed as the fall-through of every task
/// entry point; never returns.
pub extern "C" fn task_exit() -> ! {
    with_sched(|sched| {
        if let Some(current) = sched.current {
            // SAFETY: current is live.
            unsafe {
                serial_println!("[TASK] Task {} exited", (*current.as_ptr()).name);
                (*current.as_ptr()).state = TaskState::Terminated;
            }
            remove_from_ready(sched, current);
        }
    });

    loop {
        yield_now();
    }
}

/// Snapshot of one task for introspection (`ps`).
#[derive(Debug, Clone, Copy)]
pub struct TaskSnapshot {
    pub pid: u32,
    pub name: &'static str,
    pub state: TaskState,
    pub total_runtime: u64,
}

/// Visit a snapshot of every task in the table.
pub fn for_each_task(mut f: impl FnMut(&TaskSnapshot)) {
    let mut snapshots = [None::<TaskSnapshot>; MAX_TASKS];

    with_sched(|sched| {
        for (slot, entry) in sched.table.iter().enumerate() {
            if let Some(task) = entry {
                // SAFETY: table entries are live tasks.
                unsafe {
                    let task = &*task.as_ptr();
                    snapshots[slot] = Some(TaskSnapshot {
                        pid: task.pid,
                        name: task.name,
                        state: task.state,
                        total_runtime: task.total_runtime,
                    });
                }
            }
        }
    });

    for snapshot in snapshots.iter().flatten() {
        f(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn queue_discipline_is_fifo() {
        with_sched(|sched| {
            let a = Task::allocate(1000, "fifo-a", idle_task_entry).unwrap();
            let b = Task::allocate(1001, "fifo-b", idle_task_entry).unwrap();

            let saved_head = sched.ready_head.take();
            let saved_tail = sched.ready_tail.take();

            enqueue_ready(sched, a);
            enqueue_ready(sched, b);
            assert_eq!(dequeue_ready(sched), Some(a));
            assert_eq!(dequeue_ready(sched), Some(b));
            assert_eq!(dequeue_ready(sched), None);

            sched.ready_head = saved_head;
            sched.ready_tail = saved_tail;

            // SAFETY: both tasks are off every queue.
            unsafe {
                Task::destroy(a);
                Task::destroy(b);
            }
        });
    }

    #[test_case]
    fn remove_relinks_the_queue() {
        with_sched(|sched| {
            let a = Task::allocate(1002, "rm-a", idle_task_entry).unwrap();
            let b = Task::allocate(1003, "rm-b", idle_task_entry).unwrap();
            let c = Task::allocate(1004, "rm-c", idle_task_entry).unwrap();

            let saved_head = sched.ready_head.take();
            let saved_tail = sched.ready_tail.take();

            enqueue_ready(sched, a);
            enqueue_ready(sched, b);
            enqueue_ready(sched, c);
            remove_from_ready(sched, b);
            assert_eq!(dequeue_ready(sched), Some(a));
            assert_eq!(dequeue_ready(sched), Some(c));
            assert_eq!(dequeue_ready(sched), None);

            sched.ready_head = saved_head;
            sched.ready_tail = saved_tail;

            // SAFETY: all three tasks are off every queue.
            unsafe {
                Task::destroy(a);
                Task::destroy(b);
                Task::destroy(c);
            }
        });
    }
}
