//! Early bump heap.
//!
//! Backs allocations made before the buddy and slab allocators are online
//! (driver registration, early console state). Lives in the fixed physical
//! window `[PHYS_HEAP_START, PHYS_HEAP_END)` reached through the direct map.
//! Frees into this heap are dropped; once `kmalloc` switches over to the
//! slab path nothing new is ever bumped here.

use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use super::{phys_to_virt, PhysAddr, PHYS_HEAP_END, PHYS_HEAP_START};

struct BumpHeap {
    start: u64,
    end: u64,
    current: u64,
}

static HEAP: Mutex<BumpHeap> = Mutex::new(BumpHeap {
    start: 0,
    end: 0,
    current: 0,
});

static ALLOCATED: AtomicU64 = AtomicU64::new(0);

pub fn init() {
    let start = phys_to_virt(PhysAddr::new(PHYS_HEAP_START)).as_u64();
    let end = phys_to_virt(PhysAddr::new(PHYS_HEAP_END)).as_u64();

    let mut heap = HEAP.lock();
    heap.start = start;
    heap.end = end;
    heap.current = start;

    serial_println!("[HEAP] Early heap at {:#x} ({} KiB)", start, (end - start) / 1024);
}

/// Bump-allocate `size` bytes at `align`. Returns null when the window is
/// exhausted or the heap was never initialized.
pub fn alloc(size: usize, align: usize) -> *mut u8 {
    let mut heap = HEAP.lock();
    if heap.current == 0 {
        return core::ptr::null_mut();
    }

    let base = (heap.current + align as u64 - 1) & !(align as u64 - 1);
    let next = base + size as u64;
    if next > heap.end {
        serial_println!("[HEAP] Early heap exhausted ({} bytes requested)", size);
        return core::ptr::null_mut();
    }

    heap.current = next;
    ALLOCATED.fetch_add(size as u64, Ordering::Relaxed);
    base as *mut u8
}

/// Whether `ptr` came out of the early heap window.
pub fn owns(ptr: *const u8) -> bool {
    let addr = ptr as u64;
    let start = phys_to_virt(PhysAddr::new(PHYS_HEAP_START)).as_u64();
    let end = phys_to_virt(PhysAddr::new(PHYS_HEAP_END)).as_u64();
    addr >= start && addr < end
}

pub fn used_bytes() -> u64 {
    ALLOCATED.load(Ordering::Relaxed)
}

pub fn free_bytes() -> u64 {
    let heap = HEAP.lock();
    heap.end.saturating_sub(heap.current)
}
