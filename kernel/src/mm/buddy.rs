//! Buddy allocator.
//!
//! Manages the power-of-two region `[BUDDY_REGION_START, BUDDY_REGION_START +
//! BUDDY_REGION_SIZE)` in blocks of 2^k pages, k in 0..=11 (4 KiB .. 8 MiB).
//! Free blocks carry their list node inside the block itself (reached through
//! the direct map). An allocation bitmap at the start of the managed region
//! tracks which frames are allocated, and an order map records the order of
//! each allocation so `free` can recover the block size. Two blocks are
//! buddies iff their page indices differ by exactly the block size and share
//! the parent alignment; mergeable pairs are never left simultaneously free.

use core::ptr::NonNull;

use spin::Mutex;

use super::{phys_to_virt, pmm, virt_to_phys, PhysAddr, VirtAddr, PAGE_SIZE};
use crate::error::KernelError;

/// Maximum order (2^11 pages = 8 MiB blocks).
pub const BUDDY_MAX_ORDER: usize = 11;

/// Managed region: the upper 64 MiB of the PMM range.
pub const BUDDY_REGION_START: u64 = 0x0400_0000;
pub const BUDDY_REGION_SIZE: u64 = 0x0400_0000;

pub const fn pages_per_order(order: usize) -> usize {
    1 << order
}

pub const fn size_for_order(order: usize) -> usize {
    PAGE_SIZE << order
}

/// Smallest order whose block holds at least `size` bytes.
pub fn order_for_size(size: usize) -> usize {
    let pages = size.div_ceil(PAGE_SIZE);
    let mut order = 0;
    while pages_per_order(order) < pages && order < BUDDY_MAX_ORDER {
        order += 1;
    }
    order
}

/// List node stored inside each free block.
#[repr(C)]
struct FreeBlock {
    next: Option<NonNull<FreeBlock>>,
    prev: Option<NonNull<FreeBlock>>,
}

struct BuddyAllocator {
    base_addr: u64,
    total_size: u64,
    total_pages: usize,
    free_lists: [Option<NonNull<FreeBlock>>; BUDDY_MAX_ORDER + 1],
    allocations: [u64; BUDDY_MAX_ORDER + 1],
    deallocations: [u64; BUDDY_MAX_ORDER + 1],
    splits: u64,
    merges: u64,
    /// One bit per page: 1 = allocated.
    bitmap: &'static mut [u8],
    /// Order recorded at allocation time, indexed by the block's head page.
    order_map: &'static mut [u8],
}

// SAFETY: The raw list pointers all reference memory inside the managed
// region; the allocator is only ever used behind the global Mutex.
unsafe impl Send for BuddyAllocator {}

static BUDDY: Mutex<Option<BuddyAllocator>> = Mutex::new(None);

impl BuddyAllocator {
    fn addr_to_index(&self, addr: u64) -> usize {
        ((addr - self.base_addr) / PAGE_SIZE as u64) as usize
    }

    fn index_to_addr(&self, index: usize) -> u64 {
        self.base_addr + (index * PAGE_SIZE) as u64
    }

    fn bitmap_set(&mut self, bit: usize) {
        self.bitmap[bit / 8] |= 1 << (bit % 8);
    }

    fn bitmap_clear(&mut self, bit: usize) {
        self.bitmap[bit / 8] &= !(1 << (bit % 8));
    }

    fn bitmap_test(&self, bit: usize) -> bool {
        self.bitmap[bit / 8] & (1 << (bit % 8)) != 0
    }

    /// Node view of a free block at a physical address.
    ///
    /// SAFETY contract: `addr` must be a page-aligned address inside the
    /// managed region whose block is not referenced by any allocation.
    unsafe fn block_at(&self, addr: u64) -> NonNull<FreeBlock> {
        // SAFETY: see contract; the direct map makes the block addressable.
        unsafe { NonNull::new_unchecked(phys_to_virt(PhysAddr::new(addr)).as_mut_ptr()) }
    }

    fn push_free(&mut self, addr: u64, order: usize) {
        // SAFETY: caller guarantees the block is free; we own it now.
        let mut block = unsafe { self.block_at(addr) };
        // SAFETY: block points into the managed region, exclusive via Mutex.
        unsafe {
            block.as_mut().next = self.free_lists[order];
            block.as_mut().prev = None;
            if let Some(mut head) = self.free_lists[order] {
                head.as_mut().prev = Some(block);
            }
        }
        self.free_lists[order] = Some(block);
    }

    fn unlink(&mut self, mut block: NonNull<FreeBlock>, order: usize) {
        // SAFETY: block is on list `order`, all neighbors are live free-block
        // nodes inside the managed region.
        unsafe {
            match block.as_ref().prev {
                Some(mut prev) => prev.as_mut().next = block.as_ref().next,
                None => self.free_lists[order] = block.as_ref().next,
            }
            if let Some(mut next) = block.as_ref().next {
                next.as_mut().prev = block.as_ref().prev;
            }
            block.as_mut().next = None;
            block.as_mut().prev = None;
        }
    }

    fn list_contains(&self, addr: u64, order: usize) -> Option<NonNull<FreeBlock>> {
        let wanted = phys_to_virt(PhysAddr::new(addr)).as_u64();
        let mut cursor = self.free_lists[order];
        while let Some(block) = cursor {
            if block.as_ptr() as u64 == wanted {
                return Some(block);
            }
            // SAFETY: list nodes are live free blocks.
            cursor = unsafe { block.as_ref().next };
        }
        None
    }

    /// Split a larger block until a free block of `order` exists.
    fn split_to(&mut self, order: usize) -> Result<(), KernelError> {
        if order >= BUDDY_MAX_ORDER {
            return Err(KernelError::OutOfMemory);
        }

        if self.free_lists[order + 1].is_none() {
            self.split_to(order + 1)?;
        }

        let block = self.free_lists[order + 1].ok_or(KernelError::OutOfMemory)?;
        let block_addr = virt_to_phys(VirtAddr::new(block.as_ptr() as u64)).as_u64();
        self.unlink(block, order + 1);

        let half = size_for_order(order) as u64;
        self.push_free(block_addr, order);
        self.push_free(block_addr + half, order);
        self.splits += 1;

        Ok(())
    }

    fn alloc_order(&mut self, order: usize) -> Option<PhysAddr> {
        if order > BUDDY_MAX_ORDER {
            return None;
        }

        if self.free_lists[order].is_none() && self.split_to(order).is_err() {
            return None;
        }

        let block = self.free_lists[order]?;
        let addr = virt_to_phys(VirtAddr::new(block.as_ptr() as u64)).as_u64();
        self.unlink(block, order);

        let index = self.addr_to_index(addr);
        for page in index..index + pages_per_order(order) {
            self.bitmap_set(page);
        }
        self.order_map[index] = order as u8;
        self.allocations[order] += 1;

        Some(PhysAddr::new(addr))
    }

    fn free(&mut self, phys: PhysAddr) {
        let addr = phys.as_u64();
        if addr < self.base_addr || addr >= self.base_addr + self.total_size {
            serial_println!("[BUDDY] Warning: free of out-of-range {:#x}", addr);
            return;
        }
        if !phys.is_page_aligned() {
            serial_println!("[BUDDY] Warning: free of unaligned {:#x}", addr);
            return;
        }

        let index = self.addr_to_index(addr);
        if !self.bitmap_test(index) {
            serial_println!("[BUDDY] Warning: double free of {:#x}", addr);
            return;
        }

        let order = self.order_map[index] as usize;
        if order > BUDDY_MAX_ORDER {
            serial_println!("[BUDDY] Warning: corrupt order for {:#x}", addr);
            return;
        }

        for page in index..index + pages_per_order(order) {
            self.bitmap_clear(page);
        }
        self.deallocations[order] += 1;

        self.push_free(addr, order);
        self.try_merge(addr, order);
    }

    /// Coalesce the freshly freed block upward while its buddy is free at the
    /// same order.
    fn try_merge(&mut self, addr: u64, order: usize) {
        let mut addr = addr;
        let mut order = order;

        while order < BUDDY_MAX_ORDER {
            let index = self.addr_to_index(addr);
            let buddy_index = index ^ pages_per_order(order);
            let buddy_addr = self.index_to_addr(buddy_index);

            if buddy_addr >= self.base_addr + self.total_size {
                break;
            }
            if self.bitmap_test(buddy_index) {
                break;
            }

            let Some(buddy) = self.list_contains(buddy_addr, order) else {
                // Buddy is free at a different order; cannot merge yet.
                break;
            };

            // SAFETY: the current block was pushed onto list `order` by the
            // caller, so it is present.
            let current = self
                .list_contains(addr, order)
                .expect("freed block missing from its free list");

            self.unlink(buddy, order);
            self.unlink(current, order);

            addr = addr.min(buddy_addr);
            order += 1;
            self.push_free(addr, order);
            self.merges += 1;
        }
    }

    fn free_memory(&self) -> u64 {
        let mut total = 0u64;
        for order in 0..=BUDDY_MAX_ORDER {
            let mut cursor = self.free_lists[order];
            while let Some(block) = cursor {
                total += size_for_order(order) as u64;
                // SAFETY: list nodes are live free blocks.
                cursor = unsafe { block.as_ref().next };
            }
        }
        total
    }
}

/// Take ownership of the managed region and carve it into aligned free
/// blocks. The allocation bitmap and order map live in the first pages of
/// the region.
pub fn init() -> Result<(), KernelError> {
    let base = BUDDY_REGION_START;
    let size = BUDDY_REGION_SIZE;

    if size & (size - 1) != 0 {
        return Err(KernelError::InvalidArgument);
    }

    let total_pages = (size / PAGE_SIZE as u64) as usize;
    let bitmap_size = total_pages.div_ceil(8);
    let order_map_size = total_pages;
    let header_bytes = bitmap_size + order_map_size;
    let header_pages = header_bytes.div_ceil(PAGE_SIZE);

    // The PMM must never hand out frames the buddy owns.
    pmm::mark_region_used(base, base + size);

    // SAFETY: The header window at the start of the managed region is
    // reserved for these tables and reached through the direct map.
    let bitmap = unsafe {
        core::slice::from_raw_parts_mut(
            phys_to_virt(PhysAddr::new(base)).as_mut_ptr::<u8>(),
            bitmap_size,
        )
    };
    // SAFETY: As above; the order map directly follows the bitmap.
    let order_map = unsafe {
        core::slice::from_raw_parts_mut(
            phys_to_virt(PhysAddr::new(base + bitmap_size as u64)).as_mut_ptr::<u8>(),
            order_map_size,
        )
    };
    bitmap.fill(0);
    order_map.fill(0);

    let mut allocator = BuddyAllocator {
        base_addr: base,
        total_size: size,
        total_pages,
        free_lists: [None; BUDDY_MAX_ORDER + 1],
        allocations: [0; BUDDY_MAX_ORDER + 1],
        deallocations: [0; BUDDY_MAX_ORDER + 1],
        splits: 0,
        merges: 0,
        bitmap,
        order_map,
    };

    // Header pages are permanently allocated.
    for page in 0..header_pages {
        allocator.bitmap_set(page);
    }

    // Carve the remainder into the largest blocks the alignment of each
    // position allows, so every free block is naturally aligned.
    let mut index = header_pages;
    while index < total_pages {
        let align_order = if index == 0 {
            BUDDY_MAX_ORDER
        } else {
            (index.trailing_zeros() as usize).min(BUDDY_MAX_ORDER)
        };
        let mut order = align_order;
        while pages_per_order(order) > total_pages - index {
            order -= 1;
        }
        let addr = allocator.index_to_addr(index);
        allocator.push_free(addr, order);
        index += pages_per_order(order);
    }

    serial_println!(
        "[BUDDY] Initialized at {:#x} with {} MiB ({} header pages)",
        base,
        size / 1024 / 1024,
        header_pages
    );

    *BUDDY.lock() = Some(allocator);
    Ok(())
}

/// Allocate a block of 2^order pages. Returns `None` when no block at any
/// order >= `order` is available.
pub fn alloc_order(order: usize) -> Option<PhysAddr> {
    BUDDY.lock().as_mut()?.alloc_order(order)
}

/// Allocate a block of at least `size` bytes.
pub fn alloc(size: usize) -> Option<PhysAddr> {
    alloc_order(order_for_size(size))
}

/// Free a previously allocated block. The order is recovered from the order
/// map; invalid frees are logged and ignored.
pub fn free(phys: PhysAddr) {
    if let Some(allocator) = BUDDY.lock().as_mut() {
        allocator.free(phys);
    }
}

pub fn is_allocated(phys: PhysAddr) -> bool {
    let guard = BUDDY.lock();
    let Some(allocator) = guard.as_ref() else {
        return false;
    };
    let addr = phys.as_u64();
    if addr < allocator.base_addr || addr >= allocator.base_addr + allocator.total_size {
        return false;
    }
    allocator.bitmap_test(allocator.addr_to_index(addr))
}

pub fn splits() -> u64 {
    BUDDY.lock().as_ref().map_or(0, |a| a.splits)
}

pub fn merges() -> u64 {
    BUDDY.lock().as_ref().map_or(0, |a| a.merges)
}

pub fn free_memory() -> u64 {
    BUDDY.lock().as_ref().map_or(0, |a| a.free_memory())
}

pub fn used_memory() -> u64 {
    let guard = BUDDY.lock();
    guard
        .as_ref()
        .map_or(0, |a| a.total_size - a.free_memory())
}

/// Verify the structural invariants: every free block is aligned to its
/// order, and no two blocks on the same list are buddies.
pub fn verify_invariants() -> bool {
    let guard = BUDDY.lock();
    let Some(allocator) = guard.as_ref() else {
        return false;
    };

    for order in 0..=BUDDY_MAX_ORDER {
        let mut cursor = allocator.free_lists[order];
        while let Some(block) = cursor {
            let addr = virt_to_phys(VirtAddr::new(block.as_ptr() as u64)).as_u64();
            let index = allocator.addr_to_index(addr);

            if index % pages_per_order(order) != 0 {
                serial_println!("[BUDDY] Invariant: {:#x} misaligned at order {}", addr, order);
                return false;
            }

            let buddy_index = index ^ pages_per_order(order);
            let buddy_addr = allocator.index_to_addr(buddy_index);
            if allocator.list_contains(buddy_addr, order).is_some() {
                serial_println!(
                    "[BUDDY] Invariant: {:#x} and its buddy both free at order {}",
                    addr,
                    order
                );
                return false;
            }

            // SAFETY: list nodes are live free blocks.
            cursor = unsafe { block.as_ref().next };
        }
    }

    true
}

pub fn print_stats() {
    let guard = BUDDY.lock();
    let Some(allocator) = guard.as_ref() else {
        println!("Buddy allocator not initialized");
        return;
    };

    println!("\n=== Buddy Allocator Statistics ===");
    println!("Total memory: {} MB", allocator.total_size / 1024 / 1024);
    println!(
        "Used memory:  {} KB",
        (allocator.total_size - allocator.free_memory()) / 1024
    );
    println!("Free memory:  {} KB\n", allocator.free_memory() / 1024);
    println!("Splits: {}  Merges: {}\n", allocator.splits, allocator.merges);

    println!("Free blocks by order:");
    for order in 0..=BUDDY_MAX_ORDER {
        let mut count = 0;
        let mut cursor = allocator.free_lists[order];
        while let Some(block) = cursor {
            count += 1;
            // SAFETY: list nodes are live free blocks.
            cursor = unsafe { block.as_ref().next };
        }
        if count > 0 {
            println!(
                "  Order {} ({} KB): {} blocks",
                order,
                size_for_order(order) / 1024,
                count
            );
        }
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn order_for_size_rounds_up() {
        assert_eq!(order_for_size(1), 0);
        assert_eq!(order_for_size(PAGE_SIZE), 0);
        assert_eq!(order_for_size(PAGE_SIZE + 1), 1);
        assert_eq!(order_for_size(8 * PAGE_SIZE), 3);
    }

    #[test_case]
    fn alloc_free_round_trip() {
        let used_before = used_memory();
        let block = alloc_order(0).expect("buddy exhausted");
        assert!(block.is_page_aligned());
        assert!(is_allocated(block));
        free(block);
        assert!(!is_allocated(block));
        assert_eq!(used_memory(), used_before);
    }

    #[test_case]
    fn reverse_free_merges_buddies() {
        let merges_before = merges();
        let a = alloc_order(0).unwrap();
        let b = alloc_order(0).unwrap();
        free(b);
        free(a);
        assert!(merges() > merges_before);
        assert!(verify_invariants());
    }

    #[test_case]
    fn larger_orders_are_aligned() {
        let block = alloc_order(3).unwrap();
        assert_eq!(block.as_u64() % size_for_order(3) as u64, 0);
        free(block);
        assert!(verify_invariants());
    }

    #[test_case]
    fn double_free_is_ignored() {
        let a = alloc_order(1).unwrap();
        free(a);
        let free_before = free_memory();
        free(a);
        assert_eq!(free_memory(), free_before);
    }

    #[test_case]
    fn exhaustion_returns_none() {
        // An order above the maximum can never be satisfied.
        assert!(alloc_order(BUDDY_MAX_ORDER + 1).is_none());
    }
}
