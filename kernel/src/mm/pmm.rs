//! Physical memory manager.
//!
//! Tracks free/used 4 KiB page frames over `[PHYS_FREE_START,
//! PHYS_MEMORY_END)` with a bitmap (one bit per frame, 0 = free, 1 = used)
//! stored in the fixed bitmap window. Higher-performance allocators (buddy,
//! slab) layer on top of this.

use spin::Mutex;

use super::{
    phys_to_virt, PhysAddr, PAGE_SIZE, PHYS_BITMAP_START, PHYS_FREE_START, PHYS_MEMORY_END,
};
use crate::error::KernelError;

struct FrameBitmap {
    bitmap: &'static mut [u8],
    total_pages: usize,
    used_pages: usize,
}

impl FrameBitmap {
    fn set(&mut self, bit: usize) {
        self.bitmap[bit / 8] |= 1 << (bit % 8);
    }

    fn clear(&mut self, bit: usize) {
        self.bitmap[bit / 8] &= !(1 << (bit % 8));
    }

    fn test(&self, bit: usize) -> bool {
        self.bitmap[bit / 8] & (1 << (bit % 8)) != 0
    }
}

static PMM: Mutex<Option<FrameBitmap>> = Mutex::new(None);

fn addr_to_page(addr: PhysAddr) -> usize {
    ((addr.as_u64() - PHYS_FREE_START) / PAGE_SIZE as u64) as usize
}

fn page_to_addr(page: usize) -> PhysAddr {
    PhysAddr::new(PHYS_FREE_START + (page * PAGE_SIZE) as u64)
}

pub fn init() -> Result<(), KernelError> {
    let total_pages = ((PHYS_MEMORY_END - PHYS_FREE_START) / PAGE_SIZE as u64) as usize;
    let bitmap_size = total_pages.div_ceil(8);

    serial_println!("[PMM] Total pages: {}", total_pages);
    serial_println!("[PMM] Bitmap size: {} bytes", bitmap_size);

    // SAFETY: The bitmap window [PHYS_BITMAP_START, PHYS_BITMAP_END) is
    // reserved for this table by the physical memory map and reached through
    // the direct map; nothing else references it.
    let bitmap = unsafe {
        core::slice::from_raw_parts_mut(
            phys_to_virt(PhysAddr::new(PHYS_BITMAP_START)).as_mut_ptr::<u8>(),
            bitmap_size,
        )
    };
    bitmap.fill(0);

    *PMM.lock() = Some(FrameBitmap {
        bitmap,
        total_pages,
        used_pages: 0,
    });

    serial_println!(
        "[PMM] Initialization complete, {} MiB free",
        free_memory() / 1024 / 1024
    );
    Ok(())
}

/// Allocate a single 4 KiB page frame (first-fit scan).
pub fn alloc_page() -> Option<PhysAddr> {
    let mut guard = PMM.lock();
    let pmm = guard.as_mut()?;

    for page in 0..pmm.total_pages {
        if !pmm.test(page) {
            pmm.set(page);
            pmm.used_pages += 1;
            return Some(page_to_addr(page));
        }
    }

    None
}

/// Allocate `count` physically contiguous page frames.
pub fn alloc_pages(count: usize) -> Option<PhysAddr> {
    if count == 0 {
        return None;
    }
    if count == 1 {
        return alloc_page();
    }

    let mut guard = PMM.lock();
    let pmm = guard.as_mut()?;

    let mut contiguous = 0;
    let mut start = 0;

    for page in 0..pmm.total_pages {
        if !pmm.test(page) {
            if contiguous == 0 {
                start = page;
            }
            contiguous += 1;

            if contiguous == count {
                for p in start..start + count {
                    pmm.set(p);
                }
                pmm.used_pages += count;
                return Some(page_to_addr(start));
            }
        } else {
            contiguous = 0;
        }
    }

    None
}

/// Free a single page frame. Out-of-range, unaligned and double frees are
/// reported to the serial log and ignored; they never corrupt the bitmap.
pub fn free_page(phys_addr: PhysAddr) {
    if phys_addr.as_u64() < PHYS_FREE_START || phys_addr.as_u64() >= PHYS_MEMORY_END {
        serial_println!("[PMM] Warning: free of out-of-range {:#x}", phys_addr.as_u64());
        return;
    }
    if !phys_addr.is_page_aligned() {
        serial_println!("[PMM] Warning: free of unaligned {:#x}", phys_addr.as_u64());
        return;
    }

    let mut guard = PMM.lock();
    let pmm = match guard.as_mut() {
        Some(pmm) => pmm,
        None => return,
    };

    let page = addr_to_page(phys_addr);
    if page >= pmm.total_pages {
        return;
    }

    if pmm.test(page) {
        pmm.clear(page);
        pmm.used_pages -= 1;
    } else {
        serial_println!("[PMM] Warning: double free of {:#x}", phys_addr.as_u64());
    }
}

/// Free `count` contiguous page frames starting at `phys_addr`.
pub fn free_pages(phys_addr: PhysAddr, count: usize) {
    for i in 0..count {
        free_page(phys_addr.offset((i * PAGE_SIZE) as u64));
    }
}

/// Mark a physical region used. The range is aligned outward and clamped to
/// the managed window.
pub fn mark_region_used(start: u64, end: u64) {
    mark_region(start, end, true);
}

/// Mark a physical region free.
pub fn mark_region_free(start: u64, end: u64) {
    mark_region(start, end, false);
}

fn mark_region(start: u64, end: u64, used: bool) {
    let mut start = PhysAddr::new(start).align_down().as_u64();
    let mut end = PhysAddr::new(end).align_up().as_u64();

    if start < PHYS_FREE_START {
        start = PHYS_FREE_START;
    }
    if end > PHYS_MEMORY_END {
        end = PHYS_MEMORY_END;
    }
    if start >= end {
        return;
    }

    let mut guard = PMM.lock();
    let pmm = match guard.as_mut() {
        Some(pmm) => pmm,
        None => return,
    };

    let start_page = addr_to_page(PhysAddr::new(start));
    let end_page = addr_to_page(PhysAddr::new(end));

    for page in start_page..end_page.min(pmm.total_pages) {
        if used && !pmm.test(page) {
            pmm.set(page);
            pmm.used_pages += 1;
        } else if !used && pmm.test(page) {
            pmm.clear(page);
            pmm.used_pages -= 1;
        }
    }
}

pub fn total_pages() -> usize {
    PMM.lock().as_ref().map_or(0, |p| p.total_pages)
}

pub fn used_pages() -> usize {
    PMM.lock().as_ref().map_or(0, |p| p.used_pages)
}

pub fn free_pages_count() -> usize {
    total_pages() - used_pages()
}

pub fn total_memory() -> u64 {
    total_pages() as u64 * PAGE_SIZE as u64
}

pub fn used_memory() -> u64 {
    used_pages() as u64 * PAGE_SIZE as u64
}

pub fn free_memory() -> u64 {
    free_pages_count() as u64 * PAGE_SIZE as u64
}

pub fn print_stats() {
    println!("\n=== Physical Memory Manager ===");
    println!(
        "Total memory: {} MB ({} pages)",
        total_memory() / 1024 / 1024,
        total_pages()
    );
    println!(
        "Used memory:  {} MB ({} pages)",
        used_memory() / 1024 / 1024,
        used_pages()
    );
    println!(
        "Free memory:  {} MB ({} pages)",
        free_memory() / 1024 / 1024,
        free_pages_count()
    );
    println!("Page size:    {} bytes\n", PAGE_SIZE);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn alloc_free_round_trip() {
        let before_used = used_pages();

        let page = alloc_page().expect("out of frames");
        assert!(page.is_page_aligned());
        assert!(page.as_u64() >= PHYS_FREE_START);
        assert_eq!(used_pages(), before_used + 1);

        free_page(page);
        assert_eq!(used_pages(), before_used);
    }

    #[test_case]
    fn conservation_holds() {
        let a = alloc_page().unwrap();
        let b = alloc_pages(4).unwrap();
        assert_eq!(used_pages() + free_pages_count(), total_pages());
        free_pages(b, 4);
        free_page(a);
        assert_eq!(used_pages() + free_pages_count(), total_pages());
    }

    #[test_case]
    fn no_duplicate_allocation() {
        let a = alloc_page().unwrap();
        let b = alloc_page().unwrap();
        assert_ne!(a, b);
        free_page(a);
        free_page(b);
    }

    #[test_case]
    fn freed_page_is_reusable() {
        let a = alloc_page().unwrap();
        free_page(a);
        let b = alloc_page().unwrap();
        // First-fit scan hands the lowest free frame back out.
        assert_eq!(a, b);
        free_page(b);
    }

    #[test_case]
    fn double_free_is_ignored() {
        let before_used = used_pages();
        let a = alloc_page().unwrap();
        free_page(a);
        free_page(a);
        assert_eq!(used_pages(), before_used);
    }

    #[test_case]
    fn contiguous_run_is_contiguous() {
        let base = alloc_pages(3).unwrap();
        // All three frames must now read as used.
        for i in 0..3 {
            let addr = base.offset((i * PAGE_SIZE) as u64);
            assert!(addr.as_u64() < PHYS_MEMORY_END);
        }
        free_pages(base, 3);
    }
}
