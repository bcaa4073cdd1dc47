//! Memory management.
//!
//! Physical layout (fixed by the boot contract):
//!
//! ```text
//! 0x00000000 - 0x000FFFFF : Low memory (BIOS, VGA buffer)      [1 MiB]
//! 0x00100000 - 0x001FFFFF : Kernel image                       [1 MiB]
//! 0x00200000 - 0x002FFFFF : Early bump heap                    [1 MiB]
//! 0x00300000 - 0x003FFFFF : Page frame bitmap                  [1 MiB]
//! 0x00400000 - 0x07FFFFFF : Free pages managed by the PMM      [124 MiB]
//! ```
//!
//! Virtual layout (higher half): all physical memory is direct-mapped at
//! `DIRECT_MAP_BASE`; kernel code/data sit at `KERNEL_BASE`; the heap and
//! stack windows follow.

pub mod buddy;
pub mod heap;
pub mod kmalloc;
pub mod pmm;
pub mod slab;
pub mod vmm;

/// Size of a page frame (4 KiB).
pub const PAGE_SIZE: usize = 4096;

pub const PHYS_LOW_MEM_START: u64 = 0x0000_0000;
pub const PHYS_LOW_MEM_END: u64 = 0x0010_0000;
pub const PHYS_KERNEL_START: u64 = 0x0010_0000;
pub const PHYS_KERNEL_END: u64 = 0x0020_0000;
pub const PHYS_HEAP_START: u64 = 0x0020_0000;
pub const PHYS_HEAP_END: u64 = 0x0030_0000;
pub const PHYS_BITMAP_START: u64 = 0x0030_0000;
pub const PHYS_BITMAP_END: u64 = 0x0040_0000;
/// First frame handed out by the PMM.
pub const PHYS_FREE_START: u64 = 0x0040_0000;
/// End of managed physical memory (128 MiB machine).
pub const PHYS_MEMORY_END: u64 = 0x0800_0000;

/// Base of the physical-memory direct map.
pub const DIRECT_MAP_BASE: u64 = 0xFFFF_8000_0000_0000;
/// Kernel code/data window.
pub const KERNEL_BASE: u64 = 0xFFFF_FFFF_8000_0000;
/// Kernel heap window.
pub const KERNEL_HEAP_BASE: u64 = 0xFFFF_FFFF_A000_0000;
/// Kernel stack window.
pub const KERNEL_STACKS_BASE: u64 = 0xFFFF_FFFF_C000_0000;

/// Physical memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysAddr(u64);

impl PhysAddr {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.0 % PAGE_SIZE as u64 == 0
    }

    pub const fn align_down(&self) -> Self {
        Self(self.0 & !(PAGE_SIZE as u64 - 1))
    }

    pub const fn align_up(&self) -> Self {
        Self((self.0 + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1))
    }

    pub const fn offset(&self, offset: u64) -> Self {
        Self(self.0 + offset)
    }
}

/// Virtual memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtAddr(u64);

impl VirtAddr {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn as_ptr<T>(&self) -> *const T {
        self.0 as *const T
    }

    pub const fn as_mut_ptr<T>(&self) -> *mut T {
        self.0 as *mut T
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.0 % PAGE_SIZE as u64 == 0
    }

    pub const fn align_down(&self) -> Self {
        Self(self.0 & !(PAGE_SIZE as u64 - 1))
    }
}

/// CPU-visible alias of a physical address through the direct map.
pub const fn phys_to_virt(phys: PhysAddr) -> VirtAddr {
    VirtAddr::new(DIRECT_MAP_BASE + phys.as_u64())
}

/// Recover the physical address behind a direct-map pointer.
pub fn virt_to_phys(virt: VirtAddr) -> PhysAddr {
    debug_assert!(
        virt.as_u64() >= DIRECT_MAP_BASE,
        "virt_to_phys on a non-direct-map address"
    );
    PhysAddr::new(virt.as_u64() - DIRECT_MAP_BASE)
}

/// Bring up the allocator stack: early heap, page-frame bitmap, page tables,
/// buddy, slab, kmalloc dispatch.
pub fn init() -> Result<(), crate::error::KernelError> {
    heap::init();
    pmm::init()?;
    vmm::init()?;
    buddy::init()?;
    slab::init()?;
    kmalloc::mark_ready();

    serial_println!("[MM] Allocator stack online");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn direct_map_round_trip() {
        let phys = PhysAddr::new(0x42_3000);
        let virt = phys_to_virt(phys);
        assert_eq!(virt.as_u64(), DIRECT_MAP_BASE + 0x42_3000);
        assert_eq!(virt_to_phys(virt), phys);
    }

    #[test_case]
    fn alignment_helpers() {
        assert!(PhysAddr::new(0x1000).is_page_aligned());
        assert!(!PhysAddr::new(0x1001).is_page_aligned());
        assert_eq!(PhysAddr::new(0x1001).align_down().as_u64(), 0x1000);
        assert_eq!(PhysAddr::new(0x1001).align_up().as_u64(), 0x2000);
    }
}
