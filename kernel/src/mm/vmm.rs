//! Virtual memory manager.
//!
//! Walks the 4-level page-table hierarchy rooted in CR3. Tables are reached
//! through the physical direct map, so no recursive-mapping trick is needed.
//! Intermediate tables are created on demand from fresh zeroed PMM frames.

use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use x86_64::registers::control::Cr3;

use super::{phys_to_virt, pmm, PhysAddr, VirtAddr};
use crate::error::KernelError;

bitflags! {
    /// Page-table entry flags (bits 0..11 and bit 63).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        const HUGE          = 1 << 7;
        const GLOBAL        = 1 << 8;
        const NO_EXECUTE    = 1 << 63;
    }
}

/// Physical-frame field of an entry: bits 12..51.
const ENTRY_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

const fn pml4_index(addr: u64) -> usize {
    ((addr >> 39) & 0x1FF) as usize
}

const fn pdpt_index(addr: u64) -> usize {
    ((addr >> 30) & 0x1FF) as usize
}

const fn pd_index(addr: u64) -> usize {
    ((addr >> 21) & 0x1FF) as usize
}

const fn pt_index(addr: u64) -> usize {
    ((addr >> 12) & 0x1FF) as usize
}

const fn entry_addr(entry: u64) -> u64 {
    entry & ENTRY_ADDR_MASK
}

/// Current page-table root (physical address of the PML4).
static PML4_PHYS: AtomicU64 = AtomicU64::new(0);

/// Table view through the direct map.
///
/// SAFETY contract: `phys` must be the page-aligned physical address of a
/// live page table owned by the current hierarchy.
unsafe fn table_mut(phys: u64) -> &'static mut [u64; 512] {
    // SAFETY: See function contract; the direct map covers all physical
    // memory so the cast produces a valid, exclusive reference for the
    // single-core walk.
    unsafe { &mut *(phys_to_virt(PhysAddr::new(phys)).as_mut_ptr::<[u64; 512]>()) }
}

/// Capture the boot page tables as the active hierarchy.
pub fn init() -> Result<(), KernelError> {
    let (frame, _) = Cr3::read();
    PML4_PHYS.store(frame.start_address().as_u64(), Ordering::SeqCst);

    serial_println!("[VMM] PML4 at {:#x}", PML4_PHYS.load(Ordering::SeqCst));
    Ok(())
}

/// Physical address of the active PML4.
pub fn root() -> PhysAddr {
    PhysAddr::new(PML4_PHYS.load(Ordering::SeqCst))
}

/// Walk one level down, creating the next table if `create` and the entry is
/// absent. Returns the next table's physical address.
fn next_table(entry: &mut u64, create: bool) -> Result<u64, KernelError> {
    if *entry & PageFlags::PRESENT.bits() == 0 {
        if !create {
            return Err(KernelError::NotFound);
        }
        let table_phys = pmm::alloc_page().ok_or(KernelError::OutOfMemory)?;
        // SAFETY: Fresh PMM frame, exclusively ours until linked below.
        unsafe { table_mut(table_phys.as_u64()).fill(0) };
        *entry = table_phys.as_u64() | (PageFlags::PRESENT | PageFlags::WRITABLE).bits();
        Ok(table_phys.as_u64())
    } else {
        Ok(entry_addr(*entry))
    }
}

/// Map a 4 KiB page. Both addresses must be page-aligned.
pub fn map_page(virt: VirtAddr, phys: PhysAddr, flags: PageFlags) -> Result<(), KernelError> {
    if !virt.is_page_aligned() || !phys.is_page_aligned() {
        return Err(KernelError::InvalidArgument);
    }

    let addr = virt.as_u64();
    // SAFETY: root() is the live hierarchy captured at init.
    let pml4 = unsafe { table_mut(root().as_u64()) };
    let pdpt_phys = next_table(&mut pml4[pml4_index(addr)], true)?;
    // SAFETY: next_table returned a live table of this hierarchy.
    let pdpt = unsafe { table_mut(pdpt_phys) };
    let pd_phys = next_table(&mut pdpt[pdpt_index(addr)], true)?;
    // SAFETY: as above.
    let pd = unsafe { table_mut(pd_phys) };
    let pt_phys = next_table(&mut pd[pd_index(addr)], true)?;
    // SAFETY: as above.
    let pt = unsafe { table_mut(pt_phys) };

    pt[pt_index(addr)] = phys.as_u64() | flags.bits();

    flush_tlb_page(virt);
    Ok(())
}

/// Unmap a 4 KiB page. Fails with `NotFound` when any level is absent.
pub fn unmap_page(virt: VirtAddr) -> Result<(), KernelError> {
    if !virt.is_page_aligned() {
        return Err(KernelError::InvalidArgument);
    }

    let addr = virt.as_u64();
    // SAFETY: live hierarchy, as in map_page.
    let pml4 = unsafe { table_mut(root().as_u64()) };
    let pdpt_phys = next_table(&mut pml4[pml4_index(addr)], false)?;
    // SAFETY: as above.
    let pdpt = unsafe { table_mut(pdpt_phys) };
    let pd_phys = next_table(&mut pdpt[pdpt_index(addr)], false)?;
    // SAFETY: as above.
    let pd = unsafe { table_mut(pd_phys) };
    let pt_phys = next_table(&mut pd[pd_index(addr)], false)?;
    // SAFETY: as above.
    let pt = unsafe { table_mut(pt_phys) };

    let entry = &mut pt[pt_index(addr)];
    if *entry & PageFlags::PRESENT.bits() == 0 {
        return Err(KernelError::NotFound);
    }
    *entry = 0;

    flush_tlb_page(virt);
    Ok(())
}

/// Translate a virtual address. Honors 1 GiB mappings at the PDPT level and
/// 2 MiB mappings at the PD level. Returns `None` when not mapped.
pub fn get_physical(virt: VirtAddr) -> Option<PhysAddr> {
    let addr = virt.as_u64();
    // SAFETY: live hierarchy, read-only walk.
    let pml4 = unsafe { table_mut(root().as_u64()) };
    let pml4e = pml4[pml4_index(addr)];
    if pml4e & PageFlags::PRESENT.bits() == 0 {
        return None;
    }

    // SAFETY: entry was present, so it points at a live table.
    let pdpt = unsafe { table_mut(entry_addr(pml4e)) };
    let pdpte = pdpt[pdpt_index(addr)];
    if pdpte & PageFlags::PRESENT.bits() == 0 {
        return None;
    }
    if pdpte & PageFlags::HUGE.bits() != 0 {
        // 1 GiB page: base plus the low 30 bits of the input.
        return Some(PhysAddr::new(entry_addr(pdpte) + (addr & 0x3FFF_FFFF)));
    }

    // SAFETY: as above.
    let pd = unsafe { table_mut(entry_addr(pdpte)) };
    let pde = pd[pd_index(addr)];
    if pde & PageFlags::PRESENT.bits() == 0 {
        return None;
    }
    if pde & PageFlags::HUGE.bits() != 0 {
        // 2 MiB page: base plus the low 21 bits of the input.
        return Some(PhysAddr::new(entry_addr(pde) + (addr & 0x1F_FFFF)));
    }

    // SAFETY: as above.
    let pt = unsafe { table_mut(entry_addr(pde)) };
    let pte = pt[pt_index(addr)];
    if pte & PageFlags::PRESENT.bits() == 0 {
        return None;
    }

    Some(PhysAddr::new(entry_addr(pte) + (addr & 0xFFF)))
}

pub fn is_mapped(virt: VirtAddr) -> bool {
    get_physical(virt).is_some()
}

/// Allocate a fresh frame from the PMM and map it at `virt`.
pub fn alloc_page(virt: VirtAddr, flags: PageFlags) -> Result<(), KernelError> {
    let phys = pmm::alloc_page().ok_or(KernelError::OutOfMemory)?;
    if let Err(err) = map_page(virt, phys, flags) {
        pmm::free_page(phys);
        return Err(err);
    }
    Ok(())
}

/// Unmap `virt` and return its frame to the PMM.
pub fn free_page(virt: VirtAddr) -> Result<(), KernelError> {
    let phys = get_physical(virt).ok_or(KernelError::NotFound)?;
    unmap_page(virt)?;
    pmm::free_page(phys.align_down());
    Ok(())
}

/// Invalidate the TLB entry for one page.
pub fn flush_tlb_page(virt: VirtAddr) {
    x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(virt.as_u64()));
}

/// Flush the whole TLB by reloading CR3.
pub fn flush_tlb_all() {
    let (frame, flags) = Cr3::read();
    // SAFETY: Reloading CR3 with the current root is always valid and only
    // has the architectural effect of flushing non-global TLB entries.
    unsafe { Cr3::write(frame, flags) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::KERNEL_HEAP_BASE;

    #[test_case]
    fn map_translate_unmap() {
        let virt = VirtAddr::new(KERNEL_HEAP_BASE);
        let phys = pmm::alloc_page().unwrap();

        map_page(virt, phys, PageFlags::PRESENT | PageFlags::WRITABLE).unwrap();
        assert_eq!(get_physical(virt), Some(phys));

        // A mapped page is readable and writable through the new alias.
        // SAFETY: The page was just mapped writable and nothing else
        // references this virtual window.
        unsafe {
            let ptr = virt.as_mut_ptr::<u64>();
            ptr.write_volatile(0xDEAD_BEEF_CAFE_F00D);
            assert_eq!(ptr.read_volatile(), 0xDEAD_BEEF_CAFE_F00D);
        }

        unmap_page(virt).unwrap();
        assert_eq!(get_physical(virt), None);
        pmm::free_page(phys);
    }

    #[test_case]
    fn translate_offset_within_page() {
        let virt = VirtAddr::new(KERNEL_HEAP_BASE + 0x10_0000);
        let phys = pmm::alloc_page().unwrap();
        map_page(virt, phys, PageFlags::PRESENT | PageFlags::WRITABLE).unwrap();

        let inside = VirtAddr::new(virt.as_u64() + 0x123);
        assert_eq!(get_physical(inside), Some(phys.offset(0x123)));

        unmap_page(virt).unwrap();
        pmm::free_page(phys);
    }

    #[test_case]
    fn unmap_missing_fails() {
        let virt = VirtAddr::new(KERNEL_HEAP_BASE + 0x2000_0000);
        assert_eq!(unmap_page(virt), Err(KernelError::NotFound));
    }

    #[test_case]
    fn unaligned_is_rejected() {
        let virt = VirtAddr::new(KERNEL_HEAP_BASE + 1);
        assert_eq!(
            map_page(virt, PhysAddr::new(0x1000), PageFlags::PRESENT),
            Err(KernelError::InvalidArgument)
        );
    }
}
