//! NVMe driver.
//!
//! PCI discovery, controller reset and bring-up, admin and I/O queue pairs,
//! namespace enumeration, and single-block PRP1 reads and writes. The
//! completion side polls the phase bit: an entry belongs to the current
//! sweep iff its status low bit equals the queue's expected phase, which
//! flips every time the completion head wraps.

// Identify structures carry every field the hardware defines even though the
// driver only consumes a handful of them.
#![allow(dead_code)]

use alloc::boxed::Box;
use alloc::format;

use spin::Mutex;

use super::block::{self, BlockDevice, BlockDeviceType, BlockDriver};
use super::pci;
use super::{Driver, DriverKind, DriverStatus};
use crate::error::KernelError;
use crate::mm::{self, kmalloc, vmm, PhysAddr, VirtAddr, PAGE_SIZE};

// Register offsets.
const REG_CAP: u32 = 0x00;
const REG_VS: u32 = 0x08;
const REG_CC: u32 = 0x14;
const REG_CSTS: u32 = 0x1C;
const REG_AQA: u32 = 0x24;
const REG_ASQ: u32 = 0x28;
const REG_ACQ: u32 = 0x30;

// Doorbells (stride fixed at 4 bytes; CAP.DSTRD is logged at bring-up).
const DOORBELL_ADMIN_SQ: u32 = 0x1000;
const DOORBELL_ADMIN_CQ: u32 = 0x1004;
const DOORBELL_IO_SQ: u32 = 0x1008;
const DOORBELL_IO_CQ: u32 = 0x100C;

// Controller configuration bits.
const CC_ENABLE: u32 = 1 << 0;
const CC_CSS_NVM: u32 = 0 << 4;
const CC_MPS_4K: u32 = 0 << 7;
const CC_AMS_RR: u32 = 0 << 11;
const CC_SHN_NONE: u32 = 0 << 14;
const CC_IOSQES: u32 = 6 << 16;
const CC_IOCQES: u32 = 4 << 20;

// Controller status bits.
const CSTS_RDY: u32 = 1 << 0;
const CSTS_CFS: u32 = 1 << 1;

// Admin opcodes.
const ADMIN_CREATE_SQ: u8 = 0x01;
const ADMIN_CREATE_CQ: u8 = 0x05;
const ADMIN_IDENTIFY: u8 = 0x06;

// I/O opcodes.
const CMD_WRITE: u8 = 0x01;
const CMD_READ: u8 = 0x02;

// Identify CNS values.
const IDENTIFY_NAMESPACE: u32 = 0x00;
const IDENTIFY_CONTROLLER: u32 = 0x01;

const ADMIN_QUEUE_SIZE: u16 = 64;
const IO_QUEUE_SIZE: u16 = 1024;
pub const MAX_NAMESPACES: u32 = 16;

const DISABLE_TIMEOUT: u32 = 1_000_000;
const READY_TIMEOUT: u32 = 5_000_000;
const COMPLETION_TIMEOUT: u32 = 5_000_000;

/// Submission queue entry (64 bytes). Dword 0 carries the opcode in its low
/// byte and the command id in bits 16..32.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct SqEntry {
    cdw0: u32,
    nsid: u32,
    _reserved: u64,
    mptr: u64,
    prp1: u64,
    prp2: u64,
    cdw10: u32,
    cdw11: u32,
    cdw12: u32,
    cdw13: u32,
    cdw14: u32,
    cdw15: u32,
}

impl SqEntry {
    const fn zeroed() -> Self {
        Self {
            cdw0: 0,
            nsid: 0,
            _reserved: 0,
            mptr: 0,
            prp1: 0,
            prp2: 0,
            cdw10: 0,
            cdw11: 0,
            cdw12: 0,
            cdw13: 0,
            cdw14: 0,
            cdw15: 0,
        }
    }
}

/// Completion queue entry (16 bytes). Status bit 0 is the phase bit, bits
/// 1..12 the status code.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct CqEntry {
    result: u32,
    _reserved: u32,
    sq_head: u16,
    sq_id: u16,
    cid: u16,
    status: u16,
}

/// Identify Controller data (prefix of the 4 KiB identify page).
#[repr(C, packed)]
struct IdentifyController {
    vid: u16,
    ssvid: u16,
    sn: [u8; 20],
    mn: [u8; 40],
    fr: [u8; 8],
    rab: u8,
    ieee: [u8; 3],
    cmic: u8,
    mdts: u8,
    cntlid: u16,
    ver: u32,
    _reserved1: [u8; 172],
    oacs: u16,
    acl: u8,
    aerl: u8,
    frmw: u8,
    lpa: u8,
    elpe: u8,
    npss: u8,
    _reserved2: [u8; 248],
    sqes: u8,
    cqes: u8,
    _reserved3: [u8; 2],
    /// Number of namespaces.
    nn: u32,
}

/// Identify Namespace data (4 KiB page).
#[repr(C, packed)]
struct IdentifyNamespace {
    nsze: u64,
    ncap: u64,
    nuse: u64,
    nsfeat: u8,
    nlbaf: u8,
    flbas: u8,
    mc: u8,
    dpc: u8,
    dps: u8,
    _reserved1: [u8; 98],
    lbaf: [LbaFormat; 16],
    _reserved2: [u8; 192],
    _vendor: [u8; 3712],
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
struct LbaFormat {
    ms: u16,
    /// LBA data size as a power of two.
    lbads: u8,
    rp: u8,
}

/// A submission/completion queue pair with its DMA backing pages.
struct QueuePair {
    sq: *mut SqEntry,
    cq: *mut CqEntry,
    sq_phys: u64,
    cq_phys: u64,
    sq_size: u16,
    cq_size: u16,
    sq_tail: u16,
    cq_head: u16,
    cq_phase: u8,
}

impl QueuePair {
    /// Allocate physically contiguous, page-aligned queues via the buddy
    /// path and record both addresses.
    fn new(sq_size: u16, cq_size: u16) -> Result<Self, KernelError> {
        let sq_bytes = sq_size as usize * core::mem::size_of::<SqEntry>();
        let cq_bytes = cq_size as usize * core::mem::size_of::<CqEntry>();
        let sq_pages = sq_bytes.div_ceil(PAGE_SIZE);
        let cq_pages = cq_bytes.div_ceil(PAGE_SIZE);

        let sq = kmalloc::alloc_pages(sq_pages) as *mut SqEntry;
        if sq.is_null() {
            return Err(KernelError::OutOfMemory);
        }
        let cq = kmalloc::alloc_pages(cq_pages) as *mut CqEntry;
        if cq.is_null() {
            kmalloc::free_pages(sq as *mut u8, sq_pages);
            return Err(KernelError::OutOfMemory);
        }

        // SAFETY: both regions were just allocated with the stated sizes.
        unsafe {
            core::ptr::write_bytes(sq as *mut u8, 0, sq_bytes);
            core::ptr::write_bytes(cq as *mut u8, 0, cq_bytes);
        }

        let sq_phys = mm::virt_to_phys(VirtAddr::new(sq as u64)).as_u64();
        let cq_phys = mm::virt_to_phys(VirtAddr::new(cq as u64)).as_u64();

        serial_println!(
            "[NVME] Queue pair: SQ {:#x}/{:#x} CQ {:#x}/{:#x}",
            sq as u64,
            sq_phys,
            cq as u64,
            cq_phys
        );

        Ok(Self {
            sq,
            cq,
            sq_phys,
            cq_phys,
            sq_size,
            cq_size,
            sq_tail: 0,
            cq_head: 0,
            cq_phase: 1,
        })
    }
}

pub struct NvmeController {
    /// Virtual base of the register window (BAR0 through the direct map).
    bar0: *mut u8,
    admin: QueuePair,
    io: Option<QueuePair>,
    num_namespaces: u32,
    command_id: u16,
}

// SAFETY: All raw pointers reference DMA pages and the MMIO window owned by
// this controller; access is serialized by the Mutex around it.
unsafe impl Send for NvmeController {}

fn reg_read32(bar0: *mut u8, offset: u32) -> u32 {
    // SAFETY: Reading an NVMe MMIO register inside the mapped BAR0 window.
    // read_volatile keeps the hardware access from being elided or reordered.
    unsafe { core::ptr::read_volatile(bar0.add(offset as usize) as *const u32) }
}

fn reg_write32(bar0: *mut u8, offset: u32, value: u32) {
    // SAFETY: Writing an NVMe MMIO register. Same invariants as reg_read32.
    unsafe { core::ptr::write_volatile(bar0.add(offset as usize) as *mut u32, value) }
}

fn reg_read64(bar0: *mut u8, offset: u32) -> u64 {
    // SAFETY: 64-bit MMIO read (CAP). Same invariants as reg_read32.
    unsafe { core::ptr::read_volatile(bar0.add(offset as usize) as *const u64) }
}

fn reg_write64(bar0: *mut u8, offset: u32, value: u64) {
    // SAFETY: 64-bit MMIO write (ASQ/ACQ). Same invariants as reg_read32.
    unsafe { core::ptr::write_volatile(bar0.add(offset as usize) as *mut u64, value) }
}

impl NvmeController {
    fn next_command_id(&mut self) -> u16 {
        let cid = self.command_id;
        self.command_id = self.command_id.wrapping_add(1);
        cid
    }

    /// Copy a prepared entry into the submission queue, advance the tail and
    /// ring the matching doorbell.
    fn submit_command(&mut self, is_admin: bool, entry: &SqEntry) {
        let bar0 = self.bar0;
        let qp = if is_admin {
            &mut self.admin
        } else {
            self.io.as_mut().expect("I/O queue not created")
        };

        // SAFETY: sq_tail < sq_size indexes the queue's own DMA pages.
        unsafe {
            core::ptr::write_volatile(qp.sq.add(qp.sq_tail as usize), *entry);
        }
        qp.sq_tail = (qp.sq_tail + 1) % qp.sq_size;

        let doorbell = if is_admin { DOORBELL_ADMIN_SQ } else { DOORBELL_IO_SQ };
        reg_write32(bar0, doorbell, qp.sq_tail as u32);
    }

    /// Poll the completion queue for command `cid`. Entries whose phase bit
    /// matches but whose command id does not are consumed and dropped
    /// (single-outstanding-command discipline).
    fn wait_completion(&mut self, is_admin: bool, cid: u16) -> Result<(), KernelError> {
        let bar0 = self.bar0;
        let qp = if is_admin {
            &mut self.admin
        } else {
            self.io.as_mut().expect("I/O queue not created")
        };
        let doorbell = if is_admin { DOORBELL_ADMIN_CQ } else { DOORBELL_IO_CQ };

        for _ in 0..COMPLETION_TIMEOUT {
            // SAFETY: cq_head < cq_size indexes the queue's DMA pages; the
            // device writes entries, so the read must be volatile.
            let entry = unsafe { core::ptr::read_volatile(qp.cq.add(qp.cq_head as usize)) };
            let phase = (entry.status & 1) as u8;

            if phase == qp.cq_phase {
                // Consume the entry whether or not it is ours.
                qp.cq_head = (qp.cq_head + 1) % qp.cq_size;
                if qp.cq_head == 0 {
                    qp.cq_phase ^= 1;
                }
                reg_write32(bar0, doorbell, qp.cq_head as u32);

                if entry.cid == cid {
                    let status_code = (entry.status >> 1) & 0x7FF;
                    return if status_code == 0 {
                        Ok(())
                    } else {
                        serial_println!(
                            "[NVME] Command {} failed, status {:#x}",
                            cid,
                            status_code
                        );
                        Err(KernelError::HardwareFault)
                    };
                }
                continue;
            }

            core::hint::spin_loop();
        }

        Err(KernelError::Timeout)
    }

    /// Submit an Identify command with PRP1 pointing at a page-aligned DMA
    /// buffer, then run `parse` over the returned page.
    fn identify<R>(
        &mut self,
        nsid: u32,
        cns: u32,
        parse: impl FnOnce(*const u8) -> R,
    ) -> Result<R, KernelError> {
        let buffer = kmalloc::alloc_pages(1);
        if buffer.is_null() {
            return Err(KernelError::OutOfMemory);
        }
        // SAFETY: one fresh page.
        unsafe { core::ptr::write_bytes(buffer, 0, PAGE_SIZE) };

        let buffer_phys = mm::virt_to_phys(VirtAddr::new(buffer as u64)).as_u64();
        let cid = self.next_command_id();

        let mut entry = SqEntry::zeroed();
        entry.cdw0 = ADMIN_IDENTIFY as u32 | ((cid as u32) << 16);
        entry.nsid = nsid;
        entry.prp1 = buffer_phys;
        entry.cdw10 = cns;

        self.submit_command(true, &entry);
        let result = self.wait_completion(true, cid);

        let parsed = result.map(|()| parse(buffer as *const u8));
        kmalloc::free_pages(buffer, 1);
        parsed
    }

    fn create_io_cq(&mut self) -> Result<(), KernelError> {
        let io = self.io.as_ref().expect("I/O queue not allocated");
        let (cq_phys, cq_size) = (io.cq_phys, io.cq_size);
        let cid = self.next_command_id();

        let mut entry = SqEntry::zeroed();
        entry.cdw0 = ADMIN_CREATE_CQ as u32 | ((cid as u32) << 16);
        entry.prp1 = cq_phys;
        // Queue size (zero-based) and queue id 1.
        entry.cdw10 = ((cq_size as u32 - 1) << 16) | 1;
        // Physically contiguous.
        entry.cdw11 = 0x1;

        self.submit_command(true, &entry);
        self.wait_completion(true, cid)
    }

    fn create_io_sq(&mut self) -> Result<(), KernelError> {
        let io = self.io.as_ref().expect("I/O queue not allocated");
        let (sq_phys, sq_size) = (io.sq_phys, io.sq_size);
        let cid = self.next_command_id();

        let mut entry = SqEntry::zeroed();
        entry.cdw0 = ADMIN_CREATE_SQ as u32 | ((cid as u32) << 16);
        entry.prp1 = sq_phys;
        entry.cdw10 = ((sq_size as u32 - 1) << 16) | 1;
        // Completion queue id 1, physically contiguous.
        entry.cdw11 = (1 << 16) | 0x1;

        self.submit_command(true, &entry);
        self.wait_completion(true, cid)
    }

    /// Single-block transfer: PRP1 carries the buffer's physical address,
    /// cdw10/11 the LBA, cdw12 a zero-based block count (0 = one block).
    fn transfer_block(
        &mut self,
        opcode: u8,
        nsid: u32,
        lba: u64,
        buffer_phys: u64,
    ) -> Result<(), KernelError> {
        let cid = self.next_command_id();

        let mut entry = SqEntry::zeroed();
        entry.cdw0 = opcode as u32 | ((cid as u32) << 16);
        entry.nsid = nsid;
        entry.prp1 = buffer_phys;
        entry.cdw10 = lba as u32;
        entry.cdw11 = (lba >> 32) as u32;
        entry.cdw12 = 0;

        self.submit_command(false, &entry);
        self.wait_completion(false, cid)
    }
}

/// One namespace as seen by the block layer.
struct NvmeNamespace {
    controller: &'static Mutex<NvmeController>,
    nsid: u32,
}

impl NvmeNamespace {
    /// DMA address of a caller buffer. Buffers reach this driver through
    /// kmalloc, so they are direct-map reachable and physically contiguous.
    fn dma_addr(buffer: *const u8) -> u64 {
        mm::virt_to_phys(VirtAddr::new(buffer as u64)).as_u64()
    }
}

impl BlockDriver for NvmeNamespace {
    fn read_block(
        &self,
        _dev: &BlockDevice,
        lba: u64,
        buffer: &mut [u8],
    ) -> Result<(), KernelError> {
        let phys = Self::dma_addr(buffer.as_ptr());
        self.controller
            .lock()
            .transfer_block(CMD_READ, self.nsid, lba, phys)
    }

    fn write_block(
        &self,
        _dev: &BlockDevice,
        lba: u64,
        buffer: &[u8],
    ) -> Result<(), KernelError> {
        let phys = Self::dma_addr(buffer.as_ptr());
        self.controller
            .lock()
            .transfer_block(CMD_WRITE, self.nsid, lba, phys)
    }

    fn flush(&self, _dev: &BlockDevice) -> Result<(), KernelError> {
        // The controller manages its own write cache.
        Ok(())
    }
}

/// Map the BAR0 register window into the direct-map region with caching
/// disabled.
fn map_bar(bar_phys: u64) -> Result<*mut u8, KernelError> {
    let bar_virt = mm::phys_to_virt(PhysAddr::new(bar_phys));
    let window = 64 * 1024;

    for offset in (0..window).step_by(PAGE_SIZE) {
        let virt = VirtAddr::new(bar_virt.as_u64() + offset as u64).align_down();
        let phys = PhysAddr::new(bar_phys + offset as u64).align_down();

        if !vmm::is_mapped(virt) {
            vmm::map_page(
                virt,
                phys,
                vmm::PageFlags::PRESENT | vmm::PageFlags::WRITABLE | vmm::PageFlags::CACHE_DISABLE,
            )
            .map_err(|_| KernelError::HardwareFault)?;
        }
    }

    Ok(bar_virt.as_mut_ptr())
}

fn driver_init() -> Result<(), KernelError> {
    let (bus, slot, func) =
        pci::find_by_class(0x01, 0x08, 0x02).ok_or(KernelError::NotFound)?;
    serial_println!("[NVME] Found NVMe controller at PCI {:02x}:{:02x}", bus, slot);

    // Enable memory space and bus mastering.
    let command = pci::config_read(bus, slot, func, pci::REG_COMMAND);
    pci::config_write(
        bus,
        slot,
        func,
        pci::REG_COMMAND,
        command | pci::COMMAND_MEMORY_SPACE | pci::COMMAND_BUS_MASTER,
    );

    // BAR0 is a 64-bit memory BAR.
    let bar_low = pci::config_read(bus, slot, func, pci::REG_BAR0);
    let bar_high = pci::config_read(bus, slot, func, pci::REG_BAR1);
    let bar_phys = ((bar_high as u64) << 32) | (bar_low as u64 & 0xFFFF_FFF0);
    serial_println!("[NVME] BAR0 at {:#x}", bar_phys);

    let bar0 = map_bar(bar_phys)?;

    let version = reg_read32(bar0, REG_VS);
    serial_println!(
        "[NVME] Version {}.{}.{}",
        (version >> 16) & 0xFFFF,
        (version >> 8) & 0xFF,
        version & 0xFF
    );

    let cap = reg_read64(bar0, REG_CAP);
    let dstrd = (cap >> 32) & 0xF;
    serial_println!("[NVME] CAP {:#x} (DSTRD {}, stride fixed at 4)", cap, dstrd);

    // Disable the controller and wait for ready to clear.
    let cc = reg_read32(bar0, REG_CC);
    reg_write32(bar0, REG_CC, cc & !CC_ENABLE);

    let mut disabled = false;
    for _ in 0..DISABLE_TIMEOUT {
        if reg_read32(bar0, REG_CSTS) & CSTS_RDY == 0 {
            disabled = true;
            break;
        }
        core::hint::spin_loop();
    }
    if !disabled {
        serial_println!("[NVME] Timeout waiting for controller disable");
        return Err(KernelError::Timeout);
    }

    // Admin queues.
    let admin = QueuePair::new(ADMIN_QUEUE_SIZE, ADMIN_QUEUE_SIZE)?;
    reg_write64(bar0, REG_ASQ, admin.sq_phys);
    reg_write64(bar0, REG_ACQ, admin.cq_phys);
    let aqa = ((ADMIN_QUEUE_SIZE as u32 - 1) << 16) | (ADMIN_QUEUE_SIZE as u32 - 1);
    reg_write32(bar0, REG_AQA, aqa);

    // Enable: NVM command set, 4 KiB pages, round-robin arbitration, the
    // standard 64/16-byte queue entry sizes.
    reg_write32(
        bar0,
        REG_CC,
        CC_ENABLE | CC_CSS_NVM | CC_MPS_4K | CC_AMS_RR | CC_SHN_NONE | CC_IOSQES | CC_IOCQES,
    );

    let mut ready = false;
    for _ in 0..READY_TIMEOUT {
        let csts = reg_read32(bar0, REG_CSTS);
        if csts & CSTS_CFS != 0 {
            serial_println!("[NVME] Controller fatal status during enable");
            return Err(KernelError::HardwareFault);
        }
        if csts & CSTS_RDY != 0 {
            ready = true;
            break;
        }
        core::hint::spin_loop();
    }
    if !ready {
        serial_println!("[NVME] Timeout waiting for controller ready");
        return Err(KernelError::Timeout);
    }

    let mut controller = NvmeController {
        bar0,
        admin,
        io: None,
        num_namespaces: 0,
        command_id: 0,
    };

    // Identify the controller to learn the namespace count.
    let nn = controller.identify(0, IDENTIFY_CONTROLLER, |page| {
        // SAFETY: page is the 4 KiB identify buffer; IdentifyController is
        // a prefix of it.
        let id = unsafe { &*(page as *const IdentifyController) };
        id.nn
    })?;
    controller.num_namespaces = nn;
    serial_println!("[NVME] {} namespaces", nn);

    // I/O queues.
    controller.io = Some(QueuePair::new(IO_QUEUE_SIZE, IO_QUEUE_SIZE)?);
    controller.create_io_cq()?;
    controller.create_io_sq()?;

    let controller: &'static Mutex<NvmeController> = Box::leak(Box::new(Mutex::new(controller)));

    // Register a block device per non-empty namespace.
    let mut registered = 0u32;
    for index in 0..nn.min(MAX_NAMESPACES) {
        let nsid = index + 1;
        let info = controller.lock().identify(nsid, IDENTIFY_NAMESPACE, |page| {
            // SAFETY: page is the 4 KiB identify buffer laid out as
            // IdentifyNamespace.
            let id = unsafe { &*(page as *const IdentifyNamespace) };
            // Copy out of the packed struct before indexing.
            let formats = id.lbaf;
            let lba_format = formats[(id.flbas & 0x0F) as usize];
            (id.nsze, lba_format.lbads)
        })?;

        let (nsze, lbads) = info;
        if nsze == 0 {
            continue;
        }

        let block_size = 1u32 << lbads;
        let label = format!("NVME{}", index);
        let size_mb = nsze * block_size as u64 / (1024 * 1024);
        println!("  {}: Found ({} MB)", label, size_mb);

        let namespace: &'static NvmeNamespace =
            Box::leak(Box::new(NvmeNamespace { controller, nsid }));
        block::register_device(BlockDevice {
            id: 0,
            device_type: BlockDeviceType::Nvme,
            block_count: nsze,
            block_size: block_size as u16,
            present: true,
            label,
            driver: namespace,
        })?;
        registered += 1;
    }

    serial_println!("[NVME] Initialization complete, {} devices", registered);
    Ok(())
}

/// Put the NVMe driver on the registry (priority 40, after the block layer).
pub fn register_driver() -> Result<(), KernelError> {
    super::register(Driver {
        name: "NVMe",
        kind: DriverKind::Block,
        version: 1,
        priority: 40,
        status: DriverStatus::Uninitialized,
        init: driver_init,
        cleanup: None,
        depends_on: Some("Block Layer"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn sq_entry_is_64_bytes() {
        assert_eq!(core::mem::size_of::<SqEntry>(), 64);
    }

    #[test_case]
    fn cq_entry_is_16_bytes() {
        assert_eq!(core::mem::size_of::<CqEntry>(), 16);
    }

    #[test_case]
    fn identify_layout_matches_the_standard() {
        assert_eq!(core::mem::offset_of!(IdentifyController, nn), 516);
        assert_eq!(core::mem::offset_of!(IdentifyNamespace, lbaf), 128);
        assert_eq!(core::mem::size_of::<IdentifyNamespace>(), 4096);
    }

    #[test_case]
    fn phase_flips_on_wrap() {
        // Model the head/phase discipline without hardware.
        let mut head: u16 = 0;
        let mut phase: u8 = 1;
        let size: u16 = 4;

        for sweep in 0..3 {
            for _ in 0..size {
                head = (head + 1) % size;
                if head == 0 {
                    phase ^= 1;
                }
            }
            assert_eq!(phase, (sweep % 2 == 0) as u8 ^ 1);
        }
    }
}
