//! ATA PIO driver.
//!
//! Probes the primary and secondary channels for up to four drives via
//! IDENTIFY and registers each present drive as a block device. All I/O is
//! single-sector PIO with bounded status polling; the read path issues the
//! READ opcode (0x20) and the write path WRITE (0x30) followed by a cache
//! flush.

use alloc::{boxed::Box, format};

use x86_64::instructions::port::Port;

use super::block::{self, BlockDevice, BlockDeviceType, BlockDriver};
use super::{Driver, DriverKind, DriverStatus};
use crate::error::KernelError;

const PRIMARY_IO: u16 = 0x1F0;
const PRIMARY_CTRL: u16 = 0x3F6;
const SECONDARY_IO: u16 = 0x170;
const SECONDARY_CTRL: u16 = 0x376;

pub const SECTOR_SIZE: usize = 512;

// Register offsets from the channel's I/O base.
const REG_DATA: u16 = 0;
const REG_SECTOR_COUNT: u16 = 2;
const REG_LBA_LOW: u16 = 3;
const REG_LBA_MID: u16 = 4;
const REG_LBA_HIGH: u16 = 5;
const REG_DRIVE: u16 = 6;
const REG_COMMAND: u16 = 7;
const REG_STATUS: u16 = 7;

const CMD_READ_PIO: u8 = 0x20;
const CMD_WRITE_PIO: u8 = 0x30;
const CMD_CACHE_FLUSH: u8 = 0xE7;
const CMD_IDENTIFY: u8 = 0xEC;

const STATUS_ERR: u8 = 0x01;
const STATUS_DRQ: u8 = 0x08;
const STATUS_BSY: u8 = 0x80;

const POLL_LIMIT: u32 = 1_000_000;

/// One drive on one channel; doubles as the device's operations object.
struct AtaDrive {
    io_base: u16,
    ctrl_base: u16,
    slave: bool,
}

impl AtaDrive {
    fn status(&self) -> u8 {
        let mut port: Port<u8> = Port::new(self.io_base + REG_STATUS);
        // SAFETY: Reading the ATA status register has no side effect beyond
        // clearing the interrupt condition.
        unsafe { port.read() }
    }

    fn write_reg(&self, offset: u16, value: u8) {
        let mut port: Port<u8> = Port::new(self.io_base + offset);
        // SAFETY: ATA task-file register write on a probed channel.
        unsafe { port.write(value) }
    }

    fn read_reg(&self, offset: u16) -> u8 {
        let mut port: Port<u8> = Port::new(self.io_base + offset);
        // SAFETY: ATA task-file register read on a probed channel.
        unsafe { port.read() }
    }

    fn wait_not_busy(&self) -> Result<(), KernelError> {
        for _ in 0..POLL_LIMIT {
            if self.status() & STATUS_BSY == 0 {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        Err(KernelError::Timeout)
    }

    fn wait_data_request(&self) -> Result<(), KernelError> {
        for _ in 0..POLL_LIMIT {
            let status = self.status();
            if status & STATUS_ERR != 0 {
                return Err(KernelError::HardwareFault);
            }
            if status & STATUS_BSY == 0 && status & STATUS_DRQ != 0 {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        Err(KernelError::Timeout)
    }

    /// Select this drive with the low LBA28 nibble.
    fn select(&self, lba: u64) {
        let drive_bits = 0xE0 | ((self.slave as u8) << 4) | ((lba >> 24) & 0x0F) as u8;
        self.write_reg(REG_DRIVE, drive_bits);
    }

    fn setup_transfer(&self, lba: u64) -> Result<(), KernelError> {
        self.wait_not_busy()?;
        self.select(lba);
        self.write_reg(REG_SECTOR_COUNT, 1);
        self.write_reg(REG_LBA_LOW, lba as u8);
        self.write_reg(REG_LBA_MID, (lba >> 8) as u8);
        self.write_reg(REG_LBA_HIGH, (lba >> 16) as u8);
        Ok(())
    }

    /// Mask the channel's interrupt line; this driver only polls.
    fn mask_irq(&self) {
        let mut port: Port<u8> = Port::new(self.ctrl_base);
        // SAFETY: Setting nIEN in the device-control register.
        unsafe { port.write(0x02) }
    }

    /// IDENTIFY the drive. Returns the sector count, or None when absent.
    fn identify(&self) -> Option<u64> {
        self.mask_irq();
        if self.wait_not_busy().is_err() {
            return None;
        }

        self.write_reg(REG_DRIVE, 0xA0 | ((self.slave as u8) << 4));
        self.write_reg(REG_SECTOR_COUNT, 0);
        self.write_reg(REG_LBA_LOW, 0);
        self.write_reg(REG_LBA_MID, 0);
        self.write_reg(REG_LBA_HIGH, 0);
        self.write_reg(REG_COMMAND, CMD_IDENTIFY);

        // Status 0 means no drive on this position.
        if self.status() == 0 {
            return None;
        }

        if self.wait_not_busy().is_err() {
            return None;
        }

        // Non-zero LBA mid/high after IDENTIFY means not an ATA drive
        // (ATAPI or SATA signature).
        if self.read_reg(REG_LBA_MID) != 0 || self.read_reg(REG_LBA_HIGH) != 0 {
            return None;
        }

        if self.wait_data_request().is_err() {
            return None;
        }

        let mut identify = [0u16; 256];
        let mut data: Port<u16> = Port::new(self.io_base + REG_DATA);
        for word in identify.iter_mut() {
            // SAFETY: DRQ is set, the drive is presenting the 256-word
            // IDENTIFY block on the data register.
            *word = unsafe { data.read() };
        }

        // Words 60..61: total addressable LBA28 sectors.
        let sectors = identify[60] as u64 | ((identify[61] as u64) << 16);
        if sectors == 0 {
            return None;
        }
        Some(sectors)
    }
}

impl BlockDriver for AtaDrive {
    fn read_block(
        &self,
        _dev: &BlockDevice,
        lba: u64,
        buffer: &mut [u8],
    ) -> Result<(), KernelError> {
        self.setup_transfer(lba)?;
        self.write_reg(REG_COMMAND, CMD_READ_PIO);
        self.wait_data_request()?;

        let mut data: Port<u16> = Port::new(self.io_base + REG_DATA);
        for i in 0..SECTOR_SIZE / 2 {
            // SAFETY: DRQ is set; the drive streams one sector of data words.
            let word = unsafe { data.read() };
            buffer[i * 2] = word as u8;
            buffer[i * 2 + 1] = (word >> 8) as u8;
        }
        Ok(())
    }

    fn write_block(
        &self,
        _dev: &BlockDevice,
        lba: u64,
        buffer: &[u8],
    ) -> Result<(), KernelError> {
        self.setup_transfer(lba)?;
        self.write_reg(REG_COMMAND, CMD_WRITE_PIO);
        self.wait_data_request()?;

        let mut data: Port<u16> = Port::new(self.io_base + REG_DATA);
        for i in 0..SECTOR_SIZE / 2 {
            let word = buffer[i * 2] as u16 | ((buffer[i * 2 + 1] as u16) << 8);
            // SAFETY: DRQ is set; the drive accepts one sector of data words.
            unsafe { data.write(word) };
        }

        self.write_reg(REG_COMMAND, CMD_CACHE_FLUSH);
        self.wait_not_busy()
    }

    fn flush(&self, _dev: &BlockDevice) -> Result<(), KernelError> {
        self.write_reg(REG_COMMAND, CMD_CACHE_FLUSH);
        self.wait_not_busy()
    }
}

fn driver_init() -> Result<(), KernelError> {
    let channels = [(PRIMARY_IO, PRIMARY_CTRL), (SECONDARY_IO, SECONDARY_CTRL)];
    let mut found = 0u32;

    for (channel, (io_base, ctrl_base)) in channels.iter().enumerate() {
        for slave in [false, true] {
            let drive = AtaDrive {
                io_base: *io_base,
                ctrl_base: *ctrl_base,
                slave,
            };

            let Some(sectors) = drive.identify() else {
                continue;
            };

            let index = channel * 2 + slave as usize;
            let label = format!("ATA{}", index);
            serial_println!(
                "[ATA] {}: {} sectors ({} MB)",
                label,
                sectors,
                sectors * SECTOR_SIZE as u64 / (1024 * 1024)
            );

            let driver: &'static AtaDrive = Box::leak(Box::new(drive));
            block::register_device(BlockDevice {
                id: 0,
                device_type: BlockDeviceType::Ata,
                block_count: sectors,
                block_size: SECTOR_SIZE as u16,
                present: true,
                label,
                driver,
            })?;
            found += 1;
        }
    }

    if found == 0 {
        return Err(KernelError::NotFound);
    }
    Ok(())
}

/// Put the ATA driver on the registry (priority 40, after the block layer).
pub fn register_driver() -> Result<(), KernelError> {
    super::register(Driver {
        name: "ATA",
        kind: DriverKind::Block,
        version: 1,
        priority: 40,
        status: DriverStatus::Uninitialized,
        init: driver_init,
        cleanup: None,
        depends_on: Some("Block Layer"),
    })
}
