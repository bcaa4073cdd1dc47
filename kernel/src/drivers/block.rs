//! Block device layer.
//!
//! A thin dispatch layer: devices register into a fixed table and expose a
//! `BlockDriver` operations object. Reads and writes validate the LBA range
//! and buffer size, then delegate; multi-block operations fall back to a
//! single-block loop when a driver provides no bulk path.

use alloc::string::String;

use spin::Mutex;

use super::{Driver, DriverKind, DriverStatus};
use crate::error::KernelError;

/// Default logical block size.
pub const BLOCK_SIZE: usize = 512;

pub const MAX_BLOCK_DEVICES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockDeviceType {
    Ata,
    Ahci,
    Nvme,
    RamDisk,
}

impl BlockDeviceType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            BlockDeviceType::Ata => "ATA",
            BlockDeviceType::Ahci => "AHCI",
            BlockDeviceType::Nvme => "NVME",
            BlockDeviceType::RamDisk => "RAM Disk",
        }
    }
}

/// Per-device operations table.
pub trait BlockDriver: Send + Sync {
    fn read_block(&self, dev: &BlockDevice, lba: u64, buffer: &mut [u8])
        -> Result<(), KernelError>;

    fn write_block(&self, dev: &BlockDevice, lba: u64, buffer: &[u8])
        -> Result<(), KernelError>;

    /// Bulk read; the default loops over `read_block`.
    fn read_blocks(
        &self,
        dev: &BlockDevice,
        lba: u64,
        count: u32,
        buffer: &mut [u8],
    ) -> Result<(), KernelError> {
        let block_size = dev.block_size as usize;
        for i in 0..count as usize {
            self.read_block(
                dev,
                lba + i as u64,
                &mut buffer[i * block_size..(i + 1) * block_size],
            )?;
        }
        Ok(())
    }

    /// Bulk write; the default loops over `write_block`.
    fn write_blocks(
        &self,
        dev: &BlockDevice,
        lba: u64,
        count: u32,
        buffer: &[u8],
    ) -> Result<(), KernelError> {
        let block_size = dev.block_size as usize;
        for i in 0..count as usize {
            self.write_block(
                dev,
                lba + i as u64,
                &buffer[i * block_size..(i + 1) * block_size],
            )?;
        }
        Ok(())
    }

    fn flush(&self, _dev: &BlockDevice) -> Result<(), KernelError> {
        Ok(())
    }
}

pub struct BlockDevice {
    pub id: u8,
    pub device_type: BlockDeviceType,
    pub block_count: u64,
    pub block_size: u16,
    pub present: bool,
    pub label: String,
    pub driver: &'static dyn BlockDriver,
}

struct BlockRegistry {
    devices: [Option<BlockDevice>; MAX_BLOCK_DEVICES],
    count: u8,
}

static DEVICES: Mutex<BlockRegistry> = Mutex::new(BlockRegistry {
    devices: [const { None }; MAX_BLOCK_DEVICES],
    count: 0,
});

fn driver_init() -> Result<(), KernelError> {
    let mut registry = DEVICES.lock();
    registry.devices = [const { None }; MAX_BLOCK_DEVICES];
    registry.count = 0;
    Ok(())
}

/// Put the block layer on the driver registry (priority 30; disk drivers
/// depend on it by name).
pub fn register_driver() -> Result<(), KernelError> {
    super::register(Driver {
        name: "Block Layer",
        kind: DriverKind::Block,
        version: 1,
        priority: 30,
        status: DriverStatus::Uninitialized,
        init: driver_init,
        cleanup: None,
        depends_on: None,
    })
}

/// Register a device; its id is assigned here. Returns the id.
pub fn register_device(mut device: BlockDevice) -> Result<u8, KernelError> {
    let mut registry = DEVICES.lock();
    if registry.count as usize >= MAX_BLOCK_DEVICES {
        return Err(KernelError::OutOfMemory);
    }

    let id = registry.count;
    device.id = id;
    registry.devices[id as usize] = Some(device);
    registry.count += 1;
    Ok(id)
}

pub fn device_count() -> u8 {
    DEVICES.lock().count
}

/// Run `f` against a registered device.
pub fn with_device<R>(id: u8, f: impl FnOnce(&BlockDevice) -> R) -> Result<R, KernelError> {
    let registry = DEVICES.lock();
    let device = registry.devices[..registry.count as usize]
        .iter()
        .flatten()
        .find(|d| d.id == id)
        .ok_or(KernelError::NotFound)?;
    Ok(f(device))
}

fn checked_op<R>(
    id: u8,
    lba: u64,
    count: u32,
    buffer_len: usize,
    f: impl FnOnce(&BlockDevice) -> Result<R, KernelError>,
) -> Result<R, KernelError> {
    let registry = DEVICES.lock();
    let device = registry.devices[..registry.count as usize]
        .iter()
        .flatten()
        .find(|d| d.id == id)
        .ok_or(KernelError::NotFound)?;

    if !device.present {
        return Err(KernelError::InvalidArgument);
    }
    if lba + count as u64 > device.block_count {
        return Err(KernelError::InvalidArgument);
    }
    if buffer_len < device.block_size as usize * count as usize {
        return Err(KernelError::InvalidArgument);
    }

    f(device)
}

/// Read one block from a device into `buffer`.
pub fn read(id: u8, lba: u64, buffer: &mut [u8]) -> Result<(), KernelError> {
    checked_op(id, lba, 1, buffer.len(), |dev| dev.driver.read_block(dev, lba, buffer))
}

/// Write one block from `buffer` to a device.
pub fn write(id: u8, lba: u64, buffer: &[u8]) -> Result<(), KernelError> {
    checked_op(id, lba, 1, buffer.len(), |dev| dev.driver.write_block(dev, lba, buffer))
}

/// Read `count` consecutive blocks.
pub fn read_multi(id: u8, lba: u64, count: u32, buffer: &mut [u8]) -> Result<(), KernelError> {
    checked_op(id, lba, count, buffer.len(), |dev| {
        dev.driver.read_blocks(dev, lba, count, buffer)
    })
}

/// Write `count` consecutive blocks.
pub fn write_multi(id: u8, lba: u64, count: u32, buffer: &[u8]) -> Result<(), KernelError> {
    checked_op(id, lba, count, buffer.len(), |dev| {
        dev.driver.write_blocks(dev, lba, count, buffer)
    })
}

/// Flush a device's write cache.
pub fn flush(id: u8) -> Result<(), KernelError> {
    let registry = DEVICES.lock();
    let device = registry.devices[..registry.count as usize]
        .iter()
        .flatten()
        .find(|d| d.id == id)
        .ok_or(KernelError::NotFound)?;
    device.driver.flush(device)
}

/// Print the device table (`lsblk`).
pub fn list() {
    let registry = DEVICES.lock();

    println!("\n=== Block Devices ===");
    if registry.count == 0 {
        println!("No block devices found\n");
        return;
    }

    for device in registry.devices[..registry.count as usize].iter().flatten() {
        if !device.present {
            continue;
        }
        let size_mb = device.block_count * device.block_size as u64 / (1024 * 1024);
        println!(
            "Device {}: {} ({}) - {} MB",
            device.id,
            device.label,
            device.device_type.as_str(),
            size_mb
        );
    }
    println!();
}

#[cfg(test)]
mod tests {
    use alloc::string::ToString;

    use super::*;

    /// Loopback driver: "reads" produce the LBA in every byte.
    struct PatternDriver;

    impl BlockDriver for PatternDriver {
        fn read_block(
            &self,
            _dev: &BlockDevice,
            lba: u64,
            buffer: &mut [u8],
        ) -> Result<(), KernelError> {
            buffer.fill(lba as u8);
            Ok(())
        }

        fn write_block(
            &self,
            _dev: &BlockDevice,
            _lba: u64,
            _buffer: &[u8],
        ) -> Result<(), KernelError> {
            Ok(())
        }
    }

    static PATTERN_DRIVER: PatternDriver = PatternDriver;

    #[test_case]
    fn dispatch_and_bounds() {
        let id = register_device(BlockDevice {
            id: 0,
            device_type: BlockDeviceType::RamDisk,
            block_count: 16,
            block_size: BLOCK_SIZE as u16,
            present: true,
            label: "TEST0".to_string(),
            driver: &PATTERN_DRIVER,
        })
        .unwrap();

        let mut buffer = [0u8; BLOCK_SIZE];
        read(id, 5, &mut buffer).unwrap();
        assert!(buffer.iter().all(|&b| b == 5));

        // Past-the-end LBA is rejected before the driver sees it.
        assert_eq!(read(id, 16, &mut buffer), Err(KernelError::InvalidArgument));

        // Short buffers are rejected.
        let mut small = [0u8; 8];
        assert_eq!(read(id, 0, &mut small), Err(KernelError::InvalidArgument));
    }

    #[test_case]
    fn multi_block_falls_back_to_loop() {
        let id = register_device(BlockDevice {
            id: 0,
            device_type: BlockDeviceType::RamDisk,
            block_count: 16,
            block_size: BLOCK_SIZE as u16,
            present: true,
            label: "TEST1".to_string(),
            driver: &PATTERN_DRIVER,
        })
        .unwrap();

        let mut buffer = [0u8; BLOCK_SIZE * 3];
        read_multi(id, 2, 3, &mut buffer).unwrap();
        assert_eq!(buffer[0], 2);
        assert_eq!(buffer[BLOCK_SIZE], 3);
        assert_eq!(buffer[2 * BLOCK_SIZE], 4);
    }

    #[test_case]
    fn unknown_device_is_not_found() {
        let mut buffer = [0u8; BLOCK_SIZE];
        assert_eq!(read(200, 0, &mut buffer), Err(KernelError::NotFound));
    }
}
