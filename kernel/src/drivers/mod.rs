//! Driver registry.
//!
//! Drivers declare a name, type, priority and at most one named dependency,
//! then register themselves. `init_all` makes repeated passes over the
//! registry, each pass walking priorities 0..=255 and initializing every
//! uninitialized driver whose dependency is satisfied; it stops when a full
//! sweep makes no progress. Priority gives coarse ordering, the named
//! dependency fine ordering.

pub mod ata;
pub mod block;
pub mod keyboard;
pub mod nvme;
pub mod pci;
pub mod pit;

use spin::Mutex;

use crate::console;
use crate::error::KernelError;

pub const MAX_DRIVERS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    Fundamental,
    Block,
    Char,
    Network,
    Input,
    Timer,
    Filesystem,
    Video,
}

impl DriverKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            DriverKind::Fundamental => "Fundamental",
            DriverKind::Block => "Block",
            DriverKind::Char => "Character",
            DriverKind::Network => "Network",
            DriverKind::Input => "Input",
            DriverKind::Timer => "Timer",
            DriverKind::Filesystem => "Filesystem",
            DriverKind::Video => "Video",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverStatus {
    Uninitialized,
    Initialized,
    Enabled,
    Disabled,
    Failed,
}

impl DriverStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            DriverStatus::Uninitialized => "Uninitialized",
            DriverStatus::Initialized => "Initialized",
            DriverStatus::Enabled => "Enabled",
            DriverStatus::Disabled => "Disabled",
            DriverStatus::Failed => "Failed",
        }
    }
}

#[derive(Clone, Copy)]
pub struct Driver {
    pub name: &'static str,
    pub kind: DriverKind,
    pub version: u32,
    /// Initialization priority, 0 = earliest.
    pub priority: u8,
    pub status: DriverStatus,
    pub init: fn() -> Result<(), KernelError>,
    pub cleanup: Option<fn()>,
    /// Name of a driver that must be initialized first.
    pub depends_on: Option<&'static str>,
}

struct Registry {
    drivers: [Option<Driver>; MAX_DRIVERS],
    count: usize,
}

static REGISTRY: Mutex<Registry> = Mutex::new(Registry {
    drivers: [None; MAX_DRIVERS],
    count: 0,
});

/// Register a driver. Names must be unique.
pub fn register(mut driver: Driver) -> Result<(), KernelError> {
    let mut registry = REGISTRY.lock();

    if registry.count >= MAX_DRIVERS {
        return Err(KernelError::OutOfMemory);
    }
    if registry
        .drivers
        .iter()
        .flatten()
        .any(|d| d.name == driver.name)
    {
        return Err(KernelError::AlreadyExists);
    }

    driver.status = DriverStatus::Uninitialized;
    let slot = registry.count;
    registry.drivers[slot] = Some(driver);
    registry.count += 1;
    Ok(())
}

/// Remove a driver by name, running its cleanup if it was initialized.
pub fn unregister(name: &str) -> Result<(), KernelError> {
    let mut registry = REGISTRY.lock();

    let Some(pos) = registry
        .drivers
        .iter()
        .position(|d| d.as_ref().is_some_and(|d| d.name == name))
    else {
        return Err(KernelError::NotFound);
    };

    if let Some(driver) = registry.drivers[pos] {
        if matches!(
            driver.status,
            DriverStatus::Initialized | DriverStatus::Enabled
        ) {
            if let Some(cleanup) = driver.cleanup {
                cleanup();
            }
        }
    }

    for i in pos..registry.count - 1 {
        registry.drivers[i] = registry.drivers[i + 1];
    }
    let last = registry.count - 1;
    registry.drivers[last] = None;
    registry.count -= 1;
    Ok(())
}

pub fn status_of(name: &str) -> Option<DriverStatus> {
    REGISTRY
        .lock()
        .drivers
        .iter()
        .flatten()
        .find(|d| d.name == name)
        .map(|d| d.status)
}

pub fn count() -> usize {
    REGISTRY.lock().count
}

fn dependency_met(registry: &Registry, driver: &Driver) -> bool {
    let Some(dep) = driver.depends_on else {
        return true;
    };
    registry
        .drivers
        .iter()
        .flatten()
        .find(|d| d.name == dep)
        .is_some_and(|d| {
            matches!(
                d.status,
                DriverStatus::Initialized | DriverStatus::Enabled
            )
        })
}

/// Initialize every registered driver, honoring priorities and dependencies.
pub fn init_all() {
    println!("\n=== Initializing Drivers ===");
    println!("Total drivers registered: {}\n", count());

    loop {
        let mut progress = false;

        for priority in 0..=255u8 {
            // Collect this priority's ready candidates without holding the
            // lock across init calls (an init may inspect the registry).
            let mut candidates = [None::<(usize, Driver)>; MAX_DRIVERS];
            {
                let registry = REGISTRY.lock();
                let mut n = 0;
                for (slot, entry) in registry.drivers.iter().enumerate() {
                    let Some(driver) = entry else { continue };
                    if driver.priority == priority
                        && driver.status == DriverStatus::Uninitialized
                        && dependency_met(&registry, driver)
                    {
                        candidates[n] = Some((slot, *driver));
                        n += 1;
                    }
                }
            }

            for (slot, driver) in candidates.iter().flatten() {
                print!("  [{}] {} ({})  ", driver.priority, driver.name, driver.kind.as_str());

                let result = (driver.init)();
                let status = match result {
                    Ok(()) => {
                        console::puts_color("[OK]\n", console::SUCCESS);
                        DriverStatus::Initialized
                    }
                    Err(err) => {
                        console::puts_color("[FAILED: ", console::FAILURE);
                        console::puts_color(err.as_str(), console::FAILURE);
                        console::puts_color("]\n", console::FAILURE);
                        DriverStatus::Failed
                    }
                };

                if let Some(entry) = REGISTRY.lock().drivers[*slot].as_mut() {
                    entry.status = status;
                }
                progress = true;
            }
        }

        if !progress {
            break;
        }
    }

    // Anything still uninitialized has an unsatisfiable dependency.
    let registry = REGISTRY.lock();
    for driver in registry.drivers.iter().flatten() {
        if driver.status == DriverStatus::Uninitialized {
            serial_println!(
                "[DRIVER] Warning: {} failed to initialize (dependency issue?)",
                driver.name
            );
        }
    }
    drop(registry);

    println!();
}

/// Print the driver table (`lsdrv`).
pub fn list() {
    println!("\n=== Registered Drivers ===");
    println!("{:<20}{:<16}{:<16}{}", "Name", "Type", "Status", "Priority");
    println!("------------------------------------------------------------");

    let mut entries = [None::<Driver>; MAX_DRIVERS];
    {
        let registry = REGISTRY.lock();
        for (i, driver) in registry.drivers.iter().enumerate() {
            entries[i] = *driver;
        }
    }

    for driver in entries.iter().flatten() {
        let status_color = match driver.status {
            DriverStatus::Initialized | DriverStatus::Enabled => console::SUCCESS,
            DriverStatus::Failed => console::FAILURE,
            DriverStatus::Disabled => console::WARNING,
            DriverStatus::Uninitialized => console::DEFAULT,
        };

        print!("{:<20}{:<16}", driver.name, driver.kind.as_str());
        console::puts_color(driver.status.as_str(), status_color);
        for _ in driver.status.as_str().len()..16 {
            console::putc(b' ');
        }
        println!("{}", driver.priority);
    }

    println!("\nTotal drivers: {}\n", count());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nop_init() -> Result<(), KernelError> {
        Ok(())
    }

    #[test_case]
    fn duplicate_names_are_rejected() {
        let driver = Driver {
            name: "test-dup",
            kind: DriverKind::Char,
            version: 1,
            priority: 200,
            status: DriverStatus::Uninitialized,
            init: nop_init,
            cleanup: None,
            depends_on: None,
        };

        register(driver).unwrap();
        assert_eq!(register(driver), Err(KernelError::AlreadyExists));
        unregister("test-dup").unwrap();
    }

    #[test_case]
    fn unregister_unknown_fails() {
        assert_eq!(unregister("no-such-driver"), Err(KernelError::NotFound));
    }

    #[test_case]
    fn registration_resets_status() {
        let mut driver = Driver {
            name: "test-status",
            kind: DriverKind::Char,
            version: 1,
            priority: 200,
            status: DriverStatus::Enabled,
            init: nop_init,
            cleanup: None,
            depends_on: None,
        };
        driver.status = DriverStatus::Enabled;

        register(driver).unwrap();
        assert_eq!(status_of("test-status"), Some(DriverStatus::Uninitialized));
        unregister("test-status").unwrap();
    }
}
