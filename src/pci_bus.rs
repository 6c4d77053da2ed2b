use std::{
    fs,
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::{debug, trace};

use crate::{
    gpu_device::BusAddress,
    sysfs::{self, PrefixedDir},
};

// PCI base class of display controllers
const PCI_CLASS_DISPLAY: u32 = 0x03;

// Drivers used to hand a device over to a virtual machine
const PASSTHROUGH_DRIVERS: [&str; 2] = ["pci-stub", "pciback"];

#[derive(Debug, Error)]
pub enum PciBusError {
    #[error("Failed to initialize PCI bus enumeration at {path:?}")]
    Init {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// A function on the PCI bus as reported by the enumeration layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PciFunction {
    pub vendor_id: u16,
    pub device_id: u16,
    // 24 bit class code: base class, sub class, programming interface
    pub class: u32,
    pub address: BusAddress,
    pub boot_vga: bool,
    // Name of the bound kernel driver, None if unbound
    pub driver: Option<String>,
}

impl PciFunction {
    pub fn is_display_controller(&self) -> bool {
        ((self.class >> 16) & 0xff) == PCI_CLASS_DISPLAY
    }

    // Devices reserved for passthrough must never be touched
    pub fn is_passthrough(&self) -> bool {
        self.driver
            .as_deref()
            .is_some_and(|driver| PASSTHROUGH_DRIVERS.contains(&driver))
    }
}

// Source of PCI bus enumeration results
pub trait PciBus {
    // Return every function on the bus in enumeration order
    fn functions(&self) -> Result<Vec<PciFunction>, PciBusError>;
}

// Enumerate the bus through /sys/bus/pci/devices
pub struct SysfsPciBus {
    devices_dir: PathBuf,
}

impl SysfsPciBus {
    pub fn new(devices_dir: &Path) -> Self {
        Self {
            devices_dir: devices_dir.to_path_buf(),
        }
    }

    // Read a single sysfs attribute formatted as "0x1234"
    fn read_hex(dir: &Path, attribute: &str) -> Option<u32> {
        let value = fs::read_to_string(dir.join(attribute)).ok()?;
        let value = value.trim();
        let value = value.strip_prefix("0x").unwrap_or(value);

        u32::from_str_radix(value, 16).ok()
    }

    fn read_function(dir: &Path, name: &str) -> Option<PciFunction> {
        let address = match name.parse::<BusAddress>() {
            Ok(address) => address,
            Err(err) => {
                debug!("Skipping {dir:?}: {err}");
                return None;
            }
        };

        // The boot_vga attribute only exists for VGA class devices
        let boot_vga = fs::read_to_string(dir.join("boot_vga"))
            .map(|v| v.trim() == "1")
            .unwrap_or(false);

        Some(PciFunction {
            vendor_id: Self::read_hex(dir, "vendor")? as u16,
            device_id: Self::read_hex(dir, "device")? as u16,
            class: Self::read_hex(dir, "class")?,
            address,
            boot_vga,
            driver: sysfs::link_target_name(&dir.join("driver")),
        })
    }
}

impl PciBus for SysfsPciBus {
    fn functions(&self) -> Result<Vec<PciFunction>, PciBusError> {
        let entries = PrefixedDir::new(&self.devices_dir, "")
            .sorted()
            .map_err(|source| PciBusError::Init {
                path: self.devices_dir.clone(),
                source,
            })?;

        let functions = entries
            .iter()
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                Self::read_function(&entry.path(), &name)
            })
            .collect::<Vec<_>>();

        trace!("Enumerated {} PCI functions", functions.len());

        Ok(functions)
    }
}

// Fixed set of functions, used when the bus layout is known upfront
#[derive(Debug, Default, Clone)]
pub struct StaticPciBus {
    pub functions: Vec<PciFunction>,
}

impl PciBus for StaticPciBus {
    fn functions(&self) -> Result<Vec<PciFunction>, PciBusError> {
        Ok(self.functions.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::symlink;

    use super::*;

    fn fake_function(root: &Path, name: &str, class: &str, driver: &str) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("vendor"), "0x10de\n").unwrap();
        fs::write(dir.join("device"), "0x1140\n").unwrap();
        fs::write(dir.join("class"), format!("{class}\n")).unwrap();
        symlink(format!("../../../bus/pci/drivers/{driver}"), dir.join("driver"))
            .unwrap();
    }

    #[test]
    fn reads_functions_from_sysfs() {
        let root = tempfile::tempdir().unwrap();
        fake_function(root.path(), "0000:01:00.0", "0x030000", "nvidia");
        fake_function(root.path(), "0000:01:00.1", "0x040300", "snd_hda_intel");
        fs::write(root.path().join("0000:01:00.0/boot_vga"), "1\n").unwrap();

        let functions = SysfsPciBus::new(root.path()).functions().unwrap();

        assert_eq!(functions.len(), 2);
        assert!(functions[0].is_display_controller());
        assert!(functions[0].boot_vga);
        assert_eq!(functions[0].driver.as_deref(), Some("nvidia"));
        assert_eq!(functions[0].vendor_id, 0x10de);
        assert!(!functions[1].is_display_controller());
    }

    #[test]
    fn detects_passthrough_drivers() {
        let root = tempfile::tempdir().unwrap();
        fake_function(root.path(), "0000:02:00.0", "0x030000", "pci-stub");

        let functions = SysfsPciBus::new(root.path()).functions().unwrap();

        assert!(functions[0].is_passthrough());
    }

    #[test]
    fn missing_bus_is_an_init_error() {
        let root = tempfile::tempdir().unwrap();
        let bus = SysfsPciBus::new(&root.path().join("missing"));

        assert!(matches!(bus.functions(), Err(PciBusError::Init { .. })));
    }
}
