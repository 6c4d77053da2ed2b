use std::{
    fs,
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::info;

use crate::gpu_device::Device;

#[derive(Debug, Error)]
#[error("Failed to set the power control of {path:?}")]
pub struct PowerError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

// Runtime power management of a PCI function
pub struct PowerControl {
    pci_devices: PathBuf,
}

impl PowerControl {
    pub fn new(pci_devices: &Path) -> Self {
        Self {
            pci_devices: pci_devices.to_path_buf(),
        }
    }

    // Let the kernel suspend the device when idle
    pub fn enable(&self, device: &Device) -> Result<(), PowerError> {
        self.set(device, true)
    }

    // Keep the device powered on
    pub fn disable(&self, device: &Device) -> Result<(), PowerError> {
        self.set(device, false)
    }

    fn set(&self, device: &Device, enabled: bool) -> Result<(), PowerError> {
        let path = self
            .pci_devices
            .join(device.address.to_string())
            .join("power/control");
        let value = if enabled { "auto" } else { "on" };

        info!("Setting power control to \"{value}\" in {path:?}");

        fs::write(&path, format!("{value}\n"))
            .map_err(|source| PowerError { path, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu_device::{BusAddress, GpuVendor};

    #[test]
    fn writes_the_control_file() {
        let root = tempfile::tempdir().unwrap();
        let device = Device::new(
            GpuVendor::Nvidia,
            0x1140,
            BusAddress::new(0, 1, 0, 0),
            false,
        );
        let control = root.path().join("0000:01:00.0/power/control");
        fs::create_dir_all(control.parent().unwrap()).unwrap();

        let power = PowerControl::new(root.path());

        power.disable(&device).unwrap();
        assert_eq!(fs::read_to_string(&control).unwrap(), "on\n");

        power.enable(&device).unwrap();
        assert_eq!(fs::read_to_string(&control).unwrap(), "auto\n");
    }

    #[test]
    fn missing_device_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        let device =
            Device::new(GpuVendor::Nvidia, 0, BusAddress::new(0, 9, 0, 0), false);

        assert!(PowerControl::new(root.path()).enable(&device).is_err());
    }
}
