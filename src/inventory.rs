use std::path::Path;

use tracing::{debug, info, warn};

use crate::{
    connectivity::DriverOutputs,
    gpu_device::{BusAddress, Device, GpuVendor, Inventory},
    pci_bus::{PciBus, PciBusError},
    sysfs::PrefixedDir,
};

// Prefix of the marker files left behind for disabled cards
const DISABLED_CARD_PREFIX: &str = "u-d-c-gpu-";

// Build the inventory of the display controllers on the bus
pub fn build_inventory(
    bus: &dyn PciBus,
    outputs: &DriverOutputs,
) -> Result<Inventory, PciBusError> {
    let mut inventory = Inventory::new();

    for function in bus.functions()? {
        if !function.is_display_controller() {
            continue;
        }

        info!("Device ID: {:#06x}", function.device_id);
        info!("  Vendor ID: {:#06x}", function.vendor_id);
        info!("  Bus ID: \"{}\"", function.address);
        info!("  Boot VGA: {}", if function.boot_vga { "yes" } else { "no" });

        if function.driver.is_none() {
            info!("The device is not bound to any driver");
        }

        if function.is_passthrough() {
            info!("The device is a pci passthrough. Skipping...");
            continue;
        }

        let vendor = GpuVendor::from(function.vendor_id);
        let mut device = Device::new(
            vendor,
            function.device_id,
            function.address,
            function.boot_vga,
        );
        device.connectivity = outputs.for_vendor(vendor);

        // Truncation is a degraded but successful outcome
        if !inventory.push(device) {
            break;
        }
    }

    info!("Cards detected: {}", inventory.len());
    for vendor in [GpuVendor::Amd, GpuVendor::Intel, GpuVendor::Nvidia] {
        let found = if inventory.has_vendor(vendor) { "yes" } else { "no" };
        info!("  {vendor}: {found}");
    }

    Ok(inventory)
}

// Merge the cards described by the marker files found in the
// given directory. These cards are invisible to bus enumeration
pub fn add_disabled_cards(dir: &Path, inventory: &mut Inventory) {
    info!("Looking for disabled cards in {dir:?}");

    let markers = match PrefixedDir::new(dir, DISABLED_CARD_PREFIX).sorted() {
        Ok(markers) => markers,
        Err(err) => {
            warn!("Can't open {dir:?}: {err}");
            return;
        }
    };

    for marker in markers {
        let name = marker.file_name().to_string_lossy().into_owned();

        debug!("Adding GPU from file: {name}");

        let Some(device) = parse_disabled_card(&name) else {
            warn!("No matches in disabled card marker \"{name}\"");
            continue;
        };

        info!(
            "Adding {:04x}:{:04x} in PCI:{} to the list",
            device.vendor.id(),
            device.device_id,
            device.address
        );

        if !inventory.push(device) {
            break;
        }

        info!(
            "Successfully detected disabled cards. Total number is {} now",
            inventory.len()
        );
    }
}

// Parse a marker name such as "u-d-c-gpu-0000:01:00.0-0x10de-0x1140"
pub fn parse_disabled_card(name: &str) -> Option<Device> {
    let rest = name.strip_prefix(DISABLED_CARD_PREFIX)?;

    let mut fields = rest.splitn(3, '-');
    let address: BusAddress = fields.next()?.parse().ok()?;
    let vendor = parse_prefixed_hex(fields.next()?)?;
    let device_id = parse_prefixed_hex(fields.next()?)?;

    // Disabled cards are never the boot display
    Some(Device::new(GpuVendor::from(vendor), device_id, address, false))
}

fn parse_prefixed_hex(field: &str) -> Option<u16> {
    let digits = field.strip_prefix("0x")?;

    if digits.is_empty() || digits.len() > 4 {
        return None;
    }

    u16::from_str_radix(digits, 16).ok()
}

#[cfg(test)]
mod tests {
    use std::fs::File;

    use super::*;
    use crate::{
        gpu_device::{Connectivity, MAX_NR_CARDS},
        pci_bus::{PciFunction, StaticPciBus},
    };

    fn display(vendor_id: u16, bus: u8, boot_vga: bool) -> PciFunction {
        PciFunction {
            vendor_id,
            device_id: 0x0001,
            class: 0x030000,
            address: BusAddress::new(0, bus, 0, 0),
            boot_vga,
            driver: Some("i915".to_string()),
        }
    }

    #[test]
    fn keeps_display_controllers_only() {
        let mut audio = display(0x10de, 1, false);
        audio.class = 0x040300;

        let mut stub = display(0x10de, 2, false);
        stub.driver = Some("pci-stub".to_string());

        let bus = StaticPciBus {
            functions: vec![display(0x8086, 0, true), audio, stub],
        };
        let outputs = DriverOutputs {
            i915: Connectivity::HasOutputs,
            ..Default::default()
        };

        let inventory = build_inventory(&bus, &outputs).unwrap();

        assert_eq!(inventory.len(), 1);
        let card = inventory.boot_vga().unwrap();
        assert_eq!(card.vendor, GpuVendor::Intel);
        assert_eq!(card.connectivity, Connectivity::HasOutputs);
    }

    #[test]
    fn truncates_at_the_cap() {
        let bus = StaticPciBus {
            functions: (0..15).map(|bus| display(0x1002, bus, false)).collect(),
        };

        let inventory = build_inventory(&bus, &DriverOutputs::default()).unwrap();

        assert_eq!(inventory.len(), MAX_NR_CARDS);
    }

    #[test]
    fn parses_disabled_card_markers() {
        let device = parse_disabled_card("u-d-c-gpu-0000:01:00.0-0x10de-0x1140")
            .unwrap();

        assert_eq!(device.vendor, GpuVendor::Nvidia);
        assert_eq!(device.device_id, 0x1140);
        assert_eq!(device.address, BusAddress::new(0, 1, 0, 0));
        assert!(!device.boot_vga);
        assert_eq!(device.connectivity, Connectivity::Unknown);

        assert!(parse_disabled_card("u-d-c-gpu-0000:01:00.0-10de-1140").is_none());
        assert!(parse_disabled_card("u-d-c-nvidia-was-loaded").is_none());
    }

    #[test]
    fn merges_disabled_cards_from_markers() {
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join("u-d-c-gpu-0000:01:00.0-0x10de-0x1140"))
            .unwrap();
        File::create(dir.path().join("u-d-c-nvidia-was-loaded")).unwrap();

        let mut inventory = Inventory::new();
        inventory.push(Device::new(
            GpuVendor::Intel,
            0x0166,
            BusAddress::default(),
            true,
        ));

        add_disabled_cards(dir.path(), &mut inventory);

        assert_eq!(inventory.len(), 2);
        assert_eq!(
            inventory.first_discrete().unwrap().vendor,
            GpuVendor::Nvidia
        );
    }
}
