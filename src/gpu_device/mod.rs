use tracing::warn;

pub mod bus_address;
pub mod vendor;

pub use bus_address::BusAddress;
pub use vendor::GpuVendor;

// Hard cap on the number of cards handled in a single run
pub const MAX_NR_CARDS: usize = 10;

// Whether a card drives at least one connected display output.
// Unknown means the state could not be determined (e.g. no device
// node is bound to the expected driver) and is not the same as none
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    #[default]
    Unknown,
    HasOutputs,
    NoOutputs,
}

impl Connectivity {
    // Derive the state from the number of connected outputs
    pub fn from_count(connected_outputs: usize) -> Self {
        if connected_outputs > 0 {
            Connectivity::HasOutputs
        } else {
            Connectivity::NoOutputs
        }
    }
}

// One physical GPU function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Device {
    pub vendor: GpuVendor,
    pub device_id: u16,
    pub address: BusAddress,

    // True for the adapter the firmware used for the boot console
    pub boot_vga: bool,

    // Filled by the output prober, never persisted
    pub connectivity: Connectivity,
}

impl Device {
    pub fn new(
        vendor: GpuVendor,
        device_id: u16,
        address: BusAddress,
        boot_vga: bool,
    ) -> Self {
        Self {
            vendor,
            device_id,
            address,
            boot_vga,
            connectivity: Connectivity::Unknown,
        }
    }

    // Compare everything that makes up the machine configuration,
    // display cable state is deliberately left out
    pub fn same_configuration(&self, other: &Device) -> bool {
        self.boot_vga == other.boot_vga
            && self.vendor == other.vendor
            && self.device_id == other.device_id
            && self.address == other.address
    }
}

// Ordered, bounded list of the cards found during a run.
// The order is the enumeration order
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Inventory {
    devices: Vec<Device>,
}

impl Inventory {
    pub fn new() -> Self {
        Self {
            devices: Vec::with_capacity(MAX_NR_CARDS),
        }
    }

    // Append a device, returning false (and dropping it)
    // when the inventory is already full
    pub fn push(&mut self, device: Device) -> bool {
        if self.is_full() {
            warn!(
                "Too many devices, max supported {MAX_NR_CARDS}. \
                 Ignoring {:04x}:{:04x} at {}",
                device.vendor.id(),
                device.device_id,
                device.address
            );

            return false;
        }

        self.devices.push(device);

        true
    }

    pub fn is_full(&self) -> bool {
        self.devices.len() >= MAX_NR_CARDS
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Device> {
        self.devices.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Device> {
        self.devices.iter_mut()
    }

    // Return the card used by the firmware for the boot console
    pub fn boot_vga(&self) -> Option<&Device> {
        self.devices.iter().find(|d| d.boot_vga)
    }

    // Return the first card that is not the boot display,
    // this is "the discrete GPU" on hybrid systems
    pub fn first_discrete(&self) -> Option<&Device> {
        self.devices.iter().find(|d| !d.boot_vga)
    }

    pub fn has_vendor(&self, vendor: GpuVendor) -> bool {
        self.devices.iter().any(|d| d.vendor == vendor)
    }
}

impl<'a> IntoIterator for &'a Inventory {
    type Item = &'a Device;
    type IntoIter = std::slice::Iter<'a, Device>;

    fn into_iter(self) -> Self::IntoIter {
        self.devices.iter()
    }
}
