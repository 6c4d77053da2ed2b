use std::{fmt, str::FromStr};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid PCI bus address: \"{0}\"")]
pub struct BusAddressError(pub String);

// PCI locant of a function: identifies the slot, not the silicon
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BusAddress {
    pub domain: u16,
    pub bus: u8,
    pub slot: u8,
    pub function: u8,
}

impl BusAddress {
    pub fn new(domain: u16, bus: u8, slot: u8, function: u8) -> Self {
        Self {
            domain,
            bus,
            slot,
            function,
        }
    }
}

// Formatted the way sysfs names PCI devices: "0000:01:00.0"
impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.slot, self.function
        )
    }
}

// Parse the sysfs form "DDDD:BB:SS.F"
impl FromStr for BusAddress {
    type Err = BusAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BusAddressError(s.to_string());

        let (rest, function) = s.rsplit_once('.').ok_or_else(invalid)?;
        let mut fields = rest.split(':');

        let domain = fields.next().ok_or_else(invalid)?;
        let bus = fields.next().ok_or_else(invalid)?;
        let slot = fields.next().ok_or_else(invalid)?;

        if fields.next().is_some() {
            return Err(invalid());
        }

        Ok(Self {
            domain: u16::from_str_radix(domain, 16).map_err(|_| invalid())?,
            bus: u8::from_str_radix(bus, 16).map_err(|_| invalid())?,
            slot: u8::from_str_radix(slot, 16).map_err(|_| invalid())?,
            function: u8::from_str_radix(function, 16)
                .map_err(|_| invalid())?,
        })
    }
}
