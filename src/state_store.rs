use std::{
    fs::{self, File},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::gpu_device::{BusAddress, Device, GpuVendor, Inventory};

#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("Can't read {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Can't open {path:?} for writing")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// How the previous boot state was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Loaded,
    // The file did not exist and was seeded with the zero record
    CreatedFresh,
}

// Read an inventory from a state file. A missing file is created
// with a single all zero record, which never matches a real card
pub fn read(path: &Path) -> Result<(Inventory, ReadOutcome), StateStoreError> {
    let mut outcome = ReadOutcome::Loaded;

    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) => {
            info!("Couldn't open {path:?} for reading ({err})");
            info!("Creating {path:?} for the first time");

            let sentinel = Device::new(
                GpuVendor::Other(0),
                0,
                BusAddress::default(),
                false,
            );

            let mut file =
                File::create(path).map_err(|source| StateStoreError::Write {
                    path: path.to_path_buf(),
                    source,
                })?;
            writeln!(file, "{}", format_record(&sentinel)).map_err(
                |source| StateStoreError::Write {
                    path: path.to_path_buf(),
                    source,
                },
            )?;

            outcome = ReadOutcome::CreatedFresh;

            // Try again
            File::open(path).map_err(|source| StateStoreError::Read {
                path: path.to_path_buf(),
                source,
            })?
        }
    };

    let mut inventory = Inventory::new();

    for line in BufReader::new(file).lines() {
        let line = line.map_err(|source| StateStoreError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        if inventory.is_full() {
            break;
        }

        match parse_record(&line) {
            Some(device) => {
                inventory.push(device);
            }
            None if line.trim().is_empty() => {}
            None => debug!("Ignoring malformed record \"{line}\""),
        }
    }

    Ok((inventory, outcome))
}

// Replace the content of the state file with the given inventory
pub fn write(path: &Path, inventory: &Inventory) -> Result<(), StateStoreError> {
    let mut content = String::new();
    for device in inventory {
        content.push_str(&format_record(device));
        content.push('\n');
    }

    fs::write(path, content).map_err(|source| StateStoreError::Write {
        path: path.to_path_buf(),
        source,
    })
}

// True if the machine configuration differs between the two runs.
// The comparison is positional: both inventories must come from the
// same enumeration order for the result to be meaningful
pub fn has_changed(previous: &Inventory, current: &Inventory) -> bool {
    if previous.len() != current.len() {
        info!("The number of cards has changed!");
        return true;
    }

    previous
        .iter()
        .zip(current.iter())
        .any(|(prev, curr)| !prev.same_configuration(curr))
}

// Format a device as "VVVV:DDDD;DDDD:BB:SS:F;G"
pub fn format_record(device: &Device) -> String {
    let address = &device.address;

    format!(
        "{:04x}:{:04x};{:04x}:{:02x}:{:02x}:{};{}",
        device.vendor.id(),
        device.device_id,
        address.domain,
        address.bus,
        address.slot,
        address.function,
        u8::from(device.boot_vga)
    )
}

// Parse a record written by format_record. Connectivity is not
// part of the record and comes back as unknown
pub fn parse_record(line: &str) -> Option<Device> {
    let mut groups = line.trim_end().split(';');

    let ids = groups.next()?;
    let address = groups.next()?;
    let boot_vga = groups.next()?;

    if groups.next().is_some() {
        warn!("Trailing data in record \"{line}\"");
        return None;
    }

    let (vendor, device_id) = ids.split_once(':')?;
    let vendor = hex_field(vendor, 4)? as u16;
    let device_id = hex_field(device_id, 4)? as u16;

    let mut fields = address.split(':');
    let address = BusAddress {
        domain: hex_field(fields.next()?, 4)? as u16,
        bus: hex_field(fields.next()?, 2)? as u8,
        slot: hex_field(fields.next()?, 2)? as u8,
        function: fields.next()?.parse().ok()?,
    };

    if fields.next().is_some() {
        return None;
    }

    let boot_vga = boot_vga.trim().parse::<u8>().ok()? != 0;

    Some(Device::new(GpuVendor::from(vendor), device_id, address, boot_vga))
}

fn hex_field(field: &str, max_digits: usize) -> Option<u32> {
    if field.is_empty() || field.len() > max_digits {
        return None;
    }

    u32::from_str_radix(field, 16).ok()
}
