use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use tracing::{debug, info, warn};

use crate::{
    gpu_device::{Connectivity, GpuVendor},
    sysfs::{self, PrefixedDir},
};

// Find out whether the card driven by a given kernel driver has
// any display output connected
pub struct OutputProber {
    // Directory holding the DRM device nodes (/dev/dri)
    dev_dri: PathBuf,
    // DRM class directory in sysfs (/sys/class/drm)
    drm_class: PathBuf,
}

impl OutputProber {
    pub fn new(dev_dri: &Path, drm_class: &Path) -> Self {
        Self {
            dev_dri: dev_dri.to_path_buf(),
            drm_class: drm_class.to_path_buf(),
        }
    }

    // Return the connectivity of the first card whose driver name
    // contains the given name. Unknown if no card is bound to it
    pub fn driver_connectivity(&self, driver: &str) -> Connectivity {
        let Some(card) = self.find_card(driver) else {
            return Connectivity::Unknown;
        };

        let connected = self.count_connected_outputs(&card);

        info!("Number of connected outputs for {card}: {connected}");

        Connectivity::from_count(connected)
    }

    // Look for the DRM card node created by the given driver.
    // Substring matching catches the backported variants of a module
    fn find_card(&self, driver: &str) -> Option<String> {
        let cards = match PrefixedDir::new(&self.dev_dri, "card").sorted() {
            Ok(cards) => cards,
            Err(err) => {
                warn!("Failed to open {:?}: {err}", self.dev_dri);
                return None;
            }
        };

        for entry in cards {
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = entry.path();

            // Only checks that the node is accessible, the identity
            // comes from sysfs. The handle is dropped right away
            let _node = match File::open(&path) {
                Ok(node) => node,
                Err(err) => {
                    warn!("Can't open {path:?}: {err}");
                    continue;
                }
            };

            let Some(identity) = self.driver_identity(&name) else {
                debug!("No driver identity for {path:?}");
                continue;
            };

            if identity.contains(driver) {
                info!("Found {path:?}, driven by \"{identity}\"");
                return Some(name);
            }

            debug!("Skipping {path:?}, driven by \"{identity}\"");
        }

        None
    }

    // Name of the kernel driver behind a card node
    fn driver_identity(&self, card: &str) -> Option<String> {
        sysfs::link_target_name(&self.drm_class.join(card).join("device/driver"))
    }

    // Count the connectors of a card that report "connected"
    fn count_connected_outputs(&self, card: &str) -> usize {
        let connectors = match PrefixedDir::new(&self.drm_class, card).iter() {
            Ok(connectors) => connectors,
            Err(err) => {
                warn!("Can't open {:?}: {err}", self.drm_class);
                return 0;
            }
        };

        connectors
            .filter(|connector| {
                let connected =
                    is_connector_connected(&connector.path().join("status"));

                if connected {
                    debug!("Connected output: {:?}", connector.file_name());
                }

                connected
            })
            .count()
    }
}

// A connector is connected when a line of its status file
// starts with "connected"
fn is_connector_connected(status: &Path) -> bool {
    let Ok(file) = File::open(status) else {
        return false;
    };

    BufReader::new(file)
        .lines()
        .map_while(Result::ok)
        .any(|line| line.trim_start().starts_with("connected"))
}

// Connectivity of each driver the inventory cares about,
// probed once per run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DriverOutputs {
    pub amdgpu: Connectivity,
    pub radeon: Connectivity,
    pub nouveau: Connectivity,
    pub i915: Connectivity,
}

impl DriverOutputs {
    pub fn probe(prober: &OutputProber) -> Self {
        Self {
            amdgpu: prober.driver_connectivity("amdgpu"),
            radeon: prober.driver_connectivity("radeon"),
            nouveau: prober.driver_connectivity("nouveau"),
            i915: prober.driver_connectivity("i915"),
        }
    }

    // Pick the connectivity that applies to a card of the given vendor
    pub fn for_vendor(&self, vendor: GpuVendor) -> Connectivity {
        match vendor {
            GpuVendor::Amd => match self.radeon {
                Connectivity::Unknown => self.amdgpu,
                known => known,
            },
            GpuVendor::Intel => self.i915,
            GpuVendor::Nvidia => self.nouveau,
            GpuVendor::Other(_) => Connectivity::Unknown,
        }
    }
}
