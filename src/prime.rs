use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
    command::CommandRunner,
    gpu_device::{Device, GpuVendor},
    module_manager::{ModuleError, ModuleManager},
    power::PowerControl,
    sysfs,
    xorg_conf::{self, XorgConfError, XorgFragments},
};

#[derive(Debug, Error)]
pub enum PrimeError {
    #[error("Failed to create the PRIME settings in {path:?}")]
    CreateSettings {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to read the PRIME settings in {path:?}")]
    ReadSettings {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Fragment(#[from] XorgConfError),
    #[error(transparent)]
    Module(#[from] ModuleError),
    #[error("Failed to write the offloading marker {path:?}")]
    Marker {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

// User preference stored in the PRIME settings file
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PrimeMode {
    #[default]
    On,
    OnDemand,
    Off,
}

impl PrimeMode {
    // Anything that is not "on" or "on-demand" means off
    pub fn from_setting(line: &str) -> Self {
        match line.trim().to_lowercase().as_str() {
            "on" => PrimeMode::On,
            "on-demand" => PrimeMode::OnDemand,
            _ => PrimeMode::Off,
        }
    }
}

impl fmt::Display for PrimeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let setting = match self {
            PrimeMode::On => "on",
            PrimeMode::OnDemand => "on-demand",
            PrimeMode::Off => "off",
        };

        write!(f, "{setting}")
    }
}

// Read the PRIME mode, creating the settings with "on" when the file
// is missing or empty
pub fn load_settings(path: &Path) -> Result<PrimeMode, PrimeError> {
    if !sysfs::exists_not_empty(path) {
        warn!("No settings for prime can be found in {path:?}");
        info!("Trying to create new settings for prime. Path: {path:?}");

        fs::write(path, format!("{}\n", PrimeMode::On)).map_err(|source| {
            PrimeError::CreateSettings {
                path: path.to_path_buf(),
                source,
            }
        })?;
    }

    let line = sysfs::read_first_line(path).map_err(|source| {
        PrimeError::ReadSettings {
            path: path.to_path_buf(),
            source,
        }
    })?;

    let mode = PrimeMode::from_setting(line.as_deref().unwrap_or_default());
    info!("PRIME mode: {mode}");

    Ok(mode)
}

// Record that render offload is configured
pub fn set_offloading_marker(path: &Path, dry_run: bool) -> Result<(), PrimeError> {
    if dry_run {
        info!("Dry run: not setting the offloading marker in {path:?}");
        return Ok(());
    }

    info!("Setting the offloading marker in {path:?}");

    fs::write(path, "ON\n").map_err(|source| PrimeError::Marker {
        path: path.to_path_buf(),
        source,
    })
}

// Drop the offloading marker if there is one
pub fn remove_offloading_marker(path: &Path, dry_run: bool) {
    if dry_run {
        info!("Dry run: not removing the offloading marker {path:?}");
        return;
    }

    match fs::remove_file(path) {
        Ok(()) => info!("Removed the offloading marker {path:?}"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!("Failed to remove {path:?}: {err}"),
    }
}

// Applies the PRIME mode to a discrete NVIDIA card
pub struct PrimeSwitch<'a> {
    settings: PathBuf,
    fragments: XorgFragments,
    power: PowerControl,
    modules: &'a ModuleManager<'a>,
    runner: &'a dyn CommandRunner,
}

impl<'a> PrimeSwitch<'a> {
    pub fn new(
        settings: &Path,
        fragments: XorgFragments,
        power: PowerControl,
        modules: &'a ModuleManager<'a>,
        runner: &'a dyn CommandRunner,
    ) -> Self {
        Self {
            settings: settings.to_path_buf(),
            fragments,
            power,
            modules,
            runner,
        }
    }

    pub fn enable(&self, discrete: &Device) -> Result<PrimeMode, PrimeError> {
        let mode = load_settings(&self.settings)?;

        match mode {
            PrimeMode::On => {
                let multiarch = xorg_conf::multiarch(self.runner);

                self.fragments.write_prime_outputclass(&multiarch)?;
                self.fragments.remove_offload_serverlayout()?;

                if let Err(err) = self.power.disable(discrete) {
                    error!("{err}: {}", err.source);
                }

                self.modules.ensure_loaded("nvidia")?;
            }
            PrimeMode::OnDemand => {
                self.fragments.write_offload_serverlayout()?;
                self.fragments.remove_prime_outputclass()?;

                if let Err(err) = self.power.enable(discrete) {
                    error!("{err}: {}", err.source);
                }

                self.modules.ensure_loaded("nvidia")?;
            }
            PrimeMode::Off => {
                self.fragments.remove_prime_outputclass()?;
                self.fragments.remove_offload_serverlayout()?;

                let reclaimed = match self.modules.reclaim(GpuVendor::Nvidia) {
                    // Nobody to kill means nothing is rendering on the
                    // card, the module stays loaded but idle
                    Err(ModuleError::NoSessionToKill { module }) => {
                        warn!("Leaving {module} loaded, no display session to kill");
                        Ok(())
                    }
                    other => other.map(|_| ()),
                };

                // The card is idle either way
                if let Err(err) = self.power.enable(discrete) {
                    error!("{err}: {}", err.source);
                }

                reclaimed?;
            }
        }

        Ok(mode)
    }
}
