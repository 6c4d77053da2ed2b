use thiserror::Error;
use tracing::info;

use crate::{
    amd_pro::{AmdProError, AmdProUtility, ProAction},
    command::CommandRunner,
    config_manager::Config,
    gpu_device::{Device, GpuVendor, Inventory},
    inventory,
    module_facts::DriverFacts,
    module_manager::ModuleManager,
    power::PowerControl,
    prime::{self, PrimeError, PrimeMode, PrimeSwitch},
    xorg_conf::{Removal, XorgConfError, XorgFragments},
};

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error(transparent)]
    Prime(#[from] PrimeError),
    #[error(transparent)]
    AmdPro(#[from] AmdProError),
    #[error(transparent)]
    Fragment(#[from] XorgConfError),
}

// The branch picked for this boot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    // Intel only on the bus, the NVIDIA card was unloaded and disabled
    PrimeLaptop,
    // Switchable graphics turned off in the firmware
    AmdProDiscrete,
    NvidiaOnly,
    // Switchable graphics turned back on
    AmdProSwitchable,
    Optimus { discrete: Device },
    Nothing(&'static str),
}

// What executing a decision did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    PrimeEnabled(PrimeMode),
    ProUtility(ProAction),
    LayoutRemoved,
    NothingToDo,
}

// Pick the branch from the facts of this boot. No side effects
pub fn decide(
    inventory: &Inventory,
    has_changed: bool,
    facts: &DriverFacts,
    offloading: bool,
) -> Decision {
    let Some(boot_device) = inventory.boot_vga() else {
        return Decision::Nothing("No boot display controller detected");
    };

    let amd_pro_ready = has_changed
        && facts.amdgpu_loaded
        && facts.amdgpu_is_pro()
        && facts.amdgpu_pro_px_installed;

    if inventory.len() == 1 {
        info!("Single card detected");

        return match boot_device.vendor {
            GpuVendor::Intel if offloading && facts.nvidia_unloaded => {
                info!("PRIME detected");
                Decision::PrimeLaptop
            }
            GpuVendor::Amd if amd_pro_ready => {
                info!("AMDGPU-Pro discrete graphics detected");
                Decision::AmdProDiscrete
            }
            GpuVendor::Nvidia => Decision::NvidiaOnly,
            _ => Decision::Nothing("Single card with nothing to configure"),
        };
    }

    let Some(discrete) = inventory.first_discrete() else {
        return Decision::Nothing("No discrete card detected");
    };

    if boot_device.vendor != GpuVendor::Intel {
        info!("Unsupported discrete card vendor: {}", discrete.vendor);
        return Decision::Nothing("Unsupported vendor combination");
    }

    info!("Intel IGP detected");

    let nvidia_usable = facts.intel_loaded
        && !facts.nouveau_loaded
        && (facts.nvidia_loaded || facts.nvidia_kmod_available);

    if amd_pro_ready {
        info!("AMDGPU-Pro switchable graphics detected");
        Decision::AmdProSwitchable
    } else if offloading && nvidia_usable {
        info!("Intel hybrid system");
        Decision::Optimus {
            discrete: *discrete,
        }
    } else {
        Decision::Nothing("Desktop system or laptop with open drivers")
    }
}

// Carries out a decision
pub struct PolicyEngine<'a> {
    config: &'a Config,
    prime: PrimeSwitch<'a>,
    fragments: XorgFragments,
    amd_pro: AmdProUtility<'a>,
}

impl<'a> PolicyEngine<'a> {
    pub fn new(
        config: &'a Config,
        runner: &'a dyn CommandRunner,
        modules: &'a ModuleManager<'a>,
    ) -> Self {
        let prime = PrimeSwitch::new(
            &config.prime_settings,
            XorgFragments::new(&config.xorg_conf_d_path),
            PowerControl::new(&config.system.pci_devices),
            modules,
            runner,
        );

        Self {
            config,
            prime,
            fragments: XorgFragments::new(&config.xorg_conf_d_path),
            amd_pro: AmdProUtility::new(
                &config.amdgpu_pro_px_file,
                runner,
                config.dry_run,
            ),
        }
    }

    pub fn execute(
        &self,
        decision: &Decision,
        inventory: &Inventory,
    ) -> Result<Outcome, PolicyError> {
        match decision {
            Decision::PrimeLaptop => {
                // The disabled card only exists for this branch
                let mut cards = inventory.clone();
                inventory::add_disabled_cards(
                    &self.config.gpu_detection_path,
                    &mut cards,
                );

                match cards.first_discrete() {
                    Some(discrete) => self.enable_prime(discrete),
                    None => {
                        info!("No disabled discrete card found");
                        Ok(Outcome::NothingToDo)
                    }
                }
            }
            Decision::Optimus { discrete } => self.enable_prime(discrete),
            Decision::AmdProDiscrete => self.run_pro(ProAction::Reset),
            Decision::AmdProSwitchable => self.run_pro(ProAction::PowerSaving),
            Decision::NvidiaOnly => {
                match self.fragments.remove_offload_serverlayout()? {
                    Removal::Removed => Ok(Outcome::LayoutRemoved),
                    Removal::NotPresent => {
                        info!("Nothing to do");
                        Ok(Outcome::NothingToDo)
                    }
                }
            }
            Decision::Nothing(reason) => {
                info!("{reason}");
                info!("Nothing to do");
                Ok(Outcome::NothingToDo)
            }
        }
    }

    fn enable_prime(&self, discrete: &Device) -> Result<Outcome, PolicyError> {
        info!(
            "Enabling PRIME on {} {:04x} at {}",
            discrete.vendor, discrete.device_id, discrete.address
        );

        let mode = self.prime.enable(discrete)?;
        prime::set_offloading_marker(
            &self.config.offloading_file,
            self.config.dry_run,
        )?;

        Ok(Outcome::PrimeEnabled(mode))
    }

    fn run_pro(&self, action: ProAction) -> Result<Outcome, PolicyError> {
        self.amd_pro.run(action)?;

        Ok(Outcome::ProUtility(action))
    }
}
