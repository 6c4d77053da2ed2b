use tracing::{debug, error, info};

use crate::{
    command::CommandRunner,
    config_manager::Config,
    connectivity::{DriverOutputs, OutputProber},
    errors::GpuManagerError,
    gpu_device::{Connectivity, GpuVendor, Inventory},
    inventory,
    module_facts::{DriverFacts, SystemModules},
    module_manager::ModuleManager,
    pci_bus::PciBus,
    policy::{self, Decision, Outcome, PolicyEngine},
    prime,
    state_store::{self, ReadOutcome},
    sysfs,
};

const DISABLE_PARAMETER: &str = "nogpumanager";

// Kernel parameters selecting the Intel X driver options
const INTEL_BOOT_PARAMETERS: [&str; 3] =
    ["gpumanager_modesetting", "gpumanager_uxa", "gpumanager_sna"];

// Summary of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub previous_state: ReadOutcome,
    pub has_changed: bool,
    pub offloading: bool,
    pub decision: Decision,
    // None when the chosen branch failed
    pub outcome: Option<Outcome>,
    pub state_written: bool,
}

// One detection and configuration pass
pub struct GpuManager<'a> {
    config: &'a Config,
    runner: &'a dyn CommandRunner,
    bus: &'a dyn PciBus,
}

impl<'a> GpuManager<'a> {
    pub fn new(
        config: &'a Config,
        runner: &'a dyn CommandRunner,
        bus: &'a dyn PciBus,
    ) -> Self {
        Self {
            config,
            runner,
            bus,
        }
    }

    pub fn run(&self) -> Result<RunReport, GpuManagerError> {
        let cmdline = &self.config.system.kernel_cmdline;

        if sysfs::file_contains_ignore_case(cmdline, DISABLE_PARAMETER) {
            info!("Disabled by kernel parameter \"{DISABLE_PARAMETER}\"");
            return Err(GpuManagerError::DisabledByKernelParameter);
        }

        for parameter in INTEL_BOOT_PARAMETERS {
            let found = sysfs::file_contains_ignore_case(cmdline, parameter);
            info!("Is {parameter} set? {}", if found { "yes" } else { "no" });
        }

        let modules = SystemModules::new(self.config, self.runner);
        let facts = DriverFacts::gather(&modules, self.config);

        let (current, offloading) = self.current_inventory()?;
        info!("Requires offloading? {}", if offloading { "yes" } else { "no" });

        if !offloading {
            prime::remove_offloading_marker(
                &self.config.offloading_file,
                self.config.dry_run,
            );
        }

        let (previous, previous_state) =
            state_store::read(&self.config.last_boot_file)?;
        info!("Last cards number = {}", previous.len());

        let has_changed = state_store::has_changed(&previous, &current);
        info!("Has the system changed? {}", if has_changed { "Yes" } else { "No" });

        let decision = policy::decide(&current, has_changed, &facts, offloading);
        debug!("Decision: {decision:?}");

        let manager = ModuleManager::new(self.config, self.runner, &modules);
        let engine = PolicyEngine::new(self.config, self.runner, &manager);

        let outcome = match engine.execute(&decision, &current) {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                log_chain(&err);
                None
            }
        };

        // Disabled cards never make it into the saved state
        let state_written =
            match state_store::write(&self.config.new_boot_file, &current) {
                Ok(()) => true,
                Err(err) => {
                    log_chain(&err);
                    false
                }
            };

        Ok(RunReport {
            previous_state,
            has_changed,
            offloading,
            decision,
            outcome,
            state_written,
        })
    }

    // Cards of this boot and whether render offload is needed
    fn current_inventory(&self) -> Result<(Inventory, bool), GpuManagerError> {
        if let Some(fake) = &self.config.fake {
            info!("Reading the cards from {:?}", fake.lspci_file);

            let (inventory, _) = state_store::read(&fake.lspci_file)?;

            return Ok((inventory, fake.requires_offloading));
        }

        let prober = OutputProber::new(
            &self.config.system.dev_dri,
            &self.config.system.drm_class,
        );
        let outputs = DriverOutputs::probe(&prober);
        let inventory = inventory::build_inventory(self.bus, &outputs)?;

        let offloading = inventory.boot_vga().is_some_and(|device| {
            device.vendor == GpuVendor::Intel
                && device.connectivity == Connectivity::HasOutputs
        });

        Ok((inventory, offloading))
    }
}

pub fn log_chain(err: &(dyn std::error::Error + 'static)) {
    error!("{err}");

    let mut source = err.source();
    while let Some(cause) = source {
        error!("  Caused by: {cause}");
        source = cause.source();
    }
}
