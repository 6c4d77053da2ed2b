use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
    command::CommandRunner,
    config_manager::Config,
    gpu_device::GpuVendor,
    module_facts::ModuleQuery,
};

pub mod session;

use session::DisplaySession;

const MODPROBE: &str = "/sbin/modprobe";
const RMMOD: &str = "/sbin/rmmod";

// Unload attempts before giving up: one plain try, and one more
// after the display session has been killed
const MAX_UNLOAD_ATTEMPTS: u8 = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModuleError {
    #[error("No kernel module is managed for vendor {0}")]
    UnsupportedVendor(GpuVendor),
    #[error("Giving up on unloading {module} after {attempts} attempts")]
    Busy { module: String, attempts: u8 },
    #[error("Failed to unload {module} and no display session could be killed")]
    NoSessionToKill { module: String },
    #[error("Failed to load {module}")]
    Load { module: String },
}

// Progress of the reclaim protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReclaimState {
    Unloaded,
    Loaded { attempt: u8 },
}

// Load and unload kernel modules
pub struct ModuleManager<'a> {
    runner: &'a dyn CommandRunner,
    modules: &'a dyn ModuleQuery,
    session: DisplaySession<'a>,
    dry_run: bool,
}

impl<'a> ModuleManager<'a> {
    pub fn new(
        config: &Config,
        runner: &'a dyn CommandRunner,
        modules: &'a dyn ModuleQuery,
    ) -> Self {
        Self {
            runner,
            modules,
            session: DisplaySession::new(config, runner),
            dry_run: config.dry_run,
        }
    }

    pub fn is_loaded(&self, module: &str) -> bool {
        self.modules.is_loaded(module)
    }

    // Load a module with optional parameters
    pub fn load(&self, module: &str, params: Option<&str>) -> bool {
        info!(
            "Loading {module} with \"{}\" parameters",
            params.unwrap_or("no")
        );

        let mut args = vec![module];
        if let Some(params) = params {
            args.extend(params.split_whitespace());
        }

        self.act(MODPROBE, &args)
    }

    pub fn unload(&self, module: &str) -> bool {
        info!("Unloading {module} with \"no\" parameters");

        self.act(RMMOD, &[module])
    }

    // Load the module unless it is already there
    pub fn ensure_loaded(&self, module: &str) -> Result<(), ModuleError> {
        if self.is_loaded(module) || self.load(module, None) {
            return Ok(());
        }

        Err(ModuleError::Load {
            module: module.to_string(),
        })
    }

    // Unload the companion modules, then the vendor base module.
    // Only the base module result counts
    pub fn unload_vendor_stack(
        &self,
        vendor: GpuVendor,
    ) -> Result<bool, ModuleError> {
        let base = vendor
            .base_module()
            .ok_or(ModuleError::UnsupportedVendor(vendor))?;

        for companion in vendor.companion_modules() {
            self.unload(companion);
        }

        Ok(self.unload(base))
    }

    // Unload the vendor driver, killing the display session once if
    // the driver is busy. Returns the number of unload attempts made
    pub fn reclaim(&self, vendor: GpuVendor) -> Result<u8, ModuleError> {
        let base = vendor
            .base_module()
            .ok_or(ModuleError::UnsupportedVendor(vendor))?;

        let mut attempts = 0;
        let mut state = if self.is_loaded(base) {
            ReclaimState::Loaded { attempt: 0 }
        } else {
            ReclaimState::Unloaded
        };

        loop {
            match state {
                ReclaimState::Unloaded => return Ok(attempts),
                ReclaimState::Loaded { attempt } => {
                    attempts += 1;

                    // A failed rmmod is fine if the module went away
                    if self.unload_vendor_stack(vendor)? || !self.is_loaded(base)
                    {
                        state = ReclaimState::Unloaded;
                        continue;
                    }

                    warn!("Failure to unload the {base} modules");

                    if attempt + 1 >= MAX_UNLOAD_ATTEMPTS {
                        error!("Giving up on unloading {base}");

                        return Err(ModuleError::Busy {
                            module: base.to_string(),
                            attempts,
                        });
                    }

                    info!("Killing the display session...");

                    if !self.session.kill_main_session() {
                        return Err(ModuleError::NoSessionToKill {
                            module: base.to_string(),
                        });
                    }

                    state = ReclaimState::Loaded {
                        attempt: attempt + 1,
                    };
                }
            }
        }
    }

    fn act(&self, program: &str, args: &[&str]) -> bool {
        if self.dry_run {
            return true;
        }

        match self.runner.status(program, args) {
            Ok(success) => success,
            Err(err) => {
                error!("{err:#}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::{command::ScriptedRunner, module_facts::SystemModules};

    struct Fixture {
        _root: tempfile::TempDir,
        config: Config,
    }

    impl Fixture {
        // A system with nvidia loaded and a gdm Xorg session on PID 700
        fn new(dry_run: bool) -> Self {
            let root = tempfile::tempdir().unwrap();
            let mut config = Config::under_root(root.path());
            config.dry_run = dry_run;

            let proc_dir = &config.system.proc_dir;
            fs::create_dir_all(proc_dir.join("700")).unwrap();
            fs::write(proc_dir.join("700/status"), "Uid:\t120\t120\t120\t120\n")
                .unwrap();
            fs::write(&config.system.proc_modules, "nvidia 1 3 - Live 0x0\n")
                .unwrap();

            fs::create_dir_all(config.system.passwd.parent().unwrap()).unwrap();
            fs::write(&config.system.passwd, "gdm:x:120:125::/var/lib/gdm3:\n")
                .unwrap();

            Self {
                _root: root,
                config,
            }
        }
    }

    #[test]
    fn dry_run_never_calls_out() {
        let fixture = Fixture::new(true);
        let runner = ScriptedRunner::new();
        let modules = SystemModules::new(&fixture.config, &runner);
        let manager = ModuleManager::new(&fixture.config, &runner, &modules);

        assert!(manager.load("nvidia", Some("NVreg_DynamicPowerManagement=2")));
        assert_eq!(manager.reclaim(GpuVendor::Nvidia), Ok(1));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn unloads_companions_before_the_base_module() {
        let fixture = Fixture::new(false);
        let runner = ScriptedRunner::new().fail("/sbin/rmmod nvidia-uvm");
        let modules = SystemModules::new(&fixture.config, &runner);
        let manager = ModuleManager::new(&fixture.config, &runner, &modules);

        assert_eq!(manager.unload_vendor_stack(GpuVendor::Nvidia), Ok(true));
        assert_eq!(
            runner.calls(),
            vec![
                "/sbin/rmmod nvidia-drm",
                "/sbin/rmmod nvidia-uvm",
                "/sbin/rmmod nvidia-modeset",
                "/sbin/rmmod nvidia",
            ]
        );
    }

    #[test]
    fn reclaim_stops_after_two_attempts() {
        let fixture = Fixture::new(false);
        let runner = ScriptedRunner::new()
            .fail("/sbin/rmmod nvidia")
            .reply("/bin/pidof Xwayland", "700");
        let modules = SystemModules::new(&fixture.config, &runner);
        let manager = ModuleManager::new(&fixture.config, &runner, &modules);

        assert_eq!(
            manager.reclaim(GpuVendor::Nvidia),
            Err(ModuleError::Busy {
                module: "nvidia".to_string(),
                attempts: 2,
            })
        );
        assert_eq!(runner.count("/sbin/rmmod nvidia"), 2);
        assert_eq!(runner.count("/bin/kill -KILL 700"), 1);
    }

    #[test]
    fn reclaim_gives_up_when_no_session_can_be_killed() {
        let fixture = Fixture::new(false);
        let runner = ScriptedRunner::new().fail("/sbin/rmmod nvidia");
        let modules = SystemModules::new(&fixture.config, &runner);
        let manager = ModuleManager::new(&fixture.config, &runner, &modules);

        assert!(matches!(
            manager.reclaim(GpuVendor::Nvidia),
            Err(ModuleError::NoSessionToKill { .. })
        ));
        assert_eq!(runner.count("/sbin/rmmod nvidia"), 1);
        assert!(runner.calls().iter().all(|call| !call.starts_with("/bin/kill")));
    }

    #[test]
    fn reclaim_is_a_noop_when_unloaded() {
        let fixture = Fixture::new(false);
        fs::write(&fixture.config.system.proc_modules, "i915 1 0 - Live 0x0\n")
            .unwrap();

        let runner = ScriptedRunner::new();
        let modules = SystemModules::new(&fixture.config, &runner);
        let manager = ModuleManager::new(&fixture.config, &runner, &modules);

        assert_eq!(manager.reclaim(GpuVendor::Nvidia), Ok(0));
        assert!(runner.calls().is_empty());
        assert_eq!(
            manager.reclaim(GpuVendor::Other(0x1af4)),
            Err(ModuleError::UnsupportedVendor(GpuVendor::Other(0x1af4)))
        );
    }
}
