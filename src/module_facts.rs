use std::{
    fs::{self, File},
    io::{BufRead, BufReader},
    path::Path,
};

use tracing::{debug, error, info, warn};

use crate::{
    command::CommandRunner,
    config_manager::Config,
    sysfs::{self, PrefixedDir},
};

const BLACKLIST: &str = "blacklist";

// Boolean facts about kernel modules, one query per module name
pub trait ModuleQuery {
    // Is the module currently loaded
    fn is_loaded(&self, module: &str) -> bool;
    // Is the module blacklisted in the modprobe configuration
    fn is_blacklisted(&self, module: &str) -> bool;
    // Is a module built for the running kernel installed
    fn is_available(&self, module: &str) -> bool;
    // Does the module carry a version tag (vendor built modules do)
    fn is_versioned(&self, module: &str) -> bool;
    // Was the module loaded before and unloaded since
    fn was_unloaded(&self, module: &str) -> bool;
}

// Module facts read from the running system
pub struct SystemModules<'a> {
    config: &'a Config,
    runner: &'a dyn CommandRunner,
}

impl<'a> SystemModules<'a> {
    pub fn new(config: &'a Config, runner: &'a dyn CommandRunner) -> Self {
        Self { config, runner }
    }

    fn conf_files_blacklist(&self, dir: &Path, module: &str) -> bool {
        let pattern = dir.join("*.conf");
        let Some(pattern) = pattern.to_str() else {
            return false;
        };

        let files = match glob::glob(pattern) {
            Ok(files) => files,
            Err(err) => {
                warn!("Invalid pattern {pattern}: {err}");
                return false;
            }
        };

        files
            .flatten()
            .any(|path| file_blacklists(&path, module, true))
    }
}

impl ModuleQuery for SystemModules<'_> {
    fn is_loaded(&self, module: &str) -> bool {
        let path = &self.config.system.proc_modules;

        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) => {
                error!("Can't open {path:?}: {err}");
                return false;
            }
        };

        BufReader::new(file)
            .lines()
            .map_while(Result::ok)
            .any(|line| line.split_whitespace().next() == Some(module))
    }

    fn is_blacklisted(&self, module: &str) -> bool {
        // In a dry run the path is a single file written by the test
        if self.config.dry_run {
            let path = &self.config.modprobe_d_path;
            return sysfs::exists_not_empty(path)
                && file_blacklists(path, module, false);
        }

        self.conf_files_blacklist(&self.config.modprobe_d_path, module)
            || self.conf_files_blacklist(
                &self.config.system.lib_modprobe_d,
                module,
            )
    }

    fn is_available(&self, module: &str) -> bool {
        let release_path = &self.config.system.kernel_release;
        let release = match fs::read_to_string(release_path) {
            Ok(release) => release.trim().to_string(),
            Err(err) => {
                error!("Can't read the kernel release: {err}");
                return false;
            }
        };

        let dir = self
            .config
            .system
            .lib_modules
            .join(release)
            .join("updates/dkms");

        info!("Looking for {module} modules in {dir:?}");

        let found = match PrefixedDir::new(&dir, module).iter() {
            Ok(mut entries) => entries.next(),
            Err(err) => {
                debug!("Can't open {dir:?}: {err}");
                None
            }
        };

        match found {
            Some(entry) => {
                info!("Found {module} module: {:?}", entry.file_name());
                true
            }
            None => false,
        }
    }

    fn is_versioned(&self, module: &str) -> bool {
        if self.config.dry_run {
            return false;
        }

        match self
            .runner
            .first_line("/sbin/modinfo", &["-F", "version", module])
        {
            Ok(version) => version.is_some_and(|v| !v.trim().is_empty()),
            Err(err) => {
                warn!("Can't get the version of {module}: {err:#}");
                false
            }
        }
    }

    fn was_unloaded(&self, module: &str) -> bool {
        let marker = self
            .config
            .gpu_detection_path
            .join(format!("u-d-c-{module}-was-loaded"));

        if marker.exists() && !self.is_loaded(module) {
            info!("{module} was unloaded");
            return true;
        }

        false
    }
}

// True if a line of the file blacklists the module: "blacklist",
// anything, then the module name at the end of the line
fn file_blacklists(path: &Path, module: &str, anchored: bool) -> bool {
    let Ok(file) = File::open(path) else {
        return false;
    };

    BufReader::new(file)
        .lines()
        .map_while(Result::ok)
        .any(|line| blacklists(&line, module, anchored))
}

fn blacklists(line: &str, module: &str, anchored: bool) -> bool {
    let line = line.trim_end();

    let start = if anchored {
        line.starts_with(BLACKLIST).then_some(0)
    } else {
        line.find(BLACKLIST)
    };

    match start {
        Some(start) => line[start + BLACKLIST.len()..].ends_with(module),
        None => false,
    }
}

// Snapshot of every module fact the policy needs, gathered once
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DriverFacts {
    pub nvidia_loaded: bool,
    pub nvidia_unloaded: bool,
    pub nvidia_blacklisted: bool,
    pub nvidia_kmod_available: bool,
    pub intel_loaded: bool,
    pub radeon_loaded: bool,
    pub radeon_blacklisted: bool,
    pub amdgpu_loaded: bool,
    pub amdgpu_blacklisted: bool,
    pub amdgpu_versioned: bool,
    pub amdgpu_kmod_available: bool,
    pub amdgpu_pro_px_installed: bool,
    pub nouveau_loaded: bool,
    pub nouveau_blacklisted: bool,
}

impl DriverFacts {
    pub fn gather(modules: &dyn ModuleQuery, config: &Config) -> Self {
        let nvidia_loaded = modules.is_loaded("nvidia");

        let mut facts = Self {
            nvidia_loaded,
            nvidia_unloaded: !nvidia_loaded && modules.was_unloaded("nvidia"),
            nvidia_blacklisted: modules.is_blacklisted("nvidia"),
            nvidia_kmod_available: false,
            intel_loaded: modules.is_loaded("i915") || modules.is_loaded("i810"),
            radeon_loaded: modules.is_loaded("radeon"),
            radeon_blacklisted: modules.is_blacklisted("radeon"),
            amdgpu_loaded: modules.is_loaded("amdgpu"),
            amdgpu_blacklisted: modules.is_blacklisted("amdgpu"),
            amdgpu_versioned: modules.is_versioned("amdgpu"),
            amdgpu_kmod_available: false,
            amdgpu_pro_px_installed: sysfs::exists_not_empty(
                &config.amdgpu_pro_px_file,
            ),
            nouveau_loaded: modules.is_loaded("nouveau"),
            nouveau_blacklisted: modules.is_blacklisted("nouveau"),
        };

        match &config.fake {
            Some(fake) => {
                facts.nvidia_kmod_available = fake.module_available;
                facts.amdgpu_kmod_available = fake.module_available;
                facts.amdgpu_versioned = fake.module_versioned;
            }
            None => {
                facts.nvidia_kmod_available = modules.is_available("nvidia");
                facts.amdgpu_kmod_available = modules.is_available("amdgpu");
            }
        }

        facts.log();

        facts
    }

    // The proprietary AMD stack ships its own versioned amdgpu
    pub fn amdgpu_is_pro(&self) -> bool {
        self.amdgpu_kmod_available && self.amdgpu_versioned
    }

    fn log(&self) {
        let yes_no = |value: bool| if value { "yes" } else { "no" };

        info!("Is nvidia loaded? {}", yes_no(self.nvidia_loaded));
        info!("Was nvidia unloaded? {}", yes_no(self.nvidia_unloaded));
        info!("Is nvidia blacklisted? {}", yes_no(self.nvidia_blacklisted));
        info!("Is intel loaded? {}", yes_no(self.intel_loaded));
        info!("Is radeon loaded? {}", yes_no(self.radeon_loaded));
        info!("Is radeon blacklisted? {}", yes_no(self.radeon_blacklisted));
        info!("Is amdgpu loaded? {}", yes_no(self.amdgpu_loaded));
        info!("Is amdgpu blacklisted? {}", yes_no(self.amdgpu_blacklisted));
        info!("Is amdgpu versioned? {}", yes_no(self.amdgpu_versioned));
        info!("Is amdgpu pro stack? {}", yes_no(self.amdgpu_is_pro()));
        info!("Is nouveau loaded? {}", yes_no(self.nouveau_loaded));
        info!("Is nouveau blacklisted? {}", yes_no(self.nouveau_blacklisted));
        info!(
            "Is nvidia kernel module available? {}",
            yes_no(self.nvidia_kmod_available)
        );
        info!(
            "Is amdgpu kernel module available? {}",
            yes_no(self.amdgpu_kmod_available)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{command::ScriptedRunner, config_manager::FakeSystem};

    fn rooted() -> (tempfile::TempDir, Config) {
        let root = tempfile::tempdir().unwrap();
        let config = Config::under_root(root.path());

        fs::create_dir_all(config.system.proc_modules.parent().unwrap())
            .unwrap();
        fs::create_dir_all(&config.modprobe_d_path).unwrap();
        fs::create_dir_all(&config.gpu_detection_path).unwrap();

        (root, config)
    }

    #[test]
    fn matches_blacklist_lines() {
        assert!(blacklists("blacklist nouveau", "nouveau", true));
        assert!(blacklists("blacklist nouveau  \t", "nouveau", true));
        assert!(!blacklists("# blacklist nouveau", "nouveau", true));
        assert!(blacklists("# blacklist nouveau", "nouveau", false));
        assert!(!blacklists("blacklist nvidia-drm", "nvidia", true));
        assert!(!blacklists("options nvidia modeset=1", "nvidia", false));
    }

    #[test]
    fn reads_loaded_modules() {
        let (_root, config) = rooted();
        fs::write(
            &config.system.proc_modules,
            "nvidia_drm 57344 2 - Live 0x0\nnvidia 1234 1 nvidia_drm, Live 0x0\n",
        )
        .unwrap();

        let runner = ScriptedRunner::new();
        let modules = SystemModules::new(&config, &runner);

        assert!(modules.is_loaded("nvidia"));
        assert!(!modules.is_loaded("nouveau"));
    }

    #[test]
    fn scans_modprobe_conf_files() {
        let (_root, config) = rooted();
        fs::write(
            config.modprobe_d_path.join("blacklist-nouveau.conf"),
            "blacklist nouveau\noptions nouveau modeset=0\n",
        )
        .unwrap();
        fs::write(
            config.modprobe_d_path.join("notes.txt"),
            "blacklist radeon\n",
        )
        .unwrap();

        let runner = ScriptedRunner::new();
        let modules = SystemModules::new(&config, &runner);

        assert!(modules.is_blacklisted("nouveau"));
        assert!(!modules.is_blacklisted("radeon"));
    }

    #[test]
    fn finds_dkms_modules_for_the_running_kernel() {
        let (_root, config) = rooted();
        fs::create_dir_all(config.system.kernel_release.parent().unwrap())
            .unwrap();
        fs::write(&config.system.kernel_release, "6.8.0-31-generic\n").unwrap();

        let dkms = config.system.lib_modules.join("6.8.0-31-generic/updates/dkms");
        fs::create_dir_all(&dkms).unwrap();
        File::create(dkms.join("nvidia.ko.zst")).unwrap();

        let runner = ScriptedRunner::new();
        let modules = SystemModules::new(&config, &runner);

        assert!(modules.is_available("nvidia"));
        assert!(!modules.is_available("amdgpu"));
    }

    #[test]
    fn unloaded_needs_the_marker_and_an_absent_module() {
        let (_root, config) = rooted();
        fs::write(&config.system.proc_modules, "i915 1 0 - Live 0x0\n").unwrap();

        let runner = ScriptedRunner::new();
        let modules = SystemModules::new(&config, &runner);

        assert!(!modules.was_unloaded("nvidia"));

        File::create(config.gpu_detection_path.join("u-d-c-nvidia-was-loaded"))
            .unwrap();

        assert!(modules.was_unloaded("nvidia"));
    }

    #[test]
    fn versioned_asks_modinfo() {
        let (_root, config) = rooted();
        let runner = ScriptedRunner::new()
            .reply("/sbin/modinfo -F version amdgpu", "18.30.2");
        let modules = SystemModules::new(&config, &runner);

        assert!(modules.is_versioned("amdgpu"));
        assert!(!modules.is_versioned("radeon"));
    }

    #[test]
    fn fake_system_overrides_availability() {
        let (_root, mut config) = rooted();
        fs::write(&config.system.proc_modules, "amdgpu 1 0 - Live 0x0\n")
            .unwrap();
        config.fake = Some(FakeSystem {
            lspci_file: config.last_boot_file.clone(),
            module_available: true,
            module_versioned: true,
            requires_offloading: false,
        });

        let runner = ScriptedRunner::new();
        let modules = SystemModules::new(&config, &runner);
        let facts = DriverFacts::gather(&modules, &config);

        assert!(facts.amdgpu_loaded);
        assert!(facts.nvidia_kmod_available);
        assert!(facts.amdgpu_is_pro());
        assert!(!facts.amdgpu_pro_px_installed);
    }
}
