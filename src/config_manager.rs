use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::arg_parser::ArgsOptions;

const LAST_BOOT: &str = "/var/lib/ubuntu-drivers-common/last_gfx_boot";
const OFFLOADING_CONF: &str =
    "/var/lib/ubuntu-drivers-common/requires_offloading";
const PRIME_SETTINGS: &str = "/etc/prime-discrete";
const GPU_DETECTION_PATH: &str = "/run";
const MODPROBE_D_PATH: &str = "/etc/modprobe.d";
const XORG_CONF_D_PATH: &str = "/usr/share/X11/xorg.conf.d";
const AMDGPU_PRO_PX: &str = "/opt/amdgpu-pro/bin/amdgpu-pro-px";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to open the configuration file {path:?}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse the configuration file {path:?}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

// Locations of the kernel and system interfaces that are read.
// Only relocated when running against a fake system root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemPaths {
    pub kernel_cmdline: PathBuf,
    pub proc_modules: PathBuf,
    pub proc_dir: PathBuf,
    pub passwd: PathBuf,
    pub lib_modules: PathBuf,
    pub lib_modprobe_d: PathBuf,
    pub kernel_release: PathBuf,
    pub pci_devices: PathBuf,
    pub drm_class: PathBuf,
    pub dev_dri: PathBuf,
}

// Fake hardware facts used to test the decision logic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeSystem {
    // Current cards, in the state file format
    pub lspci_file: PathBuf,
    pub module_available: bool,
    pub module_versioned: bool,
    pub requires_offloading: bool,
}

// Immutable configuration of a run, built once at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub dry_run: bool,

    pub last_boot_file: PathBuf,
    pub new_boot_file: PathBuf,
    pub offloading_file: PathBuf,
    pub prime_settings: PathBuf,
    pub gpu_detection_path: PathBuf,
    pub modprobe_d_path: PathBuf,
    pub xorg_conf_d_path: PathBuf,
    pub amdgpu_pro_px_file: PathBuf,

    pub system: SystemPaths,

    pub fake: Option<FakeSystem>,
}

// Path overrides read from the optional Json configuration file
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ConfigFile {
    pub last_boot_file: Option<PathBuf>,
    pub new_boot_file: Option<PathBuf>,
    pub offloading_file: Option<PathBuf>,
    pub prime_settings: Option<PathBuf>,
    pub gpu_detection_path: Option<PathBuf>,
    pub modprobe_d_path: Option<PathBuf>,
    pub xorg_conf_d_path: Option<PathBuf>,
    pub amdgpu_pro_px_file: Option<PathBuf>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!("Parsing config file at: {path:?}");

        let file = File::open(path).map_err(|source| ConfigError::Open {
            path: path.to_path_buf(),
            source,
        })?;

        serde_json::from_reader(BufReader::new(file)).map_err(|source| {
            ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })
    }
}

impl Config {
    // Build the configuration: defaults, then the Json file,
    // then the command line
    pub fn from_args(args: &ArgsOptions) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(path) = &args.config_file_path {
            config.apply_file(ConfigFile::load(path)?);
        }

        config.apply_args(args);
        config.log_summary();

        Ok(config)
    }

    // Default configuration with every path moved under the given root
    pub fn under_root(root: &Path) -> Self {
        let rebase = |path: &mut PathBuf| {
            let rebased =
                root.join(path.strip_prefix("/").unwrap_or(path.as_path()));
            *path = rebased;
        };

        let mut config = Config::default();

        for path in [
            &mut config.last_boot_file,
            &mut config.new_boot_file,
            &mut config.offloading_file,
            &mut config.prime_settings,
            &mut config.gpu_detection_path,
            &mut config.modprobe_d_path,
            &mut config.xorg_conf_d_path,
            &mut config.amdgpu_pro_px_file,
            &mut config.system.kernel_cmdline,
            &mut config.system.proc_modules,
            &mut config.system.proc_dir,
            &mut config.system.passwd,
            &mut config.system.lib_modules,
            &mut config.system.lib_modprobe_d,
            &mut config.system.kernel_release,
            &mut config.system.pci_devices,
            &mut config.system.drm_class,
            &mut config.system.dev_dri,
        ] {
            rebase(path);
        }

        config
    }

    fn apply_file(&mut self, file: ConfigFile) {
        let new_boot_set = file.new_boot_file.is_some();

        override_path(&mut self.last_boot_file, file.last_boot_file);
        override_path(&mut self.new_boot_file, file.new_boot_file);
        override_path(&mut self.offloading_file, file.offloading_file);
        override_path(&mut self.prime_settings, file.prime_settings);
        override_path(&mut self.gpu_detection_path, file.gpu_detection_path);
        override_path(&mut self.modprobe_d_path, file.modprobe_d_path);
        override_path(&mut self.xorg_conf_d_path, file.xorg_conf_d_path);
        override_path(&mut self.amdgpu_pro_px_file, file.amdgpu_pro_px_file);

        if !new_boot_set {
            self.new_boot_file = self.last_boot_file.clone();
        }
    }

    fn apply_args(&mut self, args: &ArgsOptions) {
        self.dry_run = args.dry_run;

        override_path(&mut self.last_boot_file, args.last_boot_file.clone());

        // The new state goes where the old one was read from
        // unless told otherwise
        match &args.new_boot_file {
            Some(path) => self.new_boot_file = path.clone(),
            None if args.last_boot_file.is_some() => {
                self.new_boot_file = self.last_boot_file.clone()
            }
            None => {}
        }

        override_path(&mut self.offloading_file, args.offloading_file.clone());
        override_path(&mut self.prime_settings, args.prime_settings.clone());
        override_path(
            &mut self.gpu_detection_path,
            args.gpu_detection_path.clone(),
        );
        override_path(&mut self.modprobe_d_path, args.modprobe_d_path.clone());
        override_path(
            &mut self.xorg_conf_d_path,
            args.xorg_conf_d_path.clone(),
        );
        override_path(
            &mut self.amdgpu_pro_px_file,
            args.amdgpu_pro_px_file.clone(),
        );
        override_path(
            &mut self.system.proc_modules,
            args.fake_modules_path.clone(),
        );

        self.fake = args.fake_lspci.as_ref().map(|lspci_file| FakeSystem {
            lspci_file: lspci_file.clone(),
            module_available: args.fake_module_available,
            module_versioned: args.fake_module_versioned,
            requires_offloading: args.fake_requires_offloading,
        });
    }

    fn log_summary(&self) {
        info!("last_boot_file: {:?}", self.last_boot_file);
        info!("new_boot_file: {:?}", self.new_boot_file);
        info!("prime_settings file: {:?}", self.prime_settings);
        info!("gpu_detection_path: {:?}", self.gpu_detection_path);
        info!("amdgpu_pro_px_file: {:?}", self.amdgpu_pro_px_file);
        info!("modprobe_d_path: {:?}", self.modprobe_d_path);
        info!("xorg_conf_d_path: {:?}", self.xorg_conf_d_path);
        info!("modules list: {:?}", self.system.proc_modules);

        if let Some(fake) = &self.fake {
            info!("fake_lspci_file: {:?}", fake.lspci_file);
        }
    }
}

fn override_path(target: &mut PathBuf, value: Option<PathBuf>) {
    if let Some(value) = value {
        *target = value;
    }
}

impl Default for SystemPaths {
    fn default() -> Self {
        Self {
            kernel_cmdline: PathBuf::from("/proc/cmdline"),
            proc_modules: PathBuf::from("/proc/modules"),
            proc_dir: PathBuf::from("/proc"),
            passwd: PathBuf::from("/etc/passwd"),
            lib_modules: PathBuf::from("/lib/modules"),
            lib_modprobe_d: PathBuf::from("/lib/modprobe.d"),
            kernel_release: PathBuf::from("/proc/sys/kernel/osrelease"),
            pci_devices: PathBuf::from("/sys/bus/pci/devices"),
            drm_class: PathBuf::from("/sys/class/drm"),
            dev_dri: PathBuf::from("/dev/dri"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dry_run: false,

            last_boot_file: PathBuf::from(LAST_BOOT),
            new_boot_file: PathBuf::from(LAST_BOOT),
            offloading_file: PathBuf::from(OFFLOADING_CONF),
            prime_settings: PathBuf::from(PRIME_SETTINGS),
            gpu_detection_path: PathBuf::from(GPU_DETECTION_PATH),
            modprobe_d_path: PathBuf::from(MODPROBE_D_PATH),
            xorg_conf_d_path: PathBuf::from(XORG_CONF_D_PATH),
            amdgpu_pro_px_file: PathBuf::from(AMDGPU_PRO_PX),

            system: SystemPaths::default(),

            fake: None,
        }
    }
}
