use std::path::PathBuf;

use argparse::{
    ArgumentParser, Print, StoreFalse, StoreOption, StoreTrue,
};

// Raw command line options. Every path is optional here, defaults
// are filled in when the run configuration is built
#[derive(Debug, Default, Clone)]
pub struct ArgsOptions {
    pub config_file_path: Option<PathBuf>,

    pub log_file: Option<PathBuf>,
    pub backup_log: bool,
    pub dry_run: bool,

    pub last_boot_file: Option<PathBuf>,
    pub new_boot_file: Option<PathBuf>,
    pub offloading_file: Option<PathBuf>,
    pub prime_settings: Option<PathBuf>,
    pub gpu_detection_path: Option<PathBuf>,
    pub modprobe_d_path: Option<PathBuf>,
    pub xorg_conf_d_path: Option<PathBuf>,
    pub amdgpu_pro_px_file: Option<PathBuf>,

    // Test helpers
    pub fake_lspci: Option<PathBuf>,
    pub fake_modules_path: Option<PathBuf>,
    pub fake_module_available: bool,
    pub fake_module_versioned: bool,
    pub fake_requires_offloading: bool,
}

impl ArgsOptions {
    pub fn parse() -> Self {
        let mut options = ArgsOptions::default();

        {
            let mut parser = ArgumentParser::new();
            parser.set_description(
                "Detect the available GPUs and deal with any system changes",
            );

            // Optional Json file overriding the default paths
            parser.refer(&mut options.config_file_path).add_option(
                &["-c", "--config"],
                StoreOption,
                "Json file overriding the default paths",
            );

            parser.refer(&mut options.log_file).add_option(
                &["-l", "--log"],
                StoreOption,
                "Write the log to this file instead of stdout",
            );
            parser.refer(&mut options.backup_log).add_option(
                &["--backup-log"],
                StoreTrue,
                "Move the previous log away before writing the new one",
            );
            parser.refer(&mut options.dry_run).add_option(
                &["--dry-run"],
                StoreTrue,
                "Never load, unload or kill anything",
            );

            parser.refer(&mut options.last_boot_file).add_option(
                &["-b", "--last-boot-file"],
                StoreOption,
                "State file describing the cards found at the last boot",
            );
            parser.refer(&mut options.new_boot_file).add_option(
                &["-n", "--new-boot-file"],
                StoreOption,
                "State file to write the current cards to",
            );
            parser.refer(&mut options.offloading_file).add_option(
                &["--offloading-file"],
                StoreOption,
                "Marker file signalling that offloading is required",
            );
            parser.refer(&mut options.prime_settings).add_option(
                &["-z", "--prime-settings"],
                StoreOption,
                "File holding the PRIME mode (on, on-demand, off)",
            );
            parser.refer(&mut options.gpu_detection_path).add_option(
                &["-s", "--gpu-detection-path"],
                StoreOption,
                "Directory holding the disabled card markers",
            );
            parser.refer(&mut options.modprobe_d_path).add_option(
                &["-k", "--modprobe-d-path"],
                StoreOption,
                "modprobe.d directory used for blacklist detection",
            );
            parser.refer(&mut options.xorg_conf_d_path).add_option(
                &["-a", "--xorg-conf-d-path"],
                StoreOption,
                "xorg.conf.d directory for the generated snippets",
            );
            parser.refer(&mut options.amdgpu_pro_px_file).add_option(
                &["-w", "--amdgpu-pro-px-file"],
                StoreOption,
                "Path of the amdgpu-pro-px utility",
            );

            parser.refer(&mut options.fake_lspci).add_option(
                &["-f", "--fake-lspci"],
                StoreOption,
                "Read the current cards from this file instead of the bus",
            );
            parser.refer(&mut options.fake_modules_path).add_option(
                &["-m", "--fake-modules-path"],
                StoreOption,
                "Read the loaded modules from this file",
            );
            parser
                .refer(&mut options.fake_module_available)
                .add_option(
                    &["--fake-module-is-available"],
                    StoreTrue,
                    "Pretend the vendor kernel modules are available",
                )
                .add_option(
                    &["--fake-module-is-not-available"],
                    StoreFalse,
                    "Pretend the vendor kernel modules are not available",
                );
            parser.refer(&mut options.fake_module_versioned).add_option(
                &["--fake-module-is-versioned"],
                StoreTrue,
                "Pretend the amdgpu module is versioned",
            );
            parser
                .refer(&mut options.fake_requires_offloading)
                .add_option(
                    &["--fake-requires-offloading"],
                    StoreTrue,
                    "Pretend the system requires offloading",
                )
                .add_option(
                    &["--fake-no-requires-offloading"],
                    StoreFalse,
                    "Pretend the system does not require offloading",
                );

            // Show the program version
            parser.add_option(
                &["-V", "--version"],
                Print(env!("CARGO_PKG_VERSION").to_string()),
                "Show the program version",
            );

            parser.parse_args_or_exit();
        }

        options
    }
}
