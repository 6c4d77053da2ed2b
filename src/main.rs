use anyhow::Result;
use gpu_manager::{
    arg_parser::ArgsOptions,
    command::SystemRunner,
    config_manager::Config,
    errors::GpuManagerError,
    gpu_manager::{GpuManager, RunReport, log_chain},
    logger,
    pci_bus::SysfsPciBus,
};
use tracing::info;

fn main() -> Result<()> {
    // Parse the command line arguments
    let args_options = ArgsOptions::parse();

    let _log_guard = logger::init_logging(
        args_options.log_file.as_deref(),
        args_options.backup_log,
    );

    // Failures are only reported in the log, the exit status stays 0
    match run(&args_options) {
        Ok(report) => info!("Run completed: {report:?}"),
        Err(err) => log_chain(&err),
    }

    Ok(())
}

fn run(args_options: &ArgsOptions) -> Result<RunReport, GpuManagerError> {
    let config = Config::from_args(args_options)?;

    let runner = SystemRunner;
    let bus = SysfsPciBus::new(&config.system.pci_devices);

    GpuManager::new(&config, &runner, &bus).run()
}
