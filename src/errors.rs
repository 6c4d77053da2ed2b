use thiserror::Error;

use crate::{
    config_manager::ConfigError, pci_bus::PciBusError,
    state_store::StateStoreError,
};

// Errors that end a run early
#[derive(Debug, Error)]
pub enum GpuManagerError {
    #[error("Disabled by the \"nogpumanager\" kernel parameter")]
    DisabledByKernelParameter,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    PciBus(#[from] PciBusError),
    #[error(transparent)]
    StateStore(#[from] StateStoreError),
}
