pub mod amd_pro;
pub mod arg_parser;
pub mod command;
pub mod config_manager;
pub mod connectivity;
pub mod errors;
pub mod gpu_device;
pub mod gpu_manager;
pub mod inventory;
pub mod logger;
pub mod module_facts;
pub mod module_manager;
pub mod pci_bus;
pub mod policy;
pub mod power;
pub mod prime;
pub mod sysfs;
pub mod state_store;
pub mod xorg_conf;
