use std::fmt;

// PCI vendor identifiers this tool knows how to handle
pub const AMD_VENDOR_ID: u16 = 0x1002;
pub const INTEL_VENDOR_ID: u16 = 0x8086;
pub const NVIDIA_VENDOR_ID: u16 = 0x10de;

// GPU vendor, keyed by the numeric PCI vendor ID.
// Unknown vendors keep their ID so it can be persisted unchanged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Amd,
    Intel,
    Nvidia,
    Other(u16),
}

impl GpuVendor {
    // Return the numeric PCI vendor ID
    pub fn id(&self) -> u16 {
        match self {
            GpuVendor::Amd => AMD_VENDOR_ID,
            GpuVendor::Intel => INTEL_VENDOR_ID,
            GpuVendor::Nvidia => NVIDIA_VENDOR_ID,
            GpuVendor::Other(id) => *id,
        }
    }

    // Name of the kernel module driving this vendor's cards,
    // None for vendors this tool never loads or unloads
    pub fn base_module(&self) -> Option<&'static str> {
        match self {
            GpuVendor::Amd => Some("amdgpu"),
            GpuVendor::Intel => Some("i915"),
            GpuVendor::Nvidia => Some("nvidia"),
            GpuVendor::Other(_) => None,
        }
    }

    // Modules that hold a reference on the base module and must
    // be removed before it
    pub fn companion_modules(&self) -> &'static [&'static str] {
        match self {
            GpuVendor::Nvidia => &["nvidia-drm", "nvidia-uvm", "nvidia-modeset"],
            _ => &[],
        }
    }
}

impl From<u16> for GpuVendor {
    fn from(id: u16) -> Self {
        match id {
            AMD_VENDOR_ID => GpuVendor::Amd,
            INTEL_VENDOR_ID => GpuVendor::Intel,
            NVIDIA_VENDOR_ID => GpuVendor::Nvidia,
            other => GpuVendor::Other(other),
        }
    }
}

impl fmt::Display for GpuVendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuVendor::Amd => write!(f, "AMD"),
            GpuVendor::Intel => write!(f, "Intel"),
            GpuVendor::Nvidia => write!(f, "NVIDIA"),
            GpuVendor::Other(id) => write!(f, "{id:#06x}"),
        }
    }
}
