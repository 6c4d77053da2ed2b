use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{info, warn};

use crate::command::CommandRunner;

pub const PRIME_OUTPUTCLASS: &str = "11-nvidia-prime.conf";
pub const OFFLOAD_SERVERLAYOUT: &str = "11-nvidia-offload.conf";

const HEADER: &str = "# DO NOT EDIT. AUTOMATICALLY GENERATED BY gpu-manager\n\n";

#[derive(Debug, Error)]
pub enum XorgConfError {
    #[error("Failed to write {path:?}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to remove {path:?}")]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

// Result of removing a fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Removed,
    NotPresent,
}

// Generated configuration snippets in an xorg.conf.d directory
pub struct XorgFragments {
    dir: PathBuf,
}

impl XorgFragments {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    // Make the NVIDIA GPU the primary one
    pub fn write_prime_outputclass(&self, multiarch: &str) -> Result<(), XorgConfError> {
        let content = format!(
            "{HEADER}\
             Section \"OutputClass\"\n    \
             Identifier \"Nvidia Prime\"\n    \
             MatchDriver \"nvidia-drm\"\n    \
             Driver \"nvidia\"\n    \
             Option \"AllowEmptyInitialConfiguration\"\n    \
             Option \"IgnoreDisplayDevices\" \"CRT\"\n    \
             Option \"PrimaryGPU\" \"Yes\"\n    \
             ModulePath \"/{multiarch}/nvidia/xorg\"\n\
             EndSection\n\n"
        );

        self.write(PRIME_OUTPUTCLASS, &content)
    }

    // Allow render offload to the NVIDIA GPU
    pub fn write_offload_serverlayout(&self) -> Result<(), XorgConfError> {
        let content = format!(
            "{HEADER}\
             Section \"ServerLayout\"\n    \
             Identifier \"layout\"\n    \
             Option \"AllowNVIDIAGPUScreens\"\n\
             EndSection\n\n"
        );

        self.write(OFFLOAD_SERVERLAYOUT, &content)
    }

    pub fn remove_prime_outputclass(&self) -> Result<Removal, XorgConfError> {
        self.remove(PRIME_OUTPUTCLASS)
    }

    pub fn remove_offload_serverlayout(&self) -> Result<Removal, XorgConfError> {
        self.remove(OFFLOAD_SERVERLAYOUT)
    }

    // Write through a temp file in the same directory so readers
    // never see a partial fragment
    fn write(&self, name: &str, content: &str) -> Result<(), XorgConfError> {
        let path = self.path_of(name);
        info!("Writing {path:?}");

        let write_err = |source| XorgConfError::Write {
            path: path.clone(),
            source,
        };

        let mut file = NamedTempFile::new_in(&self.dir).map_err(write_err)?;
        file.write_all(content.as_bytes()).map_err(write_err)?;
        file.flush().map_err(write_err)?;
        file.persist(&path).map_err(|err| write_err(err.error))?;

        Ok(())
    }

    fn remove(&self, name: &str) -> Result<Removal, XorgConfError> {
        let path = self.path_of(name);

        match fs::remove_file(&path) {
            Ok(()) => {
                info!("Removed {path:?}");
                Ok(Removal::Removed)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                info!("Nothing to remove at {path:?}");
                Ok(Removal::NotPresent)
            }
            Err(source) => Err(XorgConfError::Remove { path, source }),
        }
    }
}

// Debian multiarch tuple of the host, e.g. "x86_64-linux-gnu"
pub fn multiarch(runner: &dyn CommandRunner) -> String {
    let answer = runner.first_line(
        "/usr/bin/dpkg-architecture",
        &["-qDEB_HOST_MULTIARCH"],
    );

    match answer {
        Ok(Some(tuple)) if !tuple.trim().is_empty() => tuple.trim().to_string(),
        Ok(_) => fallback_multiarch("no answer from dpkg-architecture"),
        Err(err) => fallback_multiarch(&format!("{err:#}")),
    }
}

fn fallback_multiarch(reason: &str) -> String {
    let tuple = format!("{}-linux-gnu", std::env::consts::ARCH);
    warn!("Can't get the multiarch tuple ({reason}), using {tuple}");

    tuple
}
