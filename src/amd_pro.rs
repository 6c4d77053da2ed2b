use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{error, info};

use crate::command::{CommandRunner, command_line};

#[derive(Debug, Error)]
pub enum AmdProError {
    #[error("{command} failed")]
    Failed { command: String },
    #[error("Failed to run {command}")]
    Spawn {
        command: String,
        #[source]
        source: anyhow::Error,
    },
}

// Actions understood by the amdgpu-pro-px utility
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProAction {
    PowerSaving,
    Performance,
    Reset,
    IsPx,
}

impl ProAction {
    fn args(&self) -> &'static [&'static str] {
        match self {
            ProAction::PowerSaving => &["--mode", "powersaving"],
            ProAction::Performance => &["--mode", "performance"],
            ProAction::Reset => &["--reset"],
            ProAction::IsPx => &["--ispx"],
        }
    }
}

// Driver for the AMD Pro switchable graphics utility
pub struct AmdProUtility<'a> {
    path: PathBuf,
    runner: &'a dyn CommandRunner,
    dry_run: bool,
}

impl<'a> AmdProUtility<'a> {
    pub fn new(path: &Path, runner: &'a dyn CommandRunner, dry_run: bool) -> Self {
        Self {
            path: path.to_path_buf(),
            runner,
            dry_run,
        }
    }

    pub fn run(&self, action: ProAction) -> Result<(), AmdProError> {
        match action {
            ProAction::PowerSaving => {
                info!("Enabling power saving mode for amdgpu-pro")
            }
            ProAction::Performance => {
                info!("Enabling performance mode for amdgpu-pro")
            }
            ProAction::Reset => {
                info!("Resetting the script changes for amdgpu-pro")
            }
            ProAction::IsPx => {}
        }

        let program = self.path.to_string_lossy();
        let command = command_line(&program, action.args());

        if self.dry_run {
            info!("Dry run: {command}");
            return Ok(());
        }

        match self.runner.status(&program, action.args()) {
            Ok(true) => Ok(()),
            Ok(false) => {
                error!("{command} failed");
                Err(AmdProError::Failed { command })
            }
            Err(source) => Err(AmdProError::Spawn { command, source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ScriptedRunner;

    const PX: &str = "/opt/amdgpu-pro/bin/amdgpu-pro-px";

    #[test]
    fn passes_the_action_arguments() {
        let runner = ScriptedRunner::new();
        let utility = AmdProUtility::new(Path::new(PX), &runner, false);

        utility.run(ProAction::PowerSaving).unwrap();
        utility.run(ProAction::Reset).unwrap();

        assert_eq!(
            runner.calls(),
            vec![format!("{PX} --mode powersaving"), format!("{PX} --reset")]
        );
    }

    #[test]
    fn failures_are_reported() {
        let runner = ScriptedRunner::new().fail(&format!("{PX} --reset"));
        let utility = AmdProUtility::new(Path::new(PX), &runner, false);

        assert!(matches!(
            utility.run(ProAction::Reset),
            Err(AmdProError::Failed { .. })
        ));
    }

    #[test]
    fn dry_run_only_logs() {
        let runner = ScriptedRunner::new();
        let utility = AmdProUtility::new(Path::new(PX), &runner, true);

        utility.run(ProAction::Performance).unwrap();

        assert!(runner.calls().is_empty());
    }
}
