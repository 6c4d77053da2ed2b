use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
};

use chrono::Local;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

// Set up the global subscriber. Logs go to the given file, or to
// stdout when there is none or it can't be created. The returned
// guard flushes the writer when dropped and must outlive the run
pub fn init_logging(log_file: Option<&Path>, backup: bool) -> WorkerGuard {
    let level = if cfg!(debug_assertions) { "trace" } else { "info" };

    let (filter, env_missing) = match EnvFilter::try_from_default_env() {
        Ok(f) => (f, false),
        Err(_) => (EnvFilter::new(level), true),
    };

    // Nothing can be logged before the subscriber exists
    let mut deferred = Vec::new();

    let file = log_file.and_then(|path| {
        if backup {
            match backup_log(path) {
                Ok(Some(moved)) => {
                    deferred.push(format!("Old log moved to {moved:?}"))
                }
                Ok(None) => {}
                Err(err) => deferred
                    .push(format!("Failed to back up the log {path:?}: {err}")),
            }
        }

        match File::create(path) {
            Ok(file) => Some(file),
            Err(err) => {
                deferred.push(format!(
                    "Can't open the log file {path:?} ({err}), using stdout"
                ));
                None
            }
        }
    });

    let to_file = file.is_some();
    let (writer, guard) = match file {
        Some(file) => tracing_appender::non_blocking(file),
        None => tracing_appender::non_blocking(io::stdout()),
    };

    let fmt_layer = fmt::layer().with_writer(writer).with_ansi(!to_file);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter)
        .init();

    if env_missing {
        info!("\"RUST_LOG\" variable not set, defaulting to {level}");
    }

    for message in deferred {
        warn!("{message}");
    }

    guard
}

// Rename an existing log to "<log>.<HHMMmmddYYYY>"
fn backup_log(path: &Path) -> io::Result<Option<PathBuf>> {
    if !path.exists() {
        return Ok(None);
    }

    let stamp = Local::now().format("%H%M%m%d%Y");
    let moved = PathBuf::from(format!("{}.{stamp}", path.display()));

    fs::rename(path, &moved)?;

    Ok(Some(moved))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_moves_the_old_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("gpu-manager.log");

        assert_eq!(backup_log(&log).unwrap(), None);

        fs::write(&log, "previous run\n").unwrap();
        let moved = backup_log(&log).unwrap().unwrap();

        assert!(!log.exists());
        assert_eq!(fs::read_to_string(&moved).unwrap(), "previous run\n");

        let name = moved.file_name().unwrap().to_string_lossy().to_string();
        let stamp = name.strip_prefix("gpu-manager.log.").unwrap();
        assert_eq!(stamp.len(), 12);
        assert!(stamp.chars().all(|c| c.is_ascii_digit()));
    }
}
