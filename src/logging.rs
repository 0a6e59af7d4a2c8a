//! Logging initialization from configuration.
//!
//! Builds a `tracing-subscriber` stack out of a [`LoggingConfig`]: an
//! env-filter seeded from the configured level (`RUST_LOG` wins when set),
//! an optional console layer, and an optional file sink with size-based
//! rotation applied at startup.

use std::fs::{self, OpenOptions};
use std::path::Path;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::CoreError;

/// Initialize the global tracing subscriber. Call once per process.
pub fn init(config: &LoggingConfig) -> Result<(), CoreError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(config.console);

    match &config.file {
        Some(path) => {
            rotate_if_needed(path, config.max_bytes, config.backup_count)?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|err| {
                    CoreError::Config(format!("cannot open log file '{}': {}", path.display(), err))
                })?;
            let writer = std::sync::Arc::new(file);
            if config.format == "compact" {
                builder
                    .compact()
                    .with_writer(writer)
                    .with_ansi(false)
                    .init();
            } else {
                builder.with_writer(writer).with_ansi(false).init();
            }
        }
        None => {
            if config.format == "compact" {
                builder.compact().init();
            } else {
                builder.init();
            }
        }
    }

    info!(level = %config.level, "logging initialized");
    Ok(())
}

/// Shift `path` into numbered backups once it exceeds `max_bytes`.
///
/// `app.log` becomes `app.log.1`, an existing `app.log.1` becomes
/// `app.log.2`, and so on; anything beyond `backup_count` is dropped.
fn rotate_if_needed(path: &Path, max_bytes: u64, backup_count: u32) -> Result<(), CoreError> {
    let size = match fs::metadata(path) {
        Ok(metadata) => metadata.len(),
        Err(_) => return Ok(()),
    };
    if max_bytes == 0 || size < max_bytes {
        return Ok(());
    }

    let name = path.to_string_lossy();
    for index in (1..=backup_count).rev() {
        let source = if index == 1 {
            path.to_path_buf()
        } else {
            std::path::PathBuf::from(format!("{}.{}", name, index - 1))
        };
        let target = std::path::PathBuf::from(format!("{}.{}", name, index));
        if source.exists() {
            let _ = fs::rename(&source, &target);
        }
    }
    if backup_count == 0 {
        let _ = fs::remove_file(path);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_rotate_shifts_backups() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("app.log");

        let mut file = fs::File::create(&log).unwrap();
        file.write_all(&vec![b'x'; 64]).unwrap();
        drop(file);

        rotate_if_needed(&log, 32, 2).unwrap();
        assert!(!log.exists());
        assert!(dir.path().join("app.log.1").exists());

        // A second oversized file pushes the first backup down.
        let mut file = fs::File::create(&log).unwrap();
        file.write_all(&vec![b'y'; 64]).unwrap();
        drop(file);
        rotate_if_needed(&log, 32, 2).unwrap();
        assert!(dir.path().join("app.log.1").exists());
        assert!(dir.path().join("app.log.2").exists());
    }

    #[test]
    fn test_rotate_skips_small_files() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("app.log");
        fs::write(&log, b"tiny").unwrap();

        rotate_if_needed(&log, 1024, 2).unwrap();
        assert!(log.exists());
        assert!(!dir.path().join("app.log.1").exists());
    }
}
