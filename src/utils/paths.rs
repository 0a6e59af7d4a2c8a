//! Working-directory resolution for spawned sessions.

use std::env;
use std::path::PathBuf;
use tracing::debug;

/// Environment variable overriding the repository root.
pub const ROOT_ENV: &str = "MUXCREW_ROOT";

/// Resolve the repository root: `MUXCREW_ROOT` when set and existing,
/// otherwise the current working directory.
pub fn repo_root() -> PathBuf {
    if let Ok(value) = env::var(ROOT_ENV) {
        let candidate = PathBuf::from(value);
        if candidate.is_dir() {
            return candidate;
        }
        debug!(
            "{} points at '{}' which is not a directory; falling back to cwd",
            ROOT_ENV,
            candidate.display()
        );
    }
    env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

/// Resolve the working directory for an agent: the configured path when
/// given, otherwise the repository root.
pub fn working_dir(configured: Option<&PathBuf>) -> PathBuf {
    configured.cloned().unwrap_or_else(repo_root)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_working_dir_prefers_configured() {
        let configured = PathBuf::from("/srv/project");
        assert_eq!(working_dir(Some(&configured)), configured);
    }

    #[test]
    fn test_working_dir_falls_back_to_root() {
        let resolved = working_dir(None);
        assert!(!resolved.as_os_str().is_empty());
    }
}
