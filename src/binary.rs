//! Location of the backup tool binary.

use crate::error::{BackrunError, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable overriding the backup tool location.
pub const RESTIC_COMMAND_ENV: &str = "BACKRUN_RESTIC_COMMAND";

/// Resolves the path of an external binary.
pub trait BinaryProvider: Send + Sync {
    fn locate(&self) -> Result<PathBuf>;
}

/// Finds `restic`: an explicit path first, then [`RESTIC_COMMAND_ENV`], then `PATH`.
#[derive(Debug, Clone, Default)]
pub struct ResticBinary {
    explicit: Option<PathBuf>,
}

impl ResticBinary {
    pub fn new(explicit: Option<PathBuf>) -> Self {
        Self { explicit }
    }
}

fn check_file(path: &Path, source: &str) -> Result<PathBuf> {
    if path.is_file() {
        debug!(path = %path.display(), source, "Located backup tool");
        Ok(path.to_path_buf())
    } else {
        Err(BackrunError::NotFound(format!(
            "backup tool at {} (from {})",
            path.display(),
            source
        )))
    }
}

impl BinaryProvider for ResticBinary {
    fn locate(&self) -> Result<PathBuf> {
        if let Some(path) = &self.explicit {
            return check_file(path, "settings");
        }
        if let Some(path) = std::env::var_os(RESTIC_COMMAND_ENV) {
            return check_file(Path::new(&path), RESTIC_COMMAND_ENV);
        }
        which::which("restic")
            .map_err(|e| BackrunError::NotFound(format!("restic on PATH: {}", e)))
    }
}

/// A fixed path, for tests and wrappers.
#[derive(Debug, Clone)]
pub struct FixedBinary(pub PathBuf);

impl BinaryProvider for FixedBinary {
    fn locate(&self) -> Result<PathBuf> {
        check_file(&self.0, "fixed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_explicit_path_wins() {
        let dir = tempdir().unwrap();
        let bin = dir.path().join("restic");
        std::fs::write(&bin, "#!/bin/sh\n").unwrap();

        let provider = ResticBinary::new(Some(bin.clone()));
        assert_eq!(provider.locate().unwrap(), bin);
    }

    #[test]
    fn test_missing_explicit_path() {
        let provider = ResticBinary::new(Some(PathBuf::from("/nonexistent/restic")));
        assert!(matches!(provider.locate(), Err(BackrunError::NotFound(_))));
    }
}
