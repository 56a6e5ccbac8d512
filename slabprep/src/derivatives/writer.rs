//! Persisting artifacts into the derivative tree.

use crate::errors::Result;
use std::path::Path;
use tracing::{debug, info};

/// What a write did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The artifact was copied into place.
    Written,
    /// The destination already existed and was left untouched.
    Kept,
}

/// Copies produced files and directories to their derivative paths.
#[derive(Debug, Clone, Copy, Default)]
pub struct DerivativeWriter {
    overwrite: bool,
}

impl DerivativeWriter {
    /// A writer that never replaces existing artifacts.
    #[must_use]
    pub const fn new() -> Self {
        Self { overwrite: false }
    }

    /// Replace existing artifacts.
    #[must_use]
    pub const fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Copies `source` (file or directory) to `dest`, creating parent directories.
    pub fn write(&self, source: &Path, dest: &Path) -> Result<WriteOutcome> {
        if dest.exists() && !self.overwrite {
            debug!(dest = %dest.display(), "Derivative exists, keeping it");
            return Ok(WriteOutcome::Kept);
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if source.is_dir() {
            if dest.exists() {
                std::fs::remove_dir_all(dest)?;
            }
            copy_dir(source, dest)?;
        } else {
            std::fs::copy(source, dest)?;
        }
        info!(dest = %dest.display(), "Wrote derivative");
        Ok(WriteOutcome::Written)
    }
}

fn copy_dir(source: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_existing_artifact_is_kept() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.txt");
        let dest = dir.path().join("out/a/dest.txt");
        std::fs::write(&src, "new").unwrap();
        std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
        std::fs::write(&dest, "old").unwrap();

        let outcome = DerivativeWriter::new().write(&src, &dest).unwrap();
        assert_eq!(outcome, WriteOutcome::Kept);
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "old");

        let outcome = DerivativeWriter::new().with_overwrite(true).write(&src, &dest).unwrap();
        assert_eq!(outcome, WriteOutcome::Written);
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "new");
    }

    #[test]
    fn test_directories_copied_recursively() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("mats");
        std::fs::create_dir_all(src.join("nested")).unwrap();
        std::fs::write(src.join("MAT_0000"), "1").unwrap();
        std::fs::write(src.join("nested/x"), "2").unwrap();

        let dest = dir.path().join("deriv/reg/run__hmc.mats");
        DerivativeWriter::new().write(&src, &dest).unwrap();
        assert!(dest.join("MAT_0000").is_file());
        assert!(dest.join("nested/x").is_file());
    }
}
