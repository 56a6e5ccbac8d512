//! Stage output: status plus the artifacts produced per port.

use super::StageStatus;
use crate::errors::SlabprepError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// The output of a stage execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    /// The status of the stage execution.
    pub status: StageStatus,

    /// Files produced, keyed by output port.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub artifacts: BTreeMap<String, PathBuf>,

    /// Error message (for failed executions).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Diagnostic code of the error, when it carries one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,

    /// Skip reason (for skipped executions).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,

    /// Additional metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Default for StageOutput {
    fn default() -> Self {
        Self::ok_empty()
    }
}

impl StageOutput {
    fn with_status(status: StageStatus) -> Self {
        Self {
            status,
            artifacts: BTreeMap::new(),
            error: None,
            error_code: None,
            skip_reason: None,
            metadata: BTreeMap::new(),
        }
    }

    /// A successful output with artifacts.
    #[must_use]
    pub fn ok(artifacts: BTreeMap<String, PathBuf>) -> Self {
        Self {
            artifacts,
            ..Self::with_status(StageStatus::Ok)
        }
    }

    /// A successful output with no artifacts.
    #[must_use]
    pub fn ok_empty() -> Self {
        Self::with_status(StageStatus::Ok)
    }

    /// A skipped output.
    #[must_use]
    pub fn skip(reason: impl Into<String>) -> Self {
        Self {
            skip_reason: Some(reason.into()),
            ..Self::with_status(StageStatus::Skip)
        }
    }

    /// A failed output.
    #[must_use]
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::with_status(StageStatus::Fail)
        }
    }

    /// A failed output carrying the error's diagnostic code.
    #[must_use]
    pub fn from_error(error: &SlabprepError) -> Self {
        Self {
            error: Some(error.to_string()),
            error_code: error.code().map(str::to_string),
            ..Self::with_status(StageStatus::Fail)
        }
    }

    /// An output for a stage that never ran because `failed` did not succeed.
    #[must_use]
    pub fn aborted(failed: &str) -> Self {
        Self {
            error: Some(format!("aborted: dependency '{failed}' did not complete")),
            ..Self::with_status(StageStatus::Aborted)
        }
    }

    /// Adds one artifact.
    #[must_use]
    pub fn with_artifact(mut self, port: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.artifacts.insert(port.into(), path.into());
        self
    }

    /// Adds a single metadata entry.
    #[must_use]
    pub fn add_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// The artifact bound to `port`.
    #[must_use]
    pub fn artifact(&self, port: &str) -> Option<&Path> {
        self.artifacts.get(port).map(PathBuf::as_path)
    }

    /// Returns true if the stage succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Returns true if the stage failed or was aborted.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        self.status.is_failure()
    }
}

impl<E: Into<SlabprepError>> From<std::result::Result<BTreeMap<String, PathBuf>, E>> for StageOutput {
    fn from(result: std::result::Result<BTreeMap<String, PathBuf>, E>) -> Self {
        match result {
            Ok(artifacts) => Self::ok(artifacts),
            Err(e) => Self::from_error(&e.into()),
        }
    }
}
