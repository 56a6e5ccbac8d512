//! Checkpoint completion and binding.
//!
//! A checkpoint is a named set of derivative artifacts produced by one branch
//! of the graph. When every artifact is present the branch is not rebuilt;
//! its artifacts are bound as inputs of downstream stages instead.

use super::store::PresenceStore;
use crate::errors::ResumabilityError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// A resumability unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    /// Checkpoint name (`anat_preproc`, `slab_bold:task-motor_run-01`, ...).
    pub name: String,
    /// Artifacts the checkpoint produces.
    pub artifacts: Vec<PathBuf>,
    /// Path whose presence marks the checkpoint as claimed complete.
    pub sentinel: Option<PathBuf>,
}

impl Checkpoint {
    /// Creates a checkpoint over a set of artifacts.
    #[must_use]
    pub fn new(name: impl Into<String>, artifacts: Vec<PathBuf>) -> Self {
        Self {
            name: name.into(),
            artifacts,
            sentinel: None,
        }
    }

    /// Sets the completion marker.
    #[must_use]
    pub fn with_sentinel(mut self, sentinel: impl Into<PathBuf>) -> Self {
        self.sentinel = Some(sentinel.into());
        self
    }
}

/// Completion state of a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointStatus {
    /// Every artifact exists.
    Complete,
    /// The branch must be (re)built.
    Incomplete,
}

/// Decides checkpoint completion against a presence store.
#[derive(Debug, Clone)]
pub struct ResumabilityManager {
    store: Arc<dyn PresenceStore>,
}

impl ResumabilityManager {
    /// Creates a manager over a store.
    #[must_use]
    pub fn new(store: Arc<dyn PresenceStore>) -> Self {
        Self { store }
    }

    /// Returns true if the artifact exists.
    #[must_use]
    pub fn exists(&self, path: &Path) -> bool {
        self.store.exists(path)
    }

    /// Completion state.
    ///
    /// With a sentinel, a present sentinel claims completion and any missing
    /// artifact is an inconsistency. Without one, the checkpoint is complete
    /// only when every artifact exists.
    pub fn status(&self, checkpoint: &Checkpoint) -> Result<CheckpointStatus, ResumabilityError> {
        let missing: Vec<PathBuf> = checkpoint
            .artifacts
            .iter()
            .filter(|p| !self.store.exists(p))
            .cloned()
            .collect();

        let claimed = checkpoint
            .sentinel
            .as_ref()
            .map_or(missing.is_empty(), |s| self.store.exists(s));

        match (claimed, missing.is_empty()) {
            (true, true) if !checkpoint.artifacts.is_empty() => Ok(CheckpointStatus::Complete),
            (true, false) if checkpoint.sentinel.is_some() => {
                Err(ResumabilityError::new(checkpoint.name.clone(), missing))
            }
            _ => Ok(CheckpointStatus::Incomplete),
        }
    }

    /// Returns true if the checkpoint is complete.
    pub fn is_complete(&self, checkpoint: &Checkpoint) -> Result<bool, ResumabilityError> {
        Ok(self.status(checkpoint)? == CheckpointStatus::Complete)
    }

    /// Returns the checkpoint's artifacts when it is complete, `None` when it must be built.
    pub fn bind(&self, checkpoint: &Checkpoint) -> Result<Option<Vec<PathBuf>>, ResumabilityError> {
        match self.status(checkpoint)? {
            CheckpointStatus::Complete => {
                info!(checkpoint = %checkpoint.name, artifacts = checkpoint.artifacts.len(), "Checkpoint complete, binding derivatives");
                Ok(Some(checkpoint.artifacts.clone()))
            }
            CheckpointStatus::Incomplete => {
                debug!(checkpoint = %checkpoint.name, "Checkpoint incomplete, building stages");
                Ok(None)
            }
        }
    }
}
