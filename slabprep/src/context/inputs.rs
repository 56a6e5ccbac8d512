//! Stage inputs with strict port access.

use crate::errors::UndeclaredInputError;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// The files bound to a stage's declared input ports.
///
/// Reading a port the stage never declared is an error, never a silent `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageInputs {
    stage_name: String,
    bound: BTreeMap<String, PathBuf>,
}

impl StageInputs {
    /// Creates inputs for `stage_name` from resolved bindings.
    #[must_use]
    pub fn new(stage_name: impl Into<String>, bound: BTreeMap<String, PathBuf>) -> Self {
        Self {
            stage_name: stage_name.into(),
            bound,
        }
    }

    /// The file bound to `port`.
    pub fn get(&self, port: &str) -> Result<&Path, UndeclaredInputError> {
        self.bound
            .get(port)
            .map(PathBuf::as_path)
            .ok_or_else(|| UndeclaredInputError::new(&self.stage_name, port))
    }

    /// The file bound to `port`, if the port is declared.
    #[must_use]
    pub fn optional(&self, port: &str) -> Option<&Path> {
        self.bound.get(port).map(PathBuf::as_path)
    }

    /// Checks if `port` is bound.
    #[must_use]
    pub fn contains(&self, port: &str) -> bool {
        self.bound.contains_key(port)
    }

    /// Bound port names in order.
    pub fn ports(&self) -> impl Iterator<Item = &str> {
        self.bound.keys().map(String::as_str)
    }

    /// All bindings.
    #[must_use]
    pub fn bound(&self) -> &BTreeMap<String, PathBuf> {
        &self.bound
    }

    /// Number of bound ports.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bound.len()
    }

    /// Returns true if nothing is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bound.is_empty()
    }
}
