//! Stage status and kind enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of work a stage performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Invokes an opaque external operator.
    #[default]
    Operator,
    /// Estimates a registration link.
    Register,
    /// Composes a transform chain into a static field.
    Compose,
    /// Resamples images through a composed field.
    Resample,
    /// Persists derivatives.
    Write,
    /// Prepares inputs (truncation and similar bookkeeping).
    Prepare,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Operator => write!(f, "operator"),
            Self::Register => write!(f, "register"),
            Self::Compose => write!(f, "compose"),
            Self::Resample => write!(f, "resample"),
            Self::Write => write!(f, "write"),
            Self::Prepare => write!(f, "prepare"),
        }
    }
}

/// The execution status of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Stage completed successfully.
    Ok,
    /// Stage had nothing to do.
    Skip,
    /// Stage failed.
    Fail,
    /// Stage never ran because a dependency failed.
    Aborted,
    /// Stage is pending execution.
    #[default]
    Pending,
    /// Stage is currently running.
    Running,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Skip => write!(f, "skip"),
            Self::Fail => write!(f, "fail"),
            Self::Aborted => write!(f, "aborted"),
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
        }
    }
}

impl StageStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Ok | Self::Skip | Self::Fail | Self::Aborted)
    }

    /// Returns true if the status indicates success.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Ok | Self::Skip)
    }

    /// Returns true if the status indicates failure.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Fail | Self::Aborted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_kind_display() {
        assert_eq!(StageKind::Register.to_string(), "register");
        assert_eq!(StageKind::Resample.to_string(), "resample");
        assert_eq!(StageKind::default(), StageKind::Operator);
    }

    #[test]
    fn test_stage_status_is_terminal() {
        assert!(StageStatus::Ok.is_terminal());
        assert!(StageStatus::Aborted.is_terminal());
        assert!(!StageStatus::Pending.is_terminal());
        assert!(!StageStatus::Running.is_terminal());
        assert!(StageStatus::Aborted.is_failure());
        assert!(StageStatus::Skip.is_success());
    }

    #[test]
    fn test_stage_status_serialize() {
        let json = serde_json::to_string(&StageStatus::Aborted).unwrap();
        assert_eq!(json, r#""aborted""#);
        let back: StageStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, StageStatus::Aborted);
    }
}
