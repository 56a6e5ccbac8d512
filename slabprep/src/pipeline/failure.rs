//! Failure bookkeeping for graph execution.
//!
//! A failed stage aborts the stages that depend on it. Independent branches
//! keep running unless the graph runs fail-fast.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// How to handle stage failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Stop scheduling on the first failure; running stages drain.
    FailFast,
    /// Abort only the dependents of a failed stage.
    #[default]
    ContinueOnFailure,
}

/// Record of a stage failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Stage name.
    pub stage: String,
    /// Error message.
    pub error: String,
    /// Diagnostic code, when the error carries one.
    pub code: Option<String>,
    /// When the failure was recorded.
    pub timestamp: DateTime<Utc>,
}

impl FailureRecord {
    /// Creates a new failure record.
    #[must_use]
    pub fn new(stage: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            error: error.into(),
            code: None,
            timestamp: Utc::now(),
        }
    }

    /// Sets the diagnostic code.
    #[must_use]
    pub fn with_code(mut self, code: Option<String>) -> Self {
        self.code = code;
        self
    }
}

/// Summary of a graph execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureSummary {
    /// Total number of stages.
    pub total_stages: usize,
    /// Stages that succeeded.
    pub completed_stages: usize,
    /// Stages that failed.
    pub failed_stages: usize,
    /// Stages that never ran because an upstream stage failed.
    pub aborted_stages: usize,
    /// Failure records in the order they happened.
    pub failures: Vec<FailureRecord>,
}

impl FailureSummary {
    /// Returns the fraction of stages that succeeded.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        if self.total_stages == 0 {
            return 0.0;
        }
        self.completed_stages as f64 / self.total_stages as f64
    }

    /// Returns true if any failures occurred.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Collects failures while the graph runs.
#[derive(Debug, Default)]
pub struct FailureCollector {
    /// Failure mode.
    pub mode: FailureMode,
    failures: Vec<FailureRecord>,
    failed_stages: BTreeSet<String>,
    completed_stages: BTreeSet<String>,
    aborted_stages: BTreeSet<String>,
}

impl FailureCollector {
    /// Creates a new failure collector.
    #[must_use]
    pub fn new(mode: FailureMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Records a stage failure.
    pub fn record_failure(&mut self, record: FailureRecord) {
        self.failed_stages.insert(record.stage.clone());
        self.failures.push(record);
    }

    /// Records a stage completion.
    pub fn record_completion(&mut self, stage: &str) {
        self.completed_stages.insert(stage.to_string());
    }

    /// Records a stage aborted because of an upstream failure.
    pub fn record_abort(&mut self, stage: &str) {
        self.aborted_stages.insert(stage.to_string());
    }

    /// Returns true if the stage failed or was aborted.
    #[must_use]
    pub fn has_failed(&self, stage: &str) -> bool {
        self.failed_stages.contains(stage) || self.aborted_stages.contains(stage)
    }

    /// Returns true if no further stage should be scheduled.
    #[must_use]
    pub fn should_stop(&self) -> bool {
        match self.mode {
            FailureMode::FailFast => !self.failures.is_empty(),
            FailureMode::ContinueOnFailure => false,
        }
    }

    /// Returns true if a stage with these dependencies may run.
    #[must_use]
    pub fn can_run<'a>(&self, dependencies: impl IntoIterator<Item = &'a String>) -> bool {
        !self.should_stop() && !dependencies.into_iter().any(|dep| self.has_failed(dep))
    }

    /// The first recorded failure.
    #[must_use]
    pub fn first_failure(&self) -> Option<&FailureRecord> {
        self.failures.first()
    }

    /// Creates a summary of the execution.
    #[must_use]
    pub fn summary(&self, total_stages: usize) -> FailureSummary {
        FailureSummary {
            total_stages,
            completed_stages: self.completed_stages.len(),
            failed_stages: self.failed_stages.len(),
            aborted_stages: self.aborted_stages.len(),
            failures: self.failures.clone(),
        }
    }

    /// Returns all failures.
    #[must_use]
    pub fn failures(&self) -> &[FailureRecord] {
        &self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_mode_default() {
        assert_eq!(FailureMode::default(), FailureMode::ContinueOnFailure);
    }

    #[test]
    fn test_failure_collector_fail_fast() {
        let mut collector = FailureCollector::new(FailureMode::FailFast);
        assert!(!collector.should_stop());
        collector.record_failure(FailureRecord::new("whole_register", "did not converge"));
        assert!(collector.should_stop());
        assert!(!collector.can_run(&["unrelated".to_string()]));
    }

    #[test]
    fn test_failure_collector_continue_on_failure() {
        let mut collector = FailureCollector::new(FailureMode::ContinueOnFailure);
        collector.record_failure(FailureRecord::new("a", "error"));
        collector.record_abort("b");

        assert!(!collector.should_stop());
        assert!(!collector.can_run(&["a".to_string()]));
        assert!(!collector.can_run(&["b".to_string()]));
        assert!(collector.can_run(&["c".to_string()]));
    }

    #[test]
    fn test_failure_summary() {
        let mut collector = FailureCollector::new(FailureMode::ContinueOnFailure);
        collector.record_completion("a");
        collector.record_completion("b");
        collector.record_failure(FailureRecord::new("c", "error").with_code(Some("X".into())));
        collector.record_abort("d");

        let summary = collector.summary(4);
        assert_eq!(summary.completed_stages, 2);
        assert_eq!(summary.failed_stages, 1);
        assert_eq!(summary.aborted_stages, 1);
        assert!((summary.success_rate() - 0.5).abs() < 1e-9);
        assert!(summary.has_failures());
        assert_eq!(collector.first_failure().unwrap().code.as_deref(), Some("X"));
    }
}
