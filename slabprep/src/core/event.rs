//! Lifecycle events emitted while the stage graph runs.

use super::StageKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// An event emitted during pipeline execution.
///
/// Events are consumed by event sinks for logging and for assertions in tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    /// The event type (e.g., "stage.started", "stage.aborted").
    #[serde(rename = "type")]
    pub event_type: String,

    /// When the event occurred.
    pub timestamp: DateTime<Utc>,

    /// The event payload.
    #[serde(default)]
    pub data: serde_json::Value,
}

impl PipelineEvent {
    /// Creates an event with the given payload.
    #[must_use]
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: Utc::now(),
            data,
        }
    }

    /// The stage the event concerns, if any.
    #[must_use]
    pub fn stage(&self) -> Option<&str> {
        self.data.get("stage").and_then(serde_json::Value::as_str)
    }

    /// Creates a "stage.started" event.
    #[must_use]
    pub fn stage_started(stage: &str, kind: StageKind) -> Self {
        Self::new("stage.started", json!({"stage": stage, "kind": kind}))
    }

    /// Creates a "stage.completed" event.
    #[must_use]
    pub fn stage_completed(stage: &str, duration_ms: f64) -> Self {
        Self::new("stage.completed", json!({"stage": stage, "duration_ms": duration_ms}))
    }

    /// Creates a "stage.skipped" event.
    #[must_use]
    pub fn stage_skipped(stage: &str, reason: &str) -> Self {
        Self::new("stage.skipped", json!({"stage": stage, "reason": reason}))
    }

    /// Creates a "stage.failed" event.
    #[must_use]
    pub fn stage_failed(stage: &str, error: &str, code: Option<&str>) -> Self {
        Self::new("stage.failed", json!({"stage": stage, "error": error, "code": code}))
    }

    /// Creates a "stage.aborted" event for a stage whose dependency failed.
    #[must_use]
    pub fn stage_aborted(stage: &str, failed_dependency: &str) -> Self {
        Self::new(
            "stage.aborted",
            json!({"stage": stage, "failed_dependency": failed_dependency}),
        )
    }

    /// Creates a "pipeline.completed" event.
    #[must_use]
    pub fn pipeline_completed(success: bool, stages: usize, failed: usize, duration_ms: f64) -> Self {
        Self::new(
            "pipeline.completed",
            json!({"success": success, "stages": stages, "failed": failed, "duration_ms": duration_ms}),
        )
    }
}
