//! Subscriber setup and per-stage span bookkeeping.

use crate::core::{StageKind, StageStatus};
use crate::errors::{Result, SlabprepError};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

/// Installs the global `tracing` subscriber.
///
/// `RUST_LOG` wins over `verbose`; `json` switches to JSON lines.
pub fn init_tracing(verbose: bool, json: bool) -> Result<()> {
    let default = if verbose { "slabprep=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| SlabprepError::Internal(format!("cannot install tracing subscriber: {e}")))
}

/// Attributes recorded when a stage finishes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageSpanAttributes {
    /// Stage name.
    pub stage_name: String,
    /// Stage kind.
    pub stage_kind: StageKind,
    /// Final status.
    pub status: StageStatus,
    /// Duration in milliseconds.
    pub duration_ms: f64,
    /// Error message if failed.
    pub error: Option<String>,
    /// Output ports produced.
    pub ports: Vec<String>,
}

impl StageSpanAttributes {
    /// Creates attributes for a stage.
    #[must_use]
    pub fn new(stage_name: impl Into<String>, stage_kind: StageKind) -> Self {
        Self {
            stage_name: stage_name.into(),
            stage_kind,
            ..Self::default()
        }
    }

    /// Sets the final status.
    #[must_use]
    pub fn with_status(mut self, status: StageStatus) -> Self {
        self.status = status;
        self
    }

    /// Sets the duration.
    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: f64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Sets the error.
    #[must_use]
    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.error = error;
        self
    }

    /// Sets the produced ports.
    #[must_use]
    pub fn with_ports(mut self, ports: Vec<String>) -> Self {
        self.ports = ports;
        self
    }

    /// Logs the attributes at a level matching the status.
    pub fn record(&self) {
        if self.status.is_failure() {
            tracing::error!(
                stage = %self.stage_name,
                kind = %self.stage_kind,
                status = %self.status,
                duration_ms = self.duration_ms,
                error = self.error.as_deref().unwrap_or(""),
                "stage finished"
            );
        } else {
            tracing::info!(
                stage = %self.stage_name,
                kind = %self.stage_kind,
                status = %self.status,
                duration_ms = self.duration_ms,
                ports = %self.ports.join(","),
                "stage finished"
            );
        }
    }
}

/// Simple span timing helper.
#[derive(Debug)]
pub struct SpanTimer {
    start: Instant,
    name: String,
}

impl SpanTimer {
    /// Starts a new span timer.
    #[must_use]
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            name: name.into(),
        }
    }

    /// Returns the elapsed time in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    /// Returns the span name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Finishes the span and returns the duration.
    #[must_use]
    pub fn finish(self) -> f64 {
        self.elapsed_ms()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_timer() {
        let timer = SpanTimer::start("compose");
        assert_eq!(timer.name(), "compose");
        assert!(timer.finish() >= 0.0);
    }

    #[test]
    fn test_stage_span_attributes() {
        let attrs = StageSpanAttributes::new("slab_resample", StageKind::Resample)
            .with_status(StageStatus::Fail)
            .with_duration_ms(12.5)
            .with_error(Some("missing motion".into()));
        attrs.record();
        assert_eq!(attrs.status, StageStatus::Fail);
        assert_eq!(attrs.error.as_deref(), Some("missing motion"));
    }
}
