//! Error types for slabprep.
//!
//! Every failure in the pipeline is fatal for the subtree that depends on it.
//! Nothing here is retryable: errors surface immediately and are never
//! recovered into partial results.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for slabprep operations.
#[derive(Debug, Error)]
pub enum SlabprepError {
    /// Wrong run cardinality, unresolved phase-encoding vote, inconsistent toggles.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),

    /// Required acquisition metadata absent for a selected run.
    #[error("{0}")]
    Metadata(#[from] MetadataError),

    /// A checkpoint claims completion but an expected artifact is absent.
    #[error("{0}")]
    Resumability(#[from] ResumabilityError),

    /// An external operator failed or did not converge.
    #[error("{0}")]
    Operator(#[from] OperatorError),

    /// The stage graph is malformed.
    #[error("{0}")]
    Validation(#[from] PipelineValidationError),

    /// A cycle was detected in the stage graph.
    #[error("{0}")]
    CycleDetected(#[from] CycleDetectedError),

    /// A stage read an input port it never declared.
    #[error("{0}")]
    UndeclaredInput(#[from] UndeclaredInputError),

    /// Adjacent transforms in a chain disagree on their shared frame.
    #[error("{0}")]
    FrameMismatch(#[from] FrameMismatchError),

    /// A per-volume motion affine is missing.
    #[error("{0}")]
    MissingMotion(#[from] MissingMotionError),

    /// An acquisition or format variant the pipeline does not handle.
    #[error("Unsupported variant: {0}")]
    UnsupportedVariant(String),

    /// A numerical operation could not be carried out (singular matrix, bad shape).
    #[error("Numerical error: {0}")]
    Numerical(String),

    /// NIfTI decoding or encoding failed.
    #[error("NIfTI error: {0}")]
    Nifti(#[from] nifti::NiftiError),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SlabprepError {
    /// Returns the diagnostic code when the error carries one.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Configuration(e) => Some(e.error_info.code.as_str()),
            Self::Metadata(_) => Some("METADATA-001-MISSING"),
            Self::Resumability(_) => Some("RESUME-001-MISSING_ARTIFACT"),
            Self::Validation(e) => e.error_info.as_ref().map(|i| i.code.as_str()),
            Self::CycleDetected(e) => Some(e.error_info.code.as_str()),
            Self::FrameMismatch(_) => Some("COMPOSE-001-FRAME_MISMATCH"),
            Self::MissingMotion(_) => Some("RESAMPLE-001-MISSING_MOTION"),
            _ => None,
        }
    }

    /// Every error terminates the subject/session run.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        true
    }

    /// No error is retried automatically.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        false
    }

    /// Short category label used in failure records.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Metadata(_) => "metadata",
            Self::Resumability(_) => "resumability",
            Self::Operator(_) => "operator",
            Self::Validation(_) | Self::CycleDetected(_) | Self::UndeclaredInput(_) => "graph",
            Self::FrameMismatch(_) => "compose",
            Self::MissingMotion(_) => "resample",
            Self::UnsupportedVariant(_) => "unsupported",
            Self::Numerical(_) => "numerical",
            Self::Nifti(_) | Self::Serialization(_) | Self::Io(_) => "io",
            Self::Internal(_) => "internal",
        }
    }
}

/// Diagnostic record attached to configuration and graph errors.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ErrorInfo {
    /// Error code (e.g., "GRAPH-002-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

impl ErrorInfo {
    /// Creates a new error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: BTreeMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Fatal configuration error raised before any stage is built.
#[derive(Debug, Clone, Error)]
#[error("Configuration error: {message}")]
pub struct ConfigurationError {
    /// The error message.
    pub message: String,
    /// Diagnostic info.
    pub error_info: ErrorInfo,
}

impl ConfigurationError {
    /// Wrong number of runs of some class.
    #[must_use]
    pub fn cardinality(class: &str, expected: &str, found: usize) -> Self {
        let message = format!("expected {expected} {class} run(s), found {found}");
        Self {
            error_info: ErrorInfo::new("CONFIG-001-CARDINALITY", message.clone())
                .with_fix_hint("Check the dataset: the subject/session must contain exactly one run of this class.")
                .with_context_entry("class", class)
                .with_context_entry("found", found.to_string()),
            message,
        }
    }

    /// The phase-encoding majority vote did not resolve to a candidate.
    #[must_use]
    pub fn phase_encoding(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            error_info: ErrorInfo::new("CONFIG-002-PHASE_ENCODING", message.clone())
                .with_fix_hint("Remove ambiguous whole-volume runs or acquire slabs with a consistent phase-encoding direction."),
            message,
        }
    }

    /// Mutually inconsistent options.
    #[must_use]
    pub fn inconsistent(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            error_info: ErrorInfo::new("CONFIG-003-INCONSISTENT", message.clone()),
            message,
        }
    }
}

/// Required metadata field absent for a run.
#[derive(Debug, Clone, Error)]
#[error("Metadata error: run '{run}' is missing required field '{field}'")]
pub struct MetadataError {
    /// Run filename.
    pub run: String,
    /// The absent field.
    pub field: String,
}

impl MetadataError {
    /// Creates a new metadata error.
    #[must_use]
    pub fn new(run: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            run: run.into(),
            field: field.into(),
        }
    }
}

/// A checkpoint is complete by its marker but some artifacts are absent.
#[derive(Debug, Clone, Error)]
#[error("Resumability inconsistency in checkpoint '{checkpoint}': missing {missing:?}")]
pub struct ResumabilityError {
    /// The checkpoint name.
    pub checkpoint: String,
    /// Artifacts that should exist but do not.
    pub missing: Vec<PathBuf>,
}

impl ResumabilityError {
    /// Creates a new resumability error.
    #[must_use]
    pub fn new(checkpoint: impl Into<String>, missing: Vec<PathBuf>) -> Self {
        Self {
            checkpoint: checkpoint.into(),
            missing,
        }
    }
}

/// Errors raised by external operators.
#[derive(Debug, Clone, Error)]
pub enum OperatorError {
    /// The operator process exited unsuccessfully.
    #[error("Operator '{operator}' failed (exit {status:?}): {stderr}")]
    Failed {
        /// Operator name.
        operator: String,
        /// Exit code, if any.
        status: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },

    /// The operator finished without a usable result.
    #[error("Operator '{operator}' did not converge: {reason}")]
    NonConvergence {
        /// Operator name.
        operator: String,
        /// What was wrong with the result.
        reason: String,
    },

    /// The operator did not produce a declared output.
    #[error("Operator '{operator}' did not produce output '{port}' at {path}")]
    MissingOutput {
        /// Operator name.
        operator: String,
        /// Output port.
        port: String,
        /// Expected path.
        path: PathBuf,
    },

    /// The operator was invoked with an invalid request.
    #[error("Operator '{operator}' rejected request: {reason}")]
    InvalidRequest {
        /// Operator name.
        operator: String,
        /// Why the request is invalid.
        reason: String,
    },

    /// No command template is configured for the operator.
    #[error("No command template configured for operator '{operator}'")]
    NotConfigured {
        /// Operator name.
        operator: String,
    },
}

impl OperatorError {
    /// Creates a failure without an exit status.
    #[must_use]
    pub fn failed(operator: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::Failed {
            operator: operator.into(),
            status: None,
            stderr: stderr.into(),
        }
    }

    /// Creates a non-convergence error.
    #[must_use]
    pub fn non_convergence(operator: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NonConvergence {
            operator: operator.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid request error.
    #[must_use]
    pub fn invalid_request(operator: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            operator: operator.into(),
            reason: reason.into(),
        }
    }
}

/// Error raised when the stage graph fails validation.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PipelineValidationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
    /// Optional diagnostic info.
    pub error_info: Option<ErrorInfo>,
}

impl PipelineValidationError {
    /// Creates a new pipeline validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Sets the diagnostic info.
    #[must_use]
    pub fn with_error_info(mut self, info: ErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }
}

/// Error raised when a cycle is detected in the stage graph.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected in pipeline: {}", cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The path of stages forming the cycle.
    pub cycle_path: Vec<String>,
    /// Diagnostic info.
    pub error_info: ErrorInfo,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        let info = ErrorInfo::new(
            "GRAPH-002-CYCLE",
            format!("Pipeline contains a dependency cycle: {}", cycle_path.join(" -> ")),
        )
        .with_fix_hint("Remove one of the bindings in the cycle to break it.");

        Self {
            cycle_path,
            error_info: info,
        }
    }
}

impl From<CycleDetectedError> for PipelineValidationError {
    fn from(err: CycleDetectedError) -> Self {
        Self {
            message: err.to_string(),
            stages: err.cycle_path.clone(),
            error_info: Some(err.error_info),
        }
    }
}

/// Error raised when a stage reads an input port it did not declare.
#[derive(Debug, Clone, Error)]
#[error("Undeclared input: stage '{stage}' attempted to read port '{port}' which was not bound")]
pub struct UndeclaredInputError {
    /// The stage attempting access.
    pub stage: String,
    /// The undeclared port.
    pub port: String,
}

impl UndeclaredInputError {
    /// Creates a new undeclared input error.
    #[must_use]
    pub fn new(stage: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            port: port.into(),
        }
    }
}

/// Error raised when two chained transforms disagree on the frame between them.
#[derive(Debug, Clone, Error)]
#[error("Frame mismatch at link {index}: previous link ends in '{expected}' but next link starts in '{found}'")]
pub struct FrameMismatchError {
    /// Index of the offending link in the chain.
    pub index: usize,
    /// Frame the chain currently ends in.
    pub expected: String,
    /// Source frame of the rejected link.
    pub found: String,
}

/// Error raised when a volume has no motion-correction affine.
#[derive(Debug, Clone, Error)]
#[error("Missing motion-correction affine for volume {index} of {volumes}")]
pub struct MissingMotionError {
    /// Zero-based volume index.
    pub index: usize,
    /// Number of volumes in the run.
    pub volumes: usize,
}

/// Convenience alias.
pub type Result<T, E = SlabprepError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_error_converts_to_validation() {
        let err = CycleDetectedError::new(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(err.to_string(), "Cycle detected in pipeline: a -> b -> a");

        let validation: PipelineValidationError = err.into();
        assert_eq!(validation.stages.len(), 3);
        assert_eq!(validation.error_info.map(|i| i.code).as_deref(), Some("GRAPH-002-CYCLE"));
    }

    #[test]
    fn test_configuration_error_codes() {
        let err: SlabprepError = ConfigurationError::cardinality("structural", "exactly one", 2).into();
        assert_eq!(err.code(), Some("CONFIG-001-CARDINALITY"));
        assert_eq!(err.category(), "configuration");
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_missing_motion_message_names_index() {
        let err = MissingMotionError { index: 7, volumes: 10 };
        assert!(err.to_string().contains("volume 7"));
    }
}
