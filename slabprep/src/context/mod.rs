//! Context management for pipeline execution.
//!
//! - A per-run pipeline context (run ID, scratch space, event sink)
//! - Per-stage contexts carrying strictly checked input ports

mod execution;
mod inputs;

pub use execution::{ExecutionContext, PipelineContext, StageContext};
pub use inputs::StageInputs;
