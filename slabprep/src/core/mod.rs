//! Core domain model types for the stage graph.
//!
//! - Stage status and kind enums
//! - Port-keyed stage outputs
//! - Lifecycle events

mod event;
mod output;
mod status;

pub use event::PipelineEvent;
pub use output::StageOutput;
pub use status::{StageKind, StageStatus};
