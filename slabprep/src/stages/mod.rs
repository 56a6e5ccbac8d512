//! Stage trait and the stage runners the planner builds.
//!
//! A stage reads files from its declared input ports and returns the files it
//! produced keyed by output port. Blocking numerical work runs on the blocking
//! pool so the executor keeps scheduling independent branches.

mod compose;
mod operator;
mod register;
mod resample;
mod write;

pub use compose::{ComposeStage, SOURCE_REF_PORT, TARGET_REF_PORT, WARP_PORT};
pub use operator::OperatorStage;
pub use register::{RegisterStage, FIXED_PORT, MOVING_PORT, SEGMENTATION_PORT};
pub use resample::{ResampleMode, ResampleStage, TruncateStage, IMAGE_PORT, MOTION_PORT, RESAMPLED_PORT};
pub use write::WriteDerivativesStage;

use crate::context::StageContext;
use crate::core::{StageKind, StageOutput};
use crate::errors::{Result, SlabprepError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::PathBuf;

/// Trait for pipeline stages.
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// A short label for the kind of work (e.g. the operator name).
    fn name(&self) -> &str;

    /// The kind of the stage.
    fn kind(&self) -> StageKind;

    /// Output ports the stage promises on success.
    fn outputs(&self) -> Vec<String>;

    /// Executes the stage.
    async fn execute(&self, ctx: &StageContext) -> StageOutput;
}

/// Runs a blocking closure on the blocking pool.
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SlabprepError::Internal(format!("blocking task failed: {e}")))?
}

/// A single-entry artifact map.
pub(crate) fn single(port: &str, path: PathBuf) -> BTreeMap<String, PathBuf> {
    BTreeMap::from([(port.to_string(), path)])
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::context::{PipelineContext, StageContext, StageInputs};
    use std::collections::BTreeMap;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    /// A stage context with the given bindings, working below `scratch`.
    pub fn stage_context(scratch: &Path, stage: &str, bound: &[(&str, PathBuf)]) -> StageContext {
        let pipeline = Arc::new(PipelineContext::new(scratch));
        let bound: BTreeMap<String, PathBuf> = bound.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect();
        StageContext::new(pipeline, stage, StageInputs::new(stage, bound))
    }
}
