//! Execution contexts shared by the stage graph and its stages.

use super::StageInputs;
use crate::core::PipelineEvent;
use crate::errors::Result;
use crate::events::{EventSink, NoOpEventSink};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Behavior shared by pipeline and stage contexts.
pub trait ExecutionContext: Send + Sync {
    /// The pipeline run ID.
    fn run_id(&self) -> Uuid;

    /// Emits an event without blocking.
    fn try_emit_event(&self, event: &PipelineEvent);

    /// Checks if the run has been cancelled.
    fn is_cancelled(&self) -> bool;
}

/// Context for one pipeline run of a subject/session.
pub struct PipelineContext {
    run_id: Uuid,
    scratch_dir: PathBuf,
    event_sink: Arc<dyn EventSink>,
    cancelled: AtomicBool,
}

impl std::fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineContext")
            .field("run_id", &self.run_id)
            .field("scratch_dir", &self.scratch_dir)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl PipelineContext {
    /// Creates a context whose stages work below `scratch_dir`.
    #[must_use]
    pub fn new(scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_id: Uuid::now_v7(),
            scratch_dir: scratch_dir.into(),
            event_sink: Arc::new(NoOpEventSink),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// The event sink.
    #[must_use]
    pub fn event_sink(&self) -> &Arc<dyn EventSink> {
        &self.event_sink
    }

    /// Root of the per-stage working directories.
    #[must_use]
    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Working directory of a stage.
    #[must_use]
    pub fn workdir_for(&self, stage: &str) -> PathBuf {
        self.scratch_dir.join(stage)
    }

    /// Emits an event, awaiting the sink.
    pub async fn emit(&self, event: &PipelineEvent) {
        self.event_sink.emit(event).await;
    }

    /// Marks the run as cancelled.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

impl ExecutionContext for PipelineContext {
    fn run_id(&self) -> Uuid {
        self.run_id
    }

    fn try_emit_event(&self, event: &PipelineEvent) {
        self.event_sink.try_emit(event);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Context handed to a single stage execution.
#[derive(Debug, Clone)]
pub struct StageContext {
    pipeline: Arc<PipelineContext>,
    stage_name: String,
    inputs: StageInputs,
    workdir: PathBuf,
}

impl StageContext {
    /// Creates a stage context with its resolved inputs.
    #[must_use]
    pub fn new(pipeline: Arc<PipelineContext>, stage_name: impl Into<String>, inputs: StageInputs) -> Self {
        let stage_name = stage_name.into();
        let workdir = pipeline.workdir_for(&stage_name);
        Self {
            pipeline,
            stage_name,
            inputs,
            workdir,
        }
    }

    /// The stage name.
    #[must_use]
    pub fn stage_name(&self) -> &str {
        &self.stage_name
    }

    /// The resolved inputs.
    #[must_use]
    pub fn inputs(&self) -> &StageInputs {
        &self.inputs
    }

    /// The file bound to a declared input port.
    pub fn input(&self, port: &str) -> Result<&Path> {
        Ok(self.inputs.get(port)?)
    }

    /// The stage's working directory, created on first use.
    pub fn workdir(&self) -> Result<&Path> {
        std::fs::create_dir_all(&self.workdir)?;
        Ok(&self.workdir)
    }

    /// The owning pipeline context.
    #[must_use]
    pub fn pipeline(&self) -> &PipelineContext {
        &self.pipeline
    }
}

impl ExecutionContext for StageContext {
    fn run_id(&self) -> Uuid {
        self.pipeline.run_id()
    }

    fn try_emit_event(&self, event: &PipelineEvent) {
        self.pipeline.try_emit_event(event);
    }

    fn is_cancelled(&self) -> bool {
        self.pipeline.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageKind;
    use crate::events::CollectingEventSink;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[test]
    fn test_stage_context_workdir_and_events() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(CollectingEventSink::new());
        let pipeline = Arc::new(PipelineContext::new(dir.path()).with_event_sink(sink.clone()));
        let ctx = StageContext::new(pipeline.clone(), "boldref", StageInputs::new("boldref", BTreeMap::new()));

        let workdir = ctx.workdir().unwrap();
        assert_eq!(workdir, dir.path().join("boldref"));
        assert!(workdir.is_dir());

        ctx.try_emit_event(&PipelineEvent::stage_started("boldref", StageKind::Operator));
        assert_eq!(sink.len(), 1);
        assert_eq!(ctx.run_id(), pipeline.run_id());
        assert!(ctx.input("bold").is_err());
    }

    #[test]
    fn test_cancel_visible_from_stage() {
        let pipeline = Arc::new(PipelineContext::new("/tmp/scratch"));
        let ctx = StageContext::new(pipeline.clone(), "s", StageInputs::default());
        assert!(!ctx.is_cancelled());
        pipeline.cancel();
        assert!(ctx.is_cancelled());
    }
}
