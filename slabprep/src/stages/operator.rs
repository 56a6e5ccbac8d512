use super::Stage;
use crate::context::{ExecutionContext, StageContext};
use crate::core::{StageKind, StageOutput};
use crate::errors::{Result, SlabprepError};
use crate::operators::{ExternalOp, ExternalToolbox, OperatorInvocation};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Runs one opaque toolbox operation with every bound input.
#[derive(Debug, Clone)]
pub struct OperatorStage {
    op: ExternalOp,
    toolbox: Arc<dyn ExternalToolbox>,
    params: BTreeMap<String, serde_json::Value>,
}

impl OperatorStage {
    /// Creates a stage for `op`.
    #[must_use]
    pub fn new(op: ExternalOp, toolbox: Arc<dyn ExternalToolbox>) -> Self {
        Self {
            op,
            toolbox,
            params: BTreeMap::new(),
        }
    }

    /// Sets an operator parameter.
    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// The operation.
    #[must_use]
    pub const fn op(&self) -> ExternalOp {
        self.op
    }

    async fn run(&self, ctx: &StageContext) -> Result<BTreeMap<String, PathBuf>> {
        if ctx.is_cancelled() {
            return Err(SlabprepError::Internal(format!("{} not started: run cancelled", self.op)));
        }
        let mut invocation = OperatorInvocation::new(self.op, ctx.workdir()?);
        for (port, path) in ctx.inputs().bound() {
            invocation = invocation.with_input(port.clone(), path.clone());
        }
        for (name, value) in &self.params {
            invocation = invocation.with_param(name.clone(), value.clone());
        }
        debug!(
            run_id = %ctx.run_id(),
            stage = ctx.stage_name(),
            op = %self.op,
            id = %invocation.id,
            "invoking operator"
        );
        Ok(self.toolbox.run(&invocation).await?)
    }
}

#[async_trait]
impl Stage for OperatorStage {
    fn name(&self) -> &str {
        self.op.name()
    }

    fn kind(&self) -> StageKind {
        StageKind::Operator
    }

    fn outputs(&self) -> Vec<String> {
        self.op.output_ports()
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutput {
        self.run(ctx).await.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageStatus;
    use crate::errors::OperatorError;
    use crate::stages::test_support::stage_context;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    #[derive(Debug, Default)]
    struct RecordingToolbox {
        seen: Mutex<Vec<OperatorInvocation>>,
        fail: bool,
    }

    #[async_trait]
    impl ExternalToolbox for RecordingToolbox {
        async fn run(&self, invocation: &OperatorInvocation) -> std::result::Result<BTreeMap<String, PathBuf>, OperatorError> {
            self.seen.lock().push(invocation.clone());
            if self.fail {
                return Err(OperatorError::Failed {
                    operator: invocation.op.name().to_string(),
                    status: Some(1),
                    stderr: "boom".into(),
                });
            }
            Ok(invocation.expected_outputs())
        }
    }

    #[tokio::test]
    async fn test_operator_stage_passes_inputs_and_params() {
        let dir = TempDir::new().unwrap();
        let toolbox = Arc::new(RecordingToolbox::default());
        let stage = OperatorStage::new(ExternalOp::MotionCorrection, toolbox.clone()).with_param("cost", "normcorr");
        let ctx = stage_context(
            dir.path(),
            "hmc",
            &[("bold", PathBuf::from("/d/bold.nii.gz")), ("reference", PathBuf::from("/d/ref.nii.gz"))],
        );

        let output = stage.execute(&ctx).await;

        assert_eq!(output.status, StageStatus::Ok);
        assert_eq!(output.artifact("mats"), Some(dir.path().join("hmc/mats").as_path()));
        let seen = toolbox.seen.lock();
        assert_eq!(seen[0].inputs.len(), 2);
        assert_eq!(seen[0].params["cost"], serde_json::json!("normcorr"));
        assert_eq!(stage.outputs(), vec!["mats".to_string(), "movpar".to_string()]);
    }

    #[tokio::test]
    async fn test_operator_failure_becomes_stage_failure() {
        let dir = TempDir::new().unwrap();
        let toolbox = Arc::new(RecordingToolbox {
            fail: true,
            ..RecordingToolbox::default()
        });
        let stage = OperatorStage::new(ExternalOp::Boldref, toolbox);
        let output = stage.execute(&stage_context(dir.path(), "boldref", &[])).await;
        assert_eq!(output.status, StageStatus::Fail);
        assert!(output.error.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_cancelled_run_skips_operator() {
        let dir = TempDir::new().unwrap();
        let toolbox = Arc::new(RecordingToolbox::default());
        let stage = OperatorStage::new(ExternalOp::Boldref, toolbox.clone());
        let ctx = stage_context(dir.path(), "boldref", &[]);
        ctx.pipeline().cancel();

        let output = stage.execute(&ctx).await;

        assert_eq!(output.status, StageStatus::Fail);
        assert!(toolbox.seen.lock().is_empty());
    }
}
