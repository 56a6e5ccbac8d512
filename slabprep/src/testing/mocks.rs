//! Mock stages and instrumented stub operators.

use async_trait::async_trait;
use nalgebra::{Matrix4, Vector3};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::context::StageContext;
use crate::core::{StageKind, StageOutput};
use crate::errors::{OperatorError, Result};
use crate::io::{
    motion_matrix_path, read_geometry, read_series, read_volume, write_fsl_mat, write_volume, write_warp, Volume,
};
use crate::operators::{
    ExternalOp, ExternalToolbox, OperatorInvocation, RegistrationOperator, RegistrationOutput, RegistrationRequest,
};
use crate::resample::{Interpolation, KernelResampler, VolumeResampler};
use crate::spatial::{ImageGeometry, WarpField};
use crate::stages::Stage;

#[derive(Debug, Default)]
struct MockState {
    executions: usize,
    seen_inputs: Vec<BTreeMap<String, PathBuf>>,
}

/// A stage that writes a placeholder file per declared output port and
/// records what it was called with. Clones share their records.
#[derive(Debug, Clone)]
pub struct MockStage {
    ports: Vec<String>,
    failure: Option<String>,
    delay: Option<Duration>,
    write_outputs: bool,
    state: Arc<Mutex<MockState>>,
}

impl MockStage {
    /// A stage producing the given output ports.
    #[must_use]
    pub fn new(ports: &[&str]) -> Self {
        Self {
            ports: ports.iter().map(|p| (*p).to_string()).collect(),
            failure: None,
            delay: None,
            write_outputs: true,
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// A stage that fails with `message`.
    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        let mut stage = Self::new(&["out"]);
        stage.failure = Some(message.into());
        stage
    }

    /// Sleeps before finishing.
    #[must_use]
    pub const fn with_delay_ms(mut self, ms: u64) -> Self {
        self.delay = Some(Duration::from_millis(ms));
        self
    }

    /// Reports its outputs without creating them.
    #[must_use]
    pub const fn without_writing(mut self) -> Self {
        self.write_outputs = false;
        self
    }

    /// Number of times the stage ran.
    #[must_use]
    pub fn executions(&self) -> usize {
        self.state.lock().executions
    }

    /// Inputs of every execution, in call order.
    #[must_use]
    pub fn seen_inputs(&self) -> Vec<BTreeMap<String, PathBuf>> {
        self.state.lock().seen_inputs.clone()
    }

    fn write(&self, ctx: &StageContext) -> Result<BTreeMap<String, PathBuf>> {
        let workdir = ctx.workdir()?;
        let mut artifacts = BTreeMap::new();
        for port in &self.ports {
            let path = workdir.join(port);
            if self.write_outputs {
                std::fs::write(&path, port.as_bytes())?;
            }
            artifacts.insert(port.clone(), path);
        }
        Ok(artifacts)
    }
}

#[async_trait]
impl Stage for MockStage {
    fn name(&self) -> &str {
        "mock"
    }

    fn kind(&self) -> StageKind {
        StageKind::Operator
    }

    fn outputs(&self) -> Vec<String> {
        self.ports.clone()
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutput {
        {
            let mut state = self.state.lock();
            state.executions += 1;
            state.seen_inputs.push(ctx.inputs().bound().clone());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.failure {
            return StageOutput::fail(message.clone());
        }
        self.write(ctx).into()
    }
}

/// A registration operator that writes a configured FSL matrix and counts calls.
#[derive(Debug, Clone)]
pub struct StubRegistration {
    matrix: Matrix4<f64>,
    calls: Arc<AtomicUsize>,
}

impl StubRegistration {
    /// Always returns the identity matrix.
    #[must_use]
    pub fn identity() -> Self {
        Self::with_matrix(Matrix4::identity())
    }

    /// Always returns `matrix`.
    #[must_use]
    pub fn with_matrix(matrix: Matrix4<f64>) -> Self {
        Self {
            matrix,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of registrations run.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RegistrationOperator for StubRegistration {
    async fn register(&self, request: &RegistrationRequest) -> Result<RegistrationOutput, OperatorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failed = |e: crate::errors::SlabprepError| OperatorError::failed("registration", e.to_string());
        let forward_mat = request.workdir.join("forward.mat");
        write_fsl_mat(&forward_mat, &self.matrix).map_err(failed)?;
        let report = request.workdir.join("report.svg");
        std::fs::write(&report, "<svg/>").map_err(|e| OperatorError::failed("registration", e.to_string()))?;
        Ok(RegistrationOutput { forward_mat, report })
    }
}

/// A toolbox that fabricates plausible outputs for every operation.
///
/// Image outputs are copies of the primary input (first volume for 3-D
/// outputs), motion correction writes identity matrices, and distortion
/// estimation writes a zero field.
#[derive(Debug, Clone, Default)]
pub struct StubToolbox {
    calls: Arc<Mutex<BTreeMap<String, usize>>>,
    failing: Option<ExternalOp>,
}

impl StubToolbox {
    /// A toolbox where every operation succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A toolbox where `op` always fails.
    #[must_use]
    pub fn failing_on(op: ExternalOp) -> Self {
        Self {
            failing: Some(op),
            ..Self::default()
        }
    }

    /// Number of invocations of `op`.
    #[must_use]
    pub fn calls(&self, op: ExternalOp) -> usize {
        self.calls.lock().get(op.name()).copied().unwrap_or(0)
    }

    /// Total number of invocations.
    #[must_use]
    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }

    fn fabricate(invocation: &OperatorInvocation) -> Result<()> {
        let primary = invocation.primary_input().cloned();
        for (port, path) in invocation.expected_outputs() {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string();
            match (invocation.op, port.as_str()) {
                (ExternalOp::MotionCorrection, "mats") => {
                    let source = require(primary.as_deref())?;
                    let volumes = read_series(source, Some(1.0))?.len();
                    for index in 0..volumes {
                        write_fsl_mat(&motion_matrix_path(&path, index), &Matrix4::identity())?;
                    }
                }
                (ExternalOp::SdcEstimate, "warp") => {
                    let geometry = read_geometry(require(primary.as_deref())?)?;
                    write_warp(&path, &zero_field(geometry)?)?;
                }
                (ExternalOp::SliceTiming, _) => {
                    std::fs::copy(require(primary.as_deref())?, &path)?;
                }
                _ if name.ends_with(".nii.gz") => {
                    let volume = read_volume(require(primary.as_deref())?)?;
                    write_volume(&path, &volume)?;
                }
                _ => {
                    std::fs::write(&path, format!("{} {port}\n", invocation.op))?;
                }
            }
        }
        Ok(())
    }
}

fn require(path: Option<&Path>) -> Result<&Path> {
    path.ok_or_else(|| crate::errors::SlabprepError::Internal("stub operation without input".into()))
}

fn zero_field(geometry: ImageGeometry) -> Result<WarpField> {
    WarpField::constant(geometry, Vector3::zeros())
}

#[async_trait]
impl ExternalToolbox for StubToolbox {
    async fn run(&self, invocation: &OperatorInvocation) -> Result<BTreeMap<String, PathBuf>, OperatorError> {
        *self.calls.lock().entry(invocation.op.name().to_string()).or_insert(0) += 1;
        if self.failing == Some(invocation.op) {
            return Err(OperatorError::failed(invocation.op.name(), "stub failure"));
        }
        std::fs::create_dir_all(&invocation.workdir)
            .map_err(|e| OperatorError::failed(invocation.op.name(), e.to_string()))?;
        Self::fabricate(invocation).map_err(|e| OperatorError::failed(invocation.op.name(), e.to_string()))?;
        invocation.collect_outputs()
    }
}

/// Kernel resampler that counts how many volumes it interpolated.
#[derive(Debug, Default)]
pub struct CountingResampler {
    calls: AtomicUsize,
}

impl CountingResampler {
    /// A fresh counter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of volumes resampled.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl VolumeResampler for CountingResampler {
    fn resample(
        &self,
        source: &Volume,
        positions: &[nalgebra::Point3<f64>],
        grid: &ImageGeometry,
        interpolation: Interpolation,
    ) -> Result<Volume> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        KernelResampler.resample(source, positions, grid, interpolation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{list_motion_matrices, write_series, TimeSeries};
    use ndarray::Array3;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_stub_toolbox_writes_one_matrix_per_volume() {
        let dir = TempDir::new().unwrap();
        let geometry = ImageGeometry::axis_aligned([4, 4, 2], [2.0, 2.0, 2.0], [0.0, 0.0, 0.0]);
        let bold = dir.path().join("bold.nii.gz");
        let series = TimeSeries {
            geometry,
            volumes: vec![Array3::zeros((4, 4, 2)); 3],
            repetition_time: 2.0,
        };
        write_series(&bold, &series).unwrap();

        let toolbox = StubToolbox::new();
        let invocation = OperatorInvocation::new(ExternalOp::MotionCorrection, dir.path().join("hmc"))
            .with_input("bold", &bold)
            .with_input("reference", &bold);
        let outputs = toolbox.run(&invocation).await.unwrap();

        assert_eq!(list_motion_matrices(&outputs["mats"]).unwrap().len(), 3);
        assert_eq!(toolbox.calls(ExternalOp::MotionCorrection), 1);
    }

    #[tokio::test]
    async fn test_stub_toolbox_failure_is_operator_error() {
        let dir = TempDir::new().unwrap();
        let toolbox = StubToolbox::failing_on(ExternalOp::Boldref);
        let invocation = OperatorInvocation::new(ExternalOp::Boldref, dir.path());
        assert!(matches!(toolbox.run(&invocation).await, Err(OperatorError::Failed { .. })));
    }
}
