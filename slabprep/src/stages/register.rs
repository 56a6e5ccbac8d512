use super::Stage;
use crate::context::StageContext;
use crate::core::{StageKind, StageOutput};
use crate::errors::Result;
use crate::operators::{RegistrationOperator, RegistrationRequest};
use crate::registration::{register_link, RegistrationLink};
use crate::spatial::ReferenceFrame;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Input port of the moving image.
pub const MOVING_PORT: &str = "moving";
/// Input port of the fixed image.
pub const FIXED_PORT: &str = "fixed";
/// Optional input port of the fixed image's tissue segmentation.
pub const SEGMENTATION_PORT: &str = "segmentation";

/// Registers one frame-graph link.
///
/// Outputs the forward and inverse transforms in FSL and ITK form plus the
/// operator's report.
#[derive(Clone)]
pub struct RegisterStage {
    source: ReferenceFrame,
    target: ReferenceFrame,
    dof: u8,
    bbr: bool,
    operator: Arc<dyn RegistrationOperator>,
}

impl std::fmt::Debug for RegisterStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisterStage")
            .field("source", &self.source)
            .field("target", &self.target)
            .field("dof", &self.dof)
            .field("bbr", &self.bbr)
            .finish_non_exhaustive()
    }
}

impl RegisterStage {
    /// Creates a registration of `source` onto `target`.
    #[must_use]
    pub fn new(
        source: ReferenceFrame,
        target: ReferenceFrame,
        dof: u8,
        bbr: bool,
        operator: Arc<dyn RegistrationOperator>,
    ) -> Self {
        Self {
            source,
            target,
            dof,
            bbr,
            operator,
        }
    }

    async fn run(&self, ctx: &StageContext) -> Result<BTreeMap<String, PathBuf>> {
        let link = RegistrationLink {
            source: self.source.clone(),
            target: self.target.clone(),
            request: RegistrationRequest {
                moving: ctx.input(MOVING_PORT)?.to_path_buf(),
                fixed: ctx.input(FIXED_PORT)?.to_path_buf(),
                segmentation: ctx.inputs().optional(SEGMENTATION_PORT).map(PathBuf::from),
                dof: self.dof,
                bbr: self.bbr,
                workdir: ctx.workdir()?.to_path_buf(),
            },
        };
        let registered = register_link(self.operator.as_ref(), &link).await?;
        Ok(registered.files.outputs())
    }
}

#[async_trait]
impl Stage for RegisterStage {
    fn name(&self) -> &str {
        "register"
    }

    fn kind(&self) -> StageKind {
        StageKind::Register
    }

    fn outputs(&self) -> Vec<String> {
        ["forward_mat", "inverse_mat", "forward_itk", "inverse_itk", "report"]
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutput {
        self.run(ctx).await.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageStatus;
    use crate::io::{format_fsl_mat, write_volume, Volume};
    use crate::operators::{MockRegistrationOperator, RegistrationOutput};
    use crate::spatial::{DistortionState, ImageGeometry};
    use crate::stages::test_support::stage_context;
    use nalgebra::Matrix4;
    use ndarray::Array3;
    use tempfile::TempDir;

    fn image(dir: &TempDir, name: &str) -> PathBuf {
        let geometry = ImageGeometry::axis_aligned([4, 4, 4], [2.0, 2.0, 2.0], [0.0, 0.0, 0.0]);
        let path = dir.path().join(name);
        write_volume(&path, &Volume { geometry, data: Array3::zeros((4, 4, 4)) }).unwrap();
        path
    }

    fn stage(operator: MockRegistrationOperator, bbr: bool) -> RegisterStage {
        RegisterStage::new(
            ReferenceFrame::WholeVolume(DistortionState::Distorted),
            ReferenceFrame::Anatomical,
            9,
            bbr,
            Arc::new(operator),
        )
    }

    #[tokio::test]
    async fn test_register_stage_outputs_every_declared_port() {
        let dir = TempDir::new().unwrap();
        let mut mock = MockRegistrationOperator::new();
        mock.expect_register().times(1).returning(|req| {
            std::fs::create_dir_all(&req.workdir).unwrap();
            let forward_mat = req.workdir.join("forward.mat");
            let report = req.workdir.join("report.svg");
            std::fs::write(&forward_mat, format_fsl_mat(&Matrix4::identity())).unwrap();
            std::fs::write(&report, "<svg/>").unwrap();
            Ok(RegistrationOutput { forward_mat, report })
        });
        let stage = stage(mock, false);
        let ctx = stage_context(
            dir.path(),
            "whole_register",
            &[(MOVING_PORT, image(&dir, "boldref.nii.gz")), (FIXED_PORT, image(&dir, "t1w.nii.gz"))],
        );

        let output = stage.execute(&ctx).await;

        assert_eq!(output.status, StageStatus::Ok);
        for port in stage.outputs() {
            assert!(output.artifact(&port).unwrap().exists(), "{port} missing");
        }
    }

    #[tokio::test]
    async fn test_bbr_without_segmentation_port_fails() {
        let dir = TempDir::new().unwrap();
        let mut mock = MockRegistrationOperator::new();
        mock.expect_register().times(0);
        let ctx = stage_context(
            dir.path(),
            "whole_register",
            &[(MOVING_PORT, image(&dir, "boldref.nii.gz")), (FIXED_PORT, image(&dir, "t1w.nii.gz"))],
        );
        let output = stage(mock, true).execute(&ctx).await;
        assert_eq!(output.status, StageStatus::Fail);
    }
}
