use super::{run_blocking, Stage};
use crate::compose::{ComposedTransform, LinkBinding, LinkFiles};
use crate::context::StageContext;
use crate::core::{StageKind, StageOutput};
use crate::errors::Result;
use crate::io::{read_geometry, write_warp};
use crate::spatial::PlannedLink;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Input port of an image on the chain's native grid.
pub const SOURCE_REF_PORT: &str = "source_ref";
/// Input port of an image in the chain's target frame.
pub const TARGET_REF_PORT: &str = "target_ref";
/// Output port of the composed pull field.
pub const WARP_PORT: &str = "warp";

/// Composes a planned chain into one pull field on the output grid.
#[derive(Debug, Clone)]
pub struct ComposeStage {
    links: Vec<(PlannedLink, bool)>,
    regrid: bool,
}

impl ComposeStage {
    /// Creates a composition of `links`, each applied forward or (`true`) inverted.
    #[must_use]
    pub fn new(links: Vec<(PlannedLink, bool)>) -> Self {
        Self { links, regrid: false }
    }

    /// Sample at native resolution, cropped to the native field of view.
    #[must_use]
    pub const fn with_regrid(mut self, regrid: bool) -> Self {
        self.regrid = regrid;
        self
    }

    /// Input ports a link at `index` is read from.
    #[must_use]
    pub fn link_ports(index: usize, link: &PlannedLink) -> Vec<String> {
        match link {
            PlannedLink::Distortion { .. } => vec![format!("link{index}_warp")],
            PlannedLink::Registration { .. } => vec![
                format!("link{index}_mat"),
                format!("link{index}_moving"),
                format!("link{index}_fixed"),
            ],
        }
    }

    /// Every input port the stage reads.
    #[must_use]
    pub fn input_ports(&self) -> Vec<String> {
        let mut ports: Vec<String> = self
            .links
            .iter()
            .enumerate()
            .flat_map(|(i, (link, _))| Self::link_ports(i, link))
            .collect();
        ports.push(SOURCE_REF_PORT.to_string());
        ports.push(TARGET_REF_PORT.to_string());
        ports
    }

    fn bindings(&self, ctx: &StageContext) -> Result<Vec<LinkBinding>> {
        self.links
            .iter()
            .enumerate()
            .map(|(i, (link, invert))| {
                let files = match link {
                    PlannedLink::Distortion { .. } => LinkFiles::Warp {
                        field: ctx.input(&format!("link{i}_warp"))?.to_path_buf(),
                    },
                    PlannedLink::Registration { .. } => LinkFiles::Matrix {
                        mat: ctx.input(&format!("link{i}_mat"))?.to_path_buf(),
                        moving: ctx.input(&format!("link{i}_moving"))?.to_path_buf(),
                        fixed: ctx.input(&format!("link{i}_fixed"))?.to_path_buf(),
                    },
                };
                let binding = LinkBinding::new(link.clone(), files);
                Ok(if *invert { binding.inverted() } else { binding })
            })
            .collect()
    }

    async fn run(&self, ctx: &StageContext) -> Result<BTreeMap<String, PathBuf>> {
        let bindings = self.bindings(ctx)?;
        let source_ref = ctx.input(SOURCE_REF_PORT)?.to_path_buf();
        let target_ref = ctx.input(TARGET_REF_PORT)?.to_path_buf();
        let workdir = ctx.workdir()?.to_path_buf();
        let regrid = self.regrid;
        run_blocking(move || compose(&bindings, &source_ref, &target_ref, &workdir, regrid)).await
    }
}

fn compose(
    bindings: &[LinkBinding],
    source_ref: &Path,
    target_ref: &Path,
    workdir: &Path,
    regrid: bool,
) -> Result<BTreeMap<String, PathBuf>> {
    let pairs = bindings.iter().map(LinkBinding::load).collect::<Result<Vec<_>>>()?;
    let composed = ComposedTransform::from_pairs(pairs)?;
    let native = read_geometry(source_ref)?;
    let target = read_geometry(target_ref)?;
    let grid = composed.sampling_grid(&native, &target, regrid)?;
    debug!(links = bindings.len(), shape = ?grid.shape, "composing chain");

    let pull = composed.pull_field(&grid)?;
    let warp = workdir.join("composed_warp.nii.gz");
    write_warp(&warp, &pull)?;
    Ok(super::single(WARP_PORT, warp))
}

#[async_trait]
impl Stage for ComposeStage {
    fn name(&self) -> &str {
        "compose"
    }

    fn kind(&self) -> StageKind {
        StageKind::Compose
    }

    fn outputs(&self) -> Vec<String> {
        vec![WARP_PORT.to_string()]
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutput {
        self.run(ctx).await.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageStatus;
    use crate::io::{format_fsl_mat, read_warp, write_volume, Volume};
    use crate::spatial::{DistortionState, FrameFamily, ImageGeometry};
    use crate::stages::test_support::stage_context;
    use nalgebra::{Matrix4, Point3};
    use ndarray::Array3;
    use tempfile::TempDir;

    fn image(dir: &TempDir, name: &str, geometry: ImageGeometry) -> PathBuf {
        let path = dir.path().join(name);
        let data = Array3::from_elem((geometry.shape[0], geometry.shape[1], geometry.shape[2]), 1.0);
        write_volume(&path, &Volume { geometry, data }).unwrap();
        path
    }

    #[tokio::test]
    async fn test_compose_registration_chain_writes_pull_field() {
        let dir = TempDir::new().unwrap();
        let grid = ImageGeometry::axis_aligned([8, 8, 8], [2.0, 2.0, 2.0], [-8.0, -8.0, -8.0]);
        let whole = image(&dir, "whole.nii.gz", grid.clone());
        let anat = image(&dir, "anat.nii.gz", grid);
        let mat = dir.path().join("whole_to_anat.mat");
        std::fs::write(&mat, format_fsl_mat(&Matrix4::identity())).unwrap();

        let link = PlannedLink::Registration {
            family: FrameFamily::WholeVolume,
            state: DistortionState::Distorted,
        };
        let stage = ComposeStage::new(vec![(link, false)]);
        assert_eq!(stage.input_ports().len(), 5);
        let ctx = stage_context(
            dir.path(),
            "whole_compose",
            &[
                ("link0_mat", mat),
                ("link0_moving", whole.clone()),
                ("link0_fixed", anat.clone()),
                (SOURCE_REF_PORT, whole),
                (TARGET_REF_PORT, anat),
            ],
        );

        let output = stage.execute(&ctx).await;

        assert_eq!(output.status, StageStatus::Ok, "{:?}", output.error);
        let field = read_warp(output.artifact(WARP_PORT).unwrap()).unwrap();
        assert_eq!(field.geometry.shape, [8, 8, 8]);
        // Identical grids and an identity FSL matrix: zero displacement.
        let p = field.geometry.voxel_to_world(&Point3::new(3.0, 3.0, 3.0));
        assert!((field.map_point(&p).unwrap() - p).norm() < 1e-4);
        assert_eq!(output.artifacts.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_link_port_fails() {
        let dir = TempDir::new().unwrap();
        let link = PlannedLink::Distortion {
            family: FrameFamily::SlabReference,
            inverse: false,
        };
        let output = ComposeStage::new(vec![(link, false)])
            .execute(&stage_context(dir.path(), "c", &[]))
            .await;
        assert_eq!(output.status, StageStatus::Fail);
    }
}
