use super::{run_blocking, single, Stage};
use crate::context::StageContext;
use crate::core::{StageKind, StageOutput};
use crate::errors::Result;
use crate::io::{read_series, read_volume, read_warp, write_series, write_volume};
use crate::resample::{load_motion, resample_with_field, Interpolation, TimeSeriesResampler, VolumeResampler};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Input port of the image to resample.
pub const IMAGE_PORT: &str = "image";
/// Input port of the per-volume motion matrix directory.
pub const MOTION_PORT: &str = "motion";
/// Output port of the resampled image.
pub const RESAMPLED_PORT: &str = "resampled";

/// What a resample stage reads.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResampleMode {
    /// A static 3-D image (reference, mask, segmentation).
    Volume,
    /// A 4-D run with per-volume motion; `repetition_time` comes from the sidecar.
    Series {
        /// Seconds.
        repetition_time: f64,
    },
}

/// Applies a composed pull field with a single interpolation per voxel.
#[derive(Debug, Clone)]
pub struct ResampleStage {
    mode: ResampleMode,
    interpolation: Interpolation,
    resampler: Arc<dyn VolumeResampler>,
}

impl ResampleStage {
    /// Creates a resample stage.
    #[must_use]
    pub fn new(mode: ResampleMode, interpolation: Interpolation, resampler: Arc<dyn VolumeResampler>) -> Self {
        Self {
            mode,
            interpolation,
            resampler,
        }
    }

    async fn run(&self, ctx: &StageContext) -> Result<BTreeMap<String, PathBuf>> {
        let image = ctx.input(IMAGE_PORT)?.to_path_buf();
        let warp = ctx.input(super::WARP_PORT)?.to_path_buf();
        let motion = match self.mode {
            ResampleMode::Series { .. } => Some(ctx.input(MOTION_PORT)?.to_path_buf()),
            ResampleMode::Volume => None,
        };
        let out = ctx.workdir()?.join("resampled.nii.gz");
        let (mode, interpolation, resampler) = (self.mode, self.interpolation, Arc::clone(&self.resampler));

        run_blocking(move || {
            let pull = read_warp(&warp)?;
            match (mode, motion) {
                (ResampleMode::Series { repetition_time }, Some(motion)) => {
                    let series = read_series(&image, Some(repetition_time))?;
                    let matrices = load_motion(&motion, &series.geometry, series.len())?;
                    let resampled = TimeSeriesResampler::new(resampler).resample(&series, &matrices, &pull, interpolation)?;
                    info!(volumes = resampled.len(), "resampled series");
                    write_series(&out, &resampled)?;
                }
                _ => {
                    let source = read_volume(&image)?;
                    write_volume(&out, &resample_with_field(resampler.as_ref(), &source, &pull, interpolation)?)?;
                }
            }
            Ok(single(RESAMPLED_PORT, out))
        })
        .await
    }
}

#[async_trait]
impl Stage for ResampleStage {
    fn name(&self) -> &str {
        match self.mode {
            ResampleMode::Volume => "resample_volume",
            ResampleMode::Series { .. } => "resample_series",
        }
    }

    fn kind(&self) -> StageKind {
        StageKind::Resample
    }

    fn outputs(&self) -> Vec<String> {
        vec![RESAMPLED_PORT.to_string()]
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutput {
        self.run(ctx).await.into()
    }
}

/// Keeps the first volumes of a run (quick mode).
#[derive(Debug, Clone, Copy)]
pub struct TruncateStage {
    volumes: usize,
}

impl TruncateStage {
    /// Input and output port of the run.
    pub const PORT: &'static str = "bold";

    /// Keeps `volumes` volumes.
    #[must_use]
    pub const fn new(volumes: usize) -> Self {
        Self { volumes }
    }

    async fn run(&self, ctx: &StageContext) -> Result<BTreeMap<String, PathBuf>> {
        let bold = ctx.input(Self::PORT)?.to_path_buf();
        let out = ctx.workdir()?.join("truncated_bold.nii.gz");
        let volumes = self.volumes;
        run_blocking(move || {
            let series = read_series(&bold, None)?.truncated(volumes);
            write_series(&out, &series)?;
            Ok(single(Self::PORT, out))
        })
        .await
    }
}

#[async_trait]
impl Stage for TruncateStage {
    fn name(&self) -> &str {
        "truncate"
    }

    fn kind(&self) -> StageKind {
        StageKind::Prepare
    }

    fn outputs(&self) -> Vec<String> {
        vec![Self::PORT.to_string()]
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutput {
        self.run(ctx).await.into()
    }
}
