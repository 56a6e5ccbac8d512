//! One-shot resampling of a functional series.

use super::kernel::{Interpolation, VolumeResampler};
use crate::errors::{MissingMotionError, Result};
use crate::io::{motion_matrix_path, read_fsl_mat, TimeSeries, Volume};
use crate::spatial::{invert, ImageGeometry, LinearTransform, WarpField};
use nalgebra::{Matrix4, Point3};
use rayon::prelude::*;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Reads per-volume motion affines (volume to reference, world space).
///
/// Every volume needs its own matrix; a missing one is fatal.
pub fn load_motion(dir: &Path, geometry: &ImageGeometry, volumes: usize) -> Result<Vec<Matrix4<f64>>> {
    (0..volumes)
        .map(|index| {
            let path = motion_matrix_path(dir, index);
            if !path.exists() {
                return Err(MissingMotionError { index, volumes }.into());
            }
            LinearTransform::fsl(read_fsl_mat(&path)?, geometry.clone(), geometry.clone()).to_physical()
        })
        .collect()
}

/// Applies per-volume motion and a static pull field in one interpolation per volume.
#[derive(Debug, Clone)]
pub struct TimeSeriesResampler {
    resampler: Arc<dyn VolumeResampler>,
}

impl TimeSeriesResampler {
    /// Creates a series resampler around a volume resampler.
    #[must_use]
    pub fn new(resampler: Arc<dyn VolumeResampler>) -> Self {
        Self { resampler }
    }

    /// Resamples every volume onto the pull field's grid.
    ///
    /// For volume `t` the node `q` samples `R_t^-1(q + d(q))`, where `R_t`
    /// maps volume `t` onto the motion reference.
    pub fn resample(
        &self,
        series: &TimeSeries,
        motion: &[Matrix4<f64>],
        pull: &WarpField,
        interpolation: Interpolation,
    ) -> Result<TimeSeries> {
        let volumes = series.len();
        if motion.len() < volumes {
            return Err(MissingMotionError {
                index: motion.len(),
                volumes,
            }
            .into());
        }
        let reference_positions = pull
            .geometry
            .world_points()
            .iter()
            .map(|q| pull.map_point(q))
            .collect::<Result<Vec<_>>>()?;
        debug!(volumes, nodes = reference_positions.len(), "resampling series");

        let mut resampled = series
            .volumes
            .par_iter()
            .enumerate()
            .map(|(index, data)| {
                let to_volume = invert(&motion[index], "motion affine")?;
                let positions: Vec<Point3<f64>> =
                    reference_positions.iter().map(|p| to_volume.transform_point(p)).collect();
                let source = Volume {
                    geometry: series.geometry.clone(),
                    data: data.clone(),
                };
                let out = self.resampler.resample(&source, &positions, &pull.geometry, interpolation)?;
                Ok((index, out.data))
            })
            .collect::<Result<Vec<_>>>()?;
        resampled.sort_by_key(|(index, _)| *index);

        Ok(TimeSeries {
            geometry: pull.geometry.clone(),
            volumes: resampled.into_iter().map(|(_, data)| data).collect(),
            repetition_time: series.repetition_time,
        })
    }
}
