//! Interpolation kernels.

use crate::errors::Result;
use crate::io::Volume;
use crate::spatial::{ImageGeometry, WarpField};
use nalgebra::Point3;
use ndarray::Array3;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::fmt::Debug;

const LANCZOS_RADIUS: i64 = 3;

/// How intensities are sampled between voxel centres.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interpolation {
    /// Closest voxel; for masks.
    Nearest,
    /// Label with the largest trilinear weight; for segmentations.
    MultiLabel,
    /// Trilinear.
    Trilinear,
    /// Lanczos-windowed sinc.
    WindowedSinc,
}

/// Resamples a volume at arbitrary source-world positions.
pub trait VolumeResampler: Send + Sync + Debug {
    /// Samples `source` at `positions` (one per node of `grid`, i-fastest).
    fn resample(
        &self,
        source: &Volume,
        positions: &[Point3<f64>],
        grid: &ImageGeometry,
        interpolation: Interpolation,
    ) -> Result<Volume>;
}

/// Resamples `source` onto the grid of a pull field.
pub fn resample_with_field(
    resampler: &dyn VolumeResampler,
    source: &Volume,
    pull: &WarpField,
    interpolation: Interpolation,
) -> Result<Volume> {
    let positions = pull
        .geometry
        .world_points()
        .iter()
        .map(|q| pull.map_point(q))
        .collect::<Result<Vec<_>>>()?;
    resampler.resample(source, &positions, &pull.geometry, interpolation)
}

/// Direct kernel evaluation. Samples outside the source are zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelResampler;

impl VolumeResampler for KernelResampler {
    fn resample(
        &self,
        source: &Volume,
        positions: &[Point3<f64>],
        grid: &ImageGeometry,
        interpolation: Interpolation,
    ) -> Result<Volume> {
        let to_index = source.geometry.world_to_voxel()?;
        let [nx, ny, nz] = grid.shape;
        let mut data = Array3::<f32>::zeros((nx, ny, nz));
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    let Some(position) = positions.get(grid.flat_index(i, j, k)) else {
                        continue;
                    };
                    let index = to_index.transform_point(position);
                    data[[i, j, k]] = sample(&source.data, &index, interpolation);
                }
            }
        }
        Ok(Volume {
            geometry: grid.clone(),
            data,
        })
    }
}

fn voxel(data: &Array3<f32>, i: i64, j: i64, k: i64) -> Option<f32> {
    let (i, j, k) = (usize::try_from(i).ok()?, usize::try_from(j).ok()?, usize::try_from(k).ok()?);
    data.get([i, j, k]).copied()
}

fn inside(data: &Array3<f32>, index: &Point3<f64>) -> bool {
    let shape = data.shape();
    (0..3).all(|axis| {
        #[allow(clippy::cast_precision_loss)]
        let n = shape[axis] as f64;
        index[axis] > -0.5 && index[axis] < n - 0.5
    })
}

/// Sample at a continuous voxel index.
#[must_use]
pub fn sample(data: &Array3<f32>, index: &Point3<f64>, interpolation: Interpolation) -> f32 {
    if !inside(data, index) {
        return 0.0;
    }
    match interpolation {
        Interpolation::Nearest => nearest(data, index),
        Interpolation::Trilinear => trilinear(data, index),
        Interpolation::MultiLabel => multi_label(data, index),
        Interpolation::WindowedSinc => windowed_sinc(data, index),
    }
}

#[allow(clippy::cast_possible_truncation)]
fn nearest(data: &Array3<f32>, index: &Point3<f64>) -> f32 {
    voxel(
        data,
        index.x.round() as i64,
        index.y.round() as i64,
        index.z.round() as i64,
    )
    .unwrap_or(0.0)
}

#[allow(clippy::cast_possible_truncation)]
fn corners(index: &Point3<f64>) -> impl Iterator<Item = ([i64; 3], f64)> {
    let base = [index.x.floor(), index.y.floor(), index.z.floor()];
    let frac = [index.x - base[0], index.y - base[1], index.z - base[2]];
    (0..8).map(move |n| {
        let mut at = [0i64; 3];
        let mut weight = 1.0;
        for axis in 0..3 {
            let upper = (n >> axis) & 1 == 1;
            at[axis] = base[axis] as i64 + i64::from(upper);
            weight *= if upper { frac[axis] } else { 1.0 - frac[axis] };
        }
        (at, weight)
    })
}

#[allow(clippy::cast_possible_truncation)]
fn trilinear(data: &Array3<f32>, index: &Point3<f64>) -> f32 {
    let mut total = 0.0;
    let mut weights = 0.0;
    for ([i, j, k], w) in corners(index) {
        if let Some(v) = voxel(data, i, j, k) {
            total += w * f64::from(v);
            weights += w;
        }
    }
    if weights > 0.0 {
        (total / weights) as f32
    } else {
        0.0
    }
}

#[allow(clippy::cast_possible_truncation)]
fn multi_label(data: &Array3<f32>, index: &Point3<f64>) -> f32 {
    let mut votes: BTreeMap<i64, f64> = BTreeMap::new();
    for ([i, j, k], w) in corners(index) {
        if let Some(v) = voxel(data, i, j, k) {
            *votes.entry(f64::from(v).round() as i64).or_default() += w;
        }
    }
    votes
        .into_iter()
        .fold(None, |best: Option<(i64, f64)>, (label, w)| match best {
            Some((_, bw)) if bw >= w => best,
            _ => Some((label, w)),
        })
        .map_or(0.0, |(label, _)| label as f32)
}

fn lanczos(x: f64) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let a = LANCZOS_RADIUS as f64;
    if x.abs() < 1e-12 {
        1.0
    } else if x.abs() >= a {
        0.0
    } else {
        let px = PI * x;
        a * px.sin() * (px / a).sin() / (px * px)
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn windowed_sinc(data: &Array3<f32>, index: &Point3<f64>) -> f32 {
    let base = [index.x.floor() as i64, index.y.floor() as i64, index.z.floor() as i64];
    let span = (1 - LANCZOS_RADIUS)..=LANCZOS_RADIUS;
    let mut total = 0.0;
    let mut weights = 0.0;
    for dk in span.clone() {
        let k = base[2] + dk;
        let wk = lanczos(index.z - k as f64);
        for dj in span.clone() {
            let j = base[1] + dj;
            let wj = lanczos(index.y - j as f64);
            for di in span.clone() {
                let i = base[0] + di;
                let Some(v) = voxel(data, i, j, k) else { continue };
                let w = lanczos(index.x - i as f64) * wj * wk;
                total += w * f64::from(v);
                weights += w;
            }
        }
    }
    if weights.abs() > 1e-12 {
        (total / weights) as f32
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    fn ramp() -> Volume {
        let geometry = ImageGeometry::axis_aligned([5, 5, 5], [1.0, 1.0, 1.0], [0.0, 0.0, 0.0]);
        #[allow(clippy::cast_precision_loss)]
        let data = Array3::from_shape_fn((5, 5, 5), |(i, _, _)| i as f32);
        Volume { geometry, data }
    }

    #[test]
    fn test_trilinear_interpolates_ramp() {
        let v = sample(&ramp().data, &Point3::new(1.25, 2.0, 2.0), Interpolation::Trilinear);
        assert!((v - 1.25).abs() < 1e-6);
    }

    #[test]
    fn test_nearest_and_outside() {
        let data = ramp().data;
        assert!((sample(&data, &Point3::new(2.6, 1.0, 1.0), Interpolation::Nearest) - 3.0).abs() < 1e-6);
        assert!(sample(&data, &Point3::new(-2.0, 1.0, 1.0), Interpolation::Trilinear).abs() < 1e-6);
    }

    #[test]
    fn test_windowed_sinc_exact_on_grid_nodes() {
        let data = ramp().data;
        let v = sample(&data, &Point3::new(2.0, 2.0, 2.0), Interpolation::WindowedSinc);
        assert!((v - 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_multi_label_picks_dominant_label() {
        let mut data = Array3::<f32>::zeros((2, 2, 2));
        data[[1, 0, 0]] = 3.0;
        data[[1, 1, 0]] = 3.0;
        data[[1, 0, 1]] = 3.0;
        data[[1, 1, 1]] = 3.0;
        assert!((sample(&data, &Point3::new(0.8, 0.5, 0.5), Interpolation::MultiLabel) - 3.0).abs() < 1e-6);
        assert!(sample(&data, &Point3::new(0.2, 0.5, 0.5), Interpolation::MultiLabel).abs() < 1e-6);
    }

    #[test]
    fn test_resample_with_shift_field() {
        let source = ramp();
        let pull = WarpField::constant(source.geometry.clone(), Vector3::new(1.0, 0.0, 0.0)).unwrap();
        let out = resample_with_field(&KernelResampler, &source, &pull, Interpolation::Trilinear).unwrap();
        assert!((out.data[[1, 2, 2]] - 2.0).abs() < 1e-6);
        assert!(out.data[[4, 2, 2]].abs() < 1e-6);
    }
}
