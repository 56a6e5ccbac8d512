//! Dense displacement fields.

use super::ImageGeometry;
use crate::errors::{Result, SlabprepError};
use nalgebra::{Matrix4, Point3, Vector3};
use serde::{Deserialize, Serialize};

const INVERSION_ITERATIONS: usize = 20;
const INVERSION_TOLERANCE: f64 = 1e-4;

/// A world-space displacement field sampled on a grid.
///
/// The field is the point map `p -> p + d(p)`; `d` is interpolated trilinearly
/// between grid nodes and clamped to the border outside the grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarpField {
    /// Grid the displacements are sampled on.
    pub geometry: ImageGeometry,
    /// World displacement (mm) per voxel, i-fastest order.
    pub displacements: Vec<Vector3<f64>>,
    #[serde(skip)]
    world_to_voxel: Option<Matrix4<f64>>,
}

impl WarpField {
    /// Creates a field; `displacements` must hold one vector per voxel.
    pub fn new(geometry: ImageGeometry, displacements: Vec<Vector3<f64>>) -> Result<Self> {
        if displacements.len() != geometry.voxel_count() {
            return Err(SlabprepError::Numerical(format!(
                "warp field has {} vectors for a grid of {} voxels",
                displacements.len(),
                geometry.voxel_count()
            )));
        }
        let world_to_voxel = Some(geometry.world_to_voxel()?);
        Ok(Self {
            geometry,
            displacements,
            world_to_voxel,
        })
    }

    /// A field with the same displacement everywhere.
    pub fn constant(geometry: ImageGeometry, displacement: Vector3<f64>) -> Result<Self> {
        let n = geometry.voxel_count();
        Self::new(geometry, vec![displacement; n])
    }

    /// A field built from absolute target positions of every grid node.
    pub fn from_positions(geometry: ImageGeometry, positions: &[Point3<f64>]) -> Result<Self> {
        let displacements = geometry
            .world_points()
            .iter()
            .zip(positions)
            .map(|(p, q)| q - p)
            .collect();
        Self::new(geometry, displacements)
    }

    /// Displacement at an arbitrary world point.
    pub fn displacement_at(&self, point: &Point3<f64>) -> Result<Vector3<f64>> {
        let w2v = match self.world_to_voxel {
            Some(m) => m,
            None => self.geometry.world_to_voxel()?,
        };
        let index = w2v.transform_point(point);
        Ok(self.trilinear(&index))
    }

    /// Applies the point map.
    pub fn map_point(&self, point: &Point3<f64>) -> Result<Point3<f64>> {
        Ok(point + self.displacement_at(point)?)
    }

    /// Inverts the field on `grid` by fixed-point iteration.
    ///
    /// For each node `q` solves `p + d(p) = q` with `p <- q - d(p)`.
    pub fn invert_on(&self, grid: &ImageGeometry) -> Result<Self> {
        let targets = grid.world_points();
        let mut inverse = Vec::with_capacity(targets.len());
        for q in &targets {
            let mut p = *q;
            for _ in 0..INVERSION_ITERATIONS {
                let next = q - self.displacement_at(&p)?;
                let delta = (next - p).norm();
                p = next;
                if delta < INVERSION_TOLERANCE {
                    break;
                }
            }
            inverse.push(p - q);
        }
        Self::new(grid.clone(), inverse)
    }

    /// Inverts the field on its own grid.
    pub fn inverse(&self) -> Result<Self> {
        self.invert_on(&self.geometry)
    }

    fn node(&self, i: usize, j: usize, k: usize) -> Vector3<f64> {
        self.displacements[self.geometry.flat_index(i, j, k)]
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    fn trilinear(&self, index: &Point3<f64>) -> Vector3<f64> {
        let [nx, ny, nz] = self.geometry.shape;
        if nx == 0 || ny == 0 || nz == 0 {
            return Vector3::zeros();
        }
        let clamp = |v: f64, n: usize| v.clamp(0.0, (n - 1) as f64);
        let x = clamp(index.x, nx);
        let y = clamp(index.y, ny);
        let z = clamp(index.z, nz);
        let (x0, y0, z0) = (x.floor() as usize, y.floor() as usize, z.floor() as usize);
        let (x1, y1, z1) = ((x0 + 1).min(nx - 1), (y0 + 1).min(ny - 1), (z0 + 1).min(nz - 1));
        let (fx, fy, fz) = (x - x0 as f64, y - y0 as f64, z - z0 as f64);

        let c00 = self.node(x0, y0, z0) * (1.0 - fx) + self.node(x1, y0, z0) * fx;
        let c10 = self.node(x0, y1, z0) * (1.0 - fx) + self.node(x1, y1, z0) * fx;
        let c01 = self.node(x0, y0, z1) * (1.0 - fx) + self.node(x1, y0, z1) * fx;
        let c11 = self.node(x0, y1, z1) * (1.0 - fx) + self.node(x1, y1, z1) * fx;
        let c0 = c00 * (1.0 - fy) + c10 * fy;
        let c1 = c01 * (1.0 - fy) + c11 * fy;
        c0 * (1.0 - fz) + c1 * fz
    }
}
