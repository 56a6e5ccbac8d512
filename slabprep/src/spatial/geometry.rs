//! Voxel grids and their placement in world space.

use crate::errors::{Result, SlabprepError};
use nalgebra::{Matrix3, Matrix4, Point3, Vector3};
use serde::{Deserialize, Serialize};

/// A 3-D voxel grid with its voxel-to-world (RAS mm) affine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageGeometry {
    /// Number of voxels along i, j, k.
    pub shape: [usize; 3],
    /// Voxel index to world coordinate.
    pub affine: Matrix4<f64>,
}

impl ImageGeometry {
    /// Creates a geometry from a shape and affine.
    #[must_use]
    pub const fn new(shape: [usize; 3], affine: Matrix4<f64>) -> Self {
        Self { shape, affine }
    }

    /// An axis-aligned grid with the given spacing and origin.
    #[must_use]
    pub fn axis_aligned(shape: [usize; 3], spacing: [f64; 3], origin: [f64; 3]) -> Self {
        let mut affine = Matrix4::identity();
        for axis in 0..3 {
            affine[(axis, axis)] = spacing[axis];
            affine[(axis, 3)] = origin[axis];
        }
        Self { shape, affine }
    }

    /// Total number of voxels.
    #[must_use]
    pub const fn voxel_count(&self) -> usize {
        self.shape[0] * self.shape[1] * self.shape[2]
    }

    /// Voxel size along each axis (column norms of the linear part).
    #[must_use]
    pub fn spacing(&self) -> Vector3<f64> {
        let linear = self.linear();
        Vector3::new(
            linear.column(0).norm(),
            linear.column(1).norm(),
            linear.column(2).norm(),
        )
    }

    /// The 3x3 linear part of the affine.
    #[must_use]
    pub fn linear(&self) -> Matrix3<f64> {
        self.affine.fixed_view::<3, 3>(0, 0).into_owned()
    }

    /// World to voxel index.
    pub fn world_to_voxel(&self) -> Result<Matrix4<f64>> {
        self.affine
            .try_inverse()
            .ok_or_else(|| SlabprepError::Numerical("voxel-to-world affine is singular".into()))
    }

    /// World position of a (possibly fractional) voxel index.
    #[must_use]
    pub fn voxel_to_world(&self, index: &Point3<f64>) -> Point3<f64> {
        self.affine.transform_point(index)
    }

    /// Returns true when the linear part preserves handedness.
    #[must_use]
    pub fn is_right_handed(&self) -> bool {
        self.linear().determinant() > 0.0
    }

    /// Matrix from voxel index to FSL "scaled voxel" millimetres.
    ///
    /// FSL scales indices by voxel size and flips the first axis when the
    /// voxel-to-world determinant is positive.
    #[must_use]
    pub fn fsl_scaling(&self) -> Matrix4<f64> {
        let spacing = self.spacing();
        let mut scale = Matrix4::identity();
        scale[(0, 0)] = spacing.x;
        scale[(1, 1)] = spacing.y;
        scale[(2, 2)] = spacing.z;
        if self.is_right_handed() {
            let mut flip = Matrix4::identity();
            flip[(0, 0)] = -1.0;
            #[allow(clippy::cast_precision_loss)]
            let last = (self.shape[0] as f64) - 1.0;
            flip[(0, 3)] = last;
            scale * flip
        } else {
            scale
        }
    }

    /// World positions of every voxel centre, in i-fastest order.
    #[must_use]
    pub fn world_points(&self) -> Vec<Point3<f64>> {
        let mut points = Vec::with_capacity(self.voxel_count());
        for k in 0..self.shape[2] {
            for j in 0..self.shape[1] {
                for i in 0..self.shape[0] {
                    #[allow(clippy::cast_precision_loss)]
                    let index = Point3::new(i as f64, j as f64, k as f64);
                    points.push(self.voxel_to_world(&index));
                }
            }
        }
        points
    }

    /// World positions of the eight corner voxels.
    #[must_use]
    pub fn corners(&self) -> [Point3<f64>; 8] {
        #[allow(clippy::cast_precision_loss)]
        let max = [
            self.shape[0].saturating_sub(1) as f64,
            self.shape[1].saturating_sub(1) as f64,
            self.shape[2].saturating_sub(1) as f64,
        ];
        let mut out = [Point3::origin(); 8];
        for (n, corner) in out.iter_mut().enumerate() {
            let index = Point3::new(
                if n & 1 == 0 { 0.0 } else { max[0] },
                if n & 2 == 0 { 0.0 } else { max[1] },
                if n & 4 == 0 { 0.0 } else { max[2] },
            );
            *corner = self.voxel_to_world(&index);
        }
        out
    }

    /// A grid with the same orientation re-gridded to `spacing`, restricted to the
    /// voxel-index box `[lo, hi]` of this grid.
    ///
    /// The resulting grid covers the box exactly; used to build sampling
    /// references on the anatomical frame at functional resolution.
    #[must_use]
    pub fn regrid(&self, spacing: &Vector3<f64>, lo: [f64; 3], hi: [f64; 3]) -> Self {
        let own = self.spacing();
        let mut shape = [1usize; 3];
        let mut scale = Matrix4::identity();
        for axis in 0..3 {
            let extent = (hi[axis] - lo[axis]).max(0.0) * own[axis];
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let count = (extent / spacing[axis]).floor() as usize + 1;
            shape[axis] = count;
            scale[(axis, axis)] = spacing[axis] / own[axis];
            scale[(axis, 3)] = lo[axis];
        }
        Self {
            shape,
            affine: self.affine * scale,
        }
    }

    /// Index of a voxel in i-fastest order.
    #[must_use]
    pub const fn flat_index(&self, i: usize, j: usize, k: usize) -> usize {
        i + self.shape[0] * (j + self.shape[1] * k)
    }
}
