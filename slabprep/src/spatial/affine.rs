//! Linear transforms and their numerical conventions.
//!
//! A registration operator hands back matrices in FSL's scaled-voxel
//! convention; composition happens on world-space (physical) matrices. A
//! [`LinearTransform`] keeps whatever convention it was produced in and is
//! only converted when a consumer asks for the physical matrix.

use super::ImageGeometry;
use crate::errors::{Result, SlabprepError};
use nalgebra::{Matrix4, Point3};
use serde::{Deserialize, Serialize};

/// The numerical convention a matrix is expressed in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "convention")]
pub enum Convention {
    /// Maps source world (RAS mm) to target world.
    Physical,
    /// FSL scaled-voxel mm of `source` to scaled-voxel mm of `reference`.
    VoxelGrid {
        /// Geometry of the moving image.
        source: ImageGeometry,
        /// Geometry of the fixed image.
        reference: ImageGeometry,
    },
}

/// A 4x4 affine with the convention it is expressed in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearTransform {
    /// The raw matrix.
    pub matrix: Matrix4<f64>,
    /// How to interpret it.
    pub convention: Convention,
}

impl LinearTransform {
    /// A world-space matrix.
    #[must_use]
    pub const fn physical(matrix: Matrix4<f64>) -> Self {
        Self {
            matrix,
            convention: Convention::Physical,
        }
    }

    /// An FSL matrix between two images.
    #[must_use]
    pub const fn fsl(matrix: Matrix4<f64>, source: ImageGeometry, reference: ImageGeometry) -> Self {
        Self {
            matrix,
            convention: Convention::VoxelGrid { source, reference },
        }
    }

    /// The identity in world space.
    #[must_use]
    pub fn identity() -> Self {
        Self::physical(Matrix4::identity())
    }

    /// The world-space matrix.
    ///
    /// `world = ref_vox2world * inv(ref_scale) * fsl * src_scale * inv(src_vox2world)`
    pub fn to_physical(&self) -> Result<Matrix4<f64>> {
        match &self.convention {
            Convention::Physical => Ok(self.matrix),
            Convention::VoxelGrid { source, reference } => {
                let ref_scale_inv = invert(&reference.fsl_scaling(), "reference FSL scaling")?;
                let src_world_to_vox = source.world_to_voxel()?;
                Ok(reference.affine * ref_scale_inv * self.matrix * source.fsl_scaling() * src_world_to_vox)
            }
        }
    }

    /// The FSL matrix between `source` and `reference` for this transform.
    pub fn to_fsl(&self, source: &ImageGeometry, reference: &ImageGeometry) -> Result<Matrix4<f64>> {
        if let Convention::VoxelGrid { source: s, reference: r } = &self.convention {
            if s == source && r == reference {
                return Ok(self.matrix);
            }
        }
        let world = self.to_physical()?;
        let src_scale_inv = invert(&source.fsl_scaling(), "source FSL scaling")?;
        let ref_world_to_vox = reference.world_to_voxel()?;
        Ok(reference.fsl_scaling() * ref_world_to_vox * world * source.affine * src_scale_inv)
    }

    /// The inverse transform, in the mirrored convention.
    pub fn inverse(&self) -> Result<Self> {
        let matrix = invert(&self.matrix, "linear transform")?;
        let convention = match &self.convention {
            Convention::Physical => Convention::Physical,
            Convention::VoxelGrid { source, reference } => Convention::VoxelGrid {
                source: reference.clone(),
                reference: source.clone(),
            },
        };
        Ok(Self { matrix, convention })
    }

    /// Applies the transform to a world point.
    pub fn map_point(&self, point: &Point3<f64>) -> Result<Point3<f64>> {
        Ok(self.to_physical()?.transform_point(point))
    }

    /// Returns true when every entry is finite and the matrix is invertible.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.matrix.iter().all(|v| v.is_finite()) && self.matrix.determinant().abs() > 1e-12
    }
}

/// Inverts a matrix, naming it in the error.
pub fn invert(matrix: &Matrix4<f64>, what: &str) -> Result<Matrix4<f64>> {
    matrix
        .try_inverse()
        .ok_or_else(|| SlabprepError::Numerical(format!("{what} is singular")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: &Matrix4<f64>, b: &Matrix4<f64>) {
        assert!((a - b).norm() < 1e-9, "{a} != {b}");
    }

    fn translation(x: f64, y: f64, z: f64) -> Matrix4<f64> {
        Matrix4::new_translation(&nalgebra::Vector3::new(x, y, z))
    }

    #[test]
    fn test_identity_fsl_between_same_grid_is_identity_in_world() {
        let g = ImageGeometry::axis_aligned([20, 20, 10], [2.0, 2.0, 3.0], [-20.0, -20.0, -15.0]);
        let t = LinearTransform::fsl(Matrix4::identity(), g.clone(), g);
        assert_close(&t.to_physical().unwrap(), &Matrix4::identity());
    }

    #[test]
    fn test_fsl_translation_sign_on_flipped_axis() {
        // Right-handed grid: FSL x runs opposite to world x.
        let g = ImageGeometry::axis_aligned([20, 20, 10], [2.0, 2.0, 3.0], [0.0, 0.0, 0.0]);
        let t = LinearTransform::fsl(translation(4.0, 2.0, 0.0), g.clone(), g);
        assert_close(&t.to_physical().unwrap(), &translation(-4.0, 2.0, 0.0));
    }

    #[test]
    fn test_world_fsl_round_trip() {
        let src = ImageGeometry::axis_aligned([32, 32, 12], [1.5, 1.5, 2.0], [-24.0, -24.0, -12.0]);
        let reference = ImageGeometry::axis_aligned([64, 64, 48], [1.0, 1.0, 1.0], [-32.0, -40.0, -20.0]);
        let world = LinearTransform::physical(translation(3.0, -1.0, 2.5));
        let fsl = world.to_fsl(&src, &reference).unwrap();
        let back = LinearTransform::fsl(fsl, src, reference).to_physical().unwrap();
        assert_close(&back, &world.matrix);
    }

    #[test]
    fn test_inverse_mirrors_convention() {
        let src = ImageGeometry::axis_aligned([8, 8, 8], [1.0, 1.0, 1.0], [0.0, 0.0, 0.0]);
        let reference = ImageGeometry::axis_aligned([4, 4, 4], [2.0, 2.0, 2.0], [0.0, 0.0, 0.0]);
        let t = LinearTransform::fsl(translation(1.0, 2.0, 3.0), src.clone(), reference.clone());
        let inv = t.inverse().unwrap();
        assert_eq!(
            inv.convention,
            Convention::VoxelGrid { source: reference, reference: src }
        );
        let product = t.to_physical().unwrap() * inv.to_physical().unwrap();
        assert_close(&product, &Matrix4::identity());
    }

    #[test]
    fn test_singular_matrix_rejected() {
        let t = LinearTransform::physical(Matrix4::zeros());
        assert!(!t.is_well_formed());
        assert!(t.inverse().is_err());
    }
}
