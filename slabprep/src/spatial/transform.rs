//! Directional transforms between reference frames.

use super::{LinearTransform, ReferenceFrame, WarpField};
use crate::errors::Result;
use nalgebra::Point3;
use serde::{Deserialize, Serialize};

/// The mapping a transform applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TransformKind {
    /// Rigid or affine matrix.
    Linear(LinearTransform),
    /// Dense displacement field.
    Nonlinear(WarpField),
}

/// An immutable, directional mapping from `source` to `target`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    /// Frame points are mapped from.
    pub source: ReferenceFrame,
    /// Frame points are mapped to.
    pub target: ReferenceFrame,
    /// The mapping.
    pub kind: TransformKind,
}

impl Transform {
    /// A linear transform.
    #[must_use]
    pub const fn linear(source: ReferenceFrame, target: ReferenceFrame, linear: LinearTransform) -> Self {
        Self {
            source,
            target,
            kind: TransformKind::Linear(linear),
        }
    }

    /// A nonlinear transform.
    #[must_use]
    pub const fn nonlinear(source: ReferenceFrame, target: ReferenceFrame, field: WarpField) -> Self {
        Self {
            source,
            target,
            kind: TransformKind::Nonlinear(field),
        }
    }

    /// Maps a world point from the source frame into the target frame.
    pub fn map_point(&self, point: &Point3<f64>) -> Result<Point3<f64>> {
        match &self.kind {
            TransformKind::Linear(l) => l.map_point(point),
            TransformKind::Nonlinear(w) => w.map_point(point),
        }
    }

    /// Returns true for a linear transform.
    #[must_use]
    pub const fn is_linear(&self) -> bool {
        matches!(self.kind, TransformKind::Linear(_))
    }
}

/// A transform and its inverse, kept together so neither is recomputed downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformPair {
    /// Source to target.
    pub forward: Transform,
    /// Target to source.
    pub inverse: Transform,
}

impl TransformPair {
    /// Pairs a linear transform with its algebraic inverse.
    pub fn from_linear(source: ReferenceFrame, target: ReferenceFrame, linear: LinearTransform) -> Result<Self> {
        let inverse = linear.inverse()?;
        Ok(Self {
            forward: Transform::linear(source.clone(), target.clone(), linear),
            inverse: Transform::linear(target, source, inverse),
        })
    }

    /// Pairs a field that pulls target positions back into the source frame
    /// (the FSL warp convention) with its numerically inverted forward map.
    pub fn from_pull_field(source: ReferenceFrame, target: ReferenceFrame, pull: WarpField) -> Result<Self> {
        let push = pull.inverse()?;
        Ok(Self {
            forward: Transform::nonlinear(source.clone(), target.clone(), push),
            inverse: Transform::nonlinear(target, source, pull),
        })
    }

    /// Swaps the two directions.
    #[must_use]
    pub fn inverted(self) -> Self {
        Self {
            forward: self.inverse,
            inverse: self.forward,
        }
    }

    /// Frame the forward transform maps from.
    #[must_use]
    pub const fn source(&self) -> &ReferenceFrame {
        &self.forward.source
    }

    /// Frame the forward transform maps to.
    #[must_use]
    pub const fn target(&self) -> &ReferenceFrame {
        &self.forward.target
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spatial::{DistortionState, ImageGeometry};
    use nalgebra::{Matrix4, Vector3};

    #[test]
    fn test_linear_pair_round_trip() {
        let m = Matrix4::new_translation(&Vector3::new(1.0, -2.0, 0.5));
        let pair = TransformPair::from_linear(
            ReferenceFrame::WholeVolume(DistortionState::Distorted),
            ReferenceFrame::Anatomical,
            LinearTransform::physical(m),
        )
        .unwrap();
        let p = Point3::new(3.0, 4.0, 5.0);
        let back = pair.inverse.map_point(&pair.forward.map_point(&p).unwrap()).unwrap();
        assert!((back - p).norm() < 1e-12);
        assert_eq!(pair.inverse.source, ReferenceFrame::Anatomical);
    }

    #[test]
    fn test_pull_field_pair_directions() {
        let grid = ImageGeometry::axis_aligned([5, 5, 5], [2.0, 2.0, 2.0], [-4.0, -4.0, -4.0]);
        let pull = WarpField::constant(grid, Vector3::new(0.0, 2.0, 0.0)).unwrap();
        let pair = TransformPair::from_pull_field(
            ReferenceFrame::SlabReference(DistortionState::Distorted),
            ReferenceFrame::SlabReference(DistortionState::Corrected),
            pull,
        )
        .unwrap();
        let p = Point3::new(0.0, 0.0, 0.0);
        let corrected = pair.forward.map_point(&p).unwrap();
        assert!((corrected - Point3::new(0.0, -2.0, 0.0)).norm() < 1e-9);
        assert!(!pair.forward.is_linear());
        let swapped = pair.inverted();
        assert_eq!(swapped.source(), &ReferenceFrame::SlabReference(DistortionState::Corrected));
    }
}
