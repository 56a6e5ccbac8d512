//! Ordered transform chains and their static pull fields.

use crate::errors::{FrameMismatchError, Result, SlabprepError};
use crate::spatial::{ImageGeometry, ReferenceFrame, Transform, TransformPair, WarpField};
use nalgebra::Point3;
use rayon::prelude::*;

/// Voxels of padding around the mapped native extent.
const CROP_PADDING: f64 = 1.0;

/// Transforms applied in order; each one starts where the previous ended.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransformChain {
    links: Vec<Transform>,
}

impl TransformChain {
    /// An empty chain.
    #[must_use]
    pub const fn new() -> Self {
        Self { links: Vec::new() }
    }

    /// Appends a transform whose source must equal the current target.
    pub fn push(&mut self, transform: Transform) -> std::result::Result<(), FrameMismatchError> {
        if let Some(last) = self.links.last() {
            if last.target != transform.source {
                return Err(FrameMismatchError {
                    index: self.links.len(),
                    expected: last.target.to_string(),
                    found: transform.source.to_string(),
                });
            }
        }
        self.links.push(transform);
        Ok(())
    }

    /// Number of transforms.
    #[must_use]
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Returns true for an empty chain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Frame of the first transform.
    #[must_use]
    pub fn source(&self) -> Option<&ReferenceFrame> {
        self.links.first().map(|t| &t.source)
    }

    /// Frame of the last transform.
    #[must_use]
    pub fn target(&self) -> Option<&ReferenceFrame> {
        self.links.last().map(|t| &t.target)
    }

    /// Maps a point through every transform.
    pub fn map_point(&self, point: &Point3<f64>) -> Result<Point3<f64>> {
        self.links.iter().try_fold(*point, |p, t| t.map_point(&p))
    }

    /// The transforms in order.
    #[must_use]
    pub fn links(&self) -> &[Transform] {
        &self.links
    }
}

/// A composed transform with both directions.
#[derive(Debug, Clone, PartialEq)]
pub struct ComposedTransform {
    /// Source frame to target frame.
    pub forward: TransformChain,
    /// Target frame to source frame.
    pub inverse: TransformChain,
}

impl ComposedTransform {
    /// Composes pairs in order; the inverse chain runs the inverses backwards.
    pub fn from_pairs(pairs: Vec<TransformPair>) -> Result<Self> {
        if pairs.is_empty() {
            return Err(SlabprepError::Internal("cannot compose an empty chain".into()));
        }
        let mut forward = TransformChain::new();
        let mut inverses = Vec::with_capacity(pairs.len());
        for pair in pairs {
            forward.push(pair.forward)?;
            inverses.push(pair.inverse);
        }
        let mut inverse = TransformChain::new();
        for transform in inverses.into_iter().rev() {
            inverse.push(transform)?;
        }
        Ok(Self { forward, inverse })
    }

    /// Frame the composition maps from.
    #[must_use]
    pub fn source(&self) -> Option<&ReferenceFrame> {
        self.forward.source()
    }

    /// Frame the composition maps to.
    #[must_use]
    pub fn target(&self) -> Option<&ReferenceFrame> {
        self.forward.target()
    }

    /// Grid in the target frame to sample on.
    ///
    /// With `regrid`, the target grid is re-gridded to the native spacing and
    /// cropped to the mapped native extent plus one voxel; otherwise the target
    /// grid is used as is.
    pub fn sampling_grid(&self, native: &ImageGeometry, target: &ImageGeometry, regrid: bool) -> Result<ImageGeometry> {
        if !regrid {
            return Ok(target.clone());
        }
        let to_index = target.world_to_voxel()?;
        let mut lo = [f64::INFINITY; 3];
        let mut hi = [f64::NEG_INFINITY; 3];
        for corner in native.corners() {
            let index = to_index.transform_point(&self.forward.map_point(&corner)?);
            for axis in 0..3 {
                lo[axis] = lo[axis].min(index[axis]);
                hi[axis] = hi[axis].max(index[axis]);
            }
        }
        for axis in 0..3 {
            #[allow(clippy::cast_precision_loss)]
            let last = target.shape[axis].saturating_sub(1) as f64;
            lo[axis] = (lo[axis].floor() - CROP_PADDING).clamp(0.0, last);
            hi[axis] = (hi[axis].ceil() + CROP_PADDING).clamp(0.0, last);
        }
        Ok(target.regrid(&native.spacing(), lo, hi))
    }

    /// The inverse map sampled on `grid`: for every grid node, its position in the source frame.
    pub fn pull_field(&self, grid: &ImageGeometry) -> Result<WarpField> {
        let positions = grid
            .world_points()
            .par_iter()
            .map(|q| self.inverse.map_point(q))
            .collect::<Result<Vec<_>>>()?;
        WarpField::from_positions(grid.clone(), &positions)
    }
}
