//! Spatial primitives: frames, grids, linear and nonlinear transforms.

mod affine;
mod frame;
mod geometry;
mod transform;
mod warp;

pub use affine::{invert, Convention, LinearTransform};
pub use frame::{plan_chain, plan_chain_from, DistortionState, FrameFamily, LinkStates, PlannedLink, ReferenceFrame};
pub use geometry::ImageGeometry;
pub use transform::{Transform, TransformKind, TransformPair};
pub use warp::WarpField;
