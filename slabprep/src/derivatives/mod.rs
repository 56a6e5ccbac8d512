//! Derivative naming and persistence.

mod paths;
mod writer;

pub use paths::{
    derive_name, AnatPreprocPaths, BrainmaskPaths, ConfoundPaths, DerivativeLayout, FieldmapPaths, ReferenceOutputs,
    ReferencePaths, ReferenceRole, SlabPaths, RAW_SUFFIX,
};
pub use writer::{DerivativeWriter, WriteOutcome};
