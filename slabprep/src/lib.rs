//! # Slabprep
//!
//! Resumable preprocessing for slab fMRI acquisitions.
//!
//! A subject/session has one anatomical image, one whole-volume functional
//! run and several thin-slab functional runs. Slabprep registers every slab
//! to the anatomical image through a chain of intermediate references and
//! resamples each slab time series in a single interpolation step:
//!
//! - **Run selection**: structural, whole-volume, slab-reference and fieldmap
//!   runs picked from a BIDS-like dataset
//! - **Frame chains**: slab -> slab reference -> whole volume -> anatomical,
//!   with distortion-correction bridging where link states differ
//! - **Transform composition**: FSL/ITK linear transforms and pull fields
//!   collapsed into one static field per slab
//! - **Checkpoints**: completed derivatives are bound instead of recomputed
//! - **Stage graph**: independent branches run concurrently and fail in isolation
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use slabprep::prelude::*;
//!
//! let config = PipelineConfig::new("01", "01", "/data/bids", "/data/derivatives");
//! let planner = Planner::new(config, services);
//! let plan = planner.plan(&BidsDirectory::new("/data/bids"))?;
//! if let Some(result) = plan.execute(Arc::new(PipelineContext::new("/scratch"))).await? {
//!     println!("success: {}", result.success);
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod compose;
pub mod config;
pub mod context;
pub mod core;
pub mod dataset;
pub mod derivatives;
pub mod errors;
pub mod events;
pub mod io;
pub mod observability;
pub mod operators;
pub mod pipeline;
pub mod registration;
pub mod resample;
pub mod resume;
pub mod spatial;
pub mod stages;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{PipelineConfig, RegistrationLinkConfig, RunMode, SelectionFilter};
    pub use crate::context::{PipelineContext, StageContext, StageInputs};
    pub use crate::core::{PipelineEvent, StageKind, StageOutput, StageStatus};
    pub use crate::dataset::{BidsDirectory, DatasetLayout, Run, Selection};
    pub use crate::derivatives::DerivativeLayout;
    pub use crate::errors::{
        ConfigurationError, MetadataError, OperatorError, PipelineValidationError, ResumabilityError,
        SlabprepError,
    };
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::operators::{CommandRegistration, CommandToolbox, ExternalOp, ExternalToolbox, RegistrationOperator};
    pub use crate::pipeline::{
        GraphExecutionResult, InputBinding, PipelineBuilder, PipelinePlan, Planner, PlannerServices, StageGraph,
        StageSpec,
    };
    pub use crate::resample::{KernelResampler, VolumeResampler};
    pub use crate::resume::{FilesystemStore, PresenceStore};
    pub use crate::spatial::{DistortionState, FrameFamily, ImageGeometry, ReferenceFrame};
    pub use crate::stages::Stage;
}
