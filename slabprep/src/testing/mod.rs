//! Test doubles for the pipeline.
//!
//! - [`MockStage`] for executor tests
//! - instrumented stub operators that fabricate plausible outputs
//! - an on-disk synthetic dataset (test builds only)

#[cfg(test)]
mod dataset;
mod mocks;

#[cfg(test)]
pub use dataset::SyntheticDataset;
pub use mocks::{CountingResampler, MockStage, StubRegistration, StubToolbox};
