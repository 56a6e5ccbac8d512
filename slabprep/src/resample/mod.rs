//! Resampling of volumes and series through composed transforms.

mod kernel;
mod series;

pub use kernel::{resample_with_field, sample, Interpolation, KernelResampler, VolumeResampler};
pub use series::{load_motion, TimeSeriesResampler};
