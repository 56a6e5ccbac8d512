//! JSON sidecar metadata.

use crate::errors::{MetadataError, Result, SlabprepError};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Phase-encoding axis and polarity (`i`, `j-`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PhaseEncodingDirection {
    /// Voxel axis: 0 = i, 1 = j, 2 = k.
    pub axis: u8,
    /// True for the `-` polarity.
    pub reversed: bool,
}

impl FromStr for PhaseEncodingDirection {
    type Err = SlabprepError;

    fn from_str(s: &str) -> Result<Self> {
        let (axis, reversed) = match s.strip_suffix('-') {
            Some(a) => (a, true),
            None => (s, false),
        };
        let axis = match axis {
            "i" => 0,
            "j" => 1,
            "k" => 2,
            _ => {
                return Err(SlabprepError::UnsupportedVariant(format!(
                    "phase-encoding direction '{s}'"
                )))
            }
        };
        Ok(Self { axis, reversed })
    }
}

impl TryFrom<String> for PhaseEncodingDirection {
    type Error = SlabprepError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<PhaseEncodingDirection> for String {
    fn from(value: PhaseEncodingDirection) -> Self {
        value.to_string()
    }
}

impl fmt::Display for PhaseEncodingDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let axis = ["i", "j", "k"][usize::from(self.axis.min(2))];
        write!(f, "{axis}{}", if self.reversed { "-" } else { "" })
    }
}

/// The sidecar fields the pipeline consumes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RunMetadata {
    /// Seconds between volumes.
    #[serde(default)]
    pub repetition_time: Option<f64>,
    /// Per-slice acquisition offsets in seconds.
    #[serde(default)]
    pub slice_timing: Option<Vec<f64>>,
    /// Effective echo spacing in seconds.
    #[serde(default)]
    pub effective_echo_spacing: Option<f64>,
    /// Total readout time in seconds.
    #[serde(default)]
    pub total_readout_time: Option<f64>,
    /// Echo time of a single-echo acquisition.
    #[serde(default)]
    pub echo_time: Option<f64>,
    /// First echo time of a phase-difference fieldmap.
    #[serde(default, rename = "EchoTime1")]
    pub echo_time1: Option<f64>,
    /// Second echo time of a phase-difference fieldmap.
    #[serde(default, rename = "EchoTime2")]
    pub echo_time2: Option<f64>,
    /// Phase-encoding direction.
    #[serde(default)]
    pub phase_encoding_direction: Option<PhaseEncodingDirection>,
    /// Wall-clock acquisition time, `HH:MM:SS[.ffffff]`.
    #[serde(default)]
    pub acquisition_time: Option<String>,
}

impl RunMetadata {
    /// Reads a sidecar; a missing file yields empty metadata.
    pub fn from_sidecar(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Parsed acquisition time, if present and well formed.
    #[must_use]
    pub fn acquired_at(&self) -> Option<NaiveTime> {
        let raw = self.acquisition_time.as_deref()?;
        NaiveTime::parse_from_str(raw, "%H:%M:%S%.f").ok()
    }

    /// Repetition time or a metadata error naming the run.
    pub fn require_repetition_time(&self, run: &str) -> Result<f64, MetadataError> {
        self.repetition_time
            .ok_or_else(|| MetadataError::new(run, "RepetitionTime"))
    }

    /// Slice-timing table or a metadata error naming the run.
    pub fn require_slice_timing(&self, run: &str) -> Result<&[f64], MetadataError> {
        self.slice_timing
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| MetadataError::new(run, "SliceTiming"))
    }

    /// Phase-encoding direction or a metadata error naming the run.
    pub fn require_phase_encoding(&self, run: &str) -> Result<PhaseEncodingDirection, MetadataError> {
        self.phase_encoding_direction
            .ok_or_else(|| MetadataError::new(run, "PhaseEncodingDirection"))
    }

    /// Effective echo spacing or a metadata error naming the run.
    pub fn require_echo_spacing(&self, run: &str) -> Result<f64, MetadataError> {
        self.effective_echo_spacing
            .ok_or_else(|| MetadataError::new(run, "EffectiveEchoSpacing"))
    }

    /// Both fieldmap echo times.
    pub fn require_echo_times(&self, run: &str) -> Result<(f64, f64), MetadataError> {
        let te1 = self.echo_time1.ok_or_else(|| MetadataError::new(run, "EchoTime1"))?;
        let te2 = self.echo_time2.ok_or_else(|| MetadataError::new(run, "EchoTime2"))?;
        Ok((te1, te2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_sidecar_fields_parse() {
        let json = r#"{
            "RepetitionTime": 2.5,
            "SliceTiming": [0.0, 1.25],
            "PhaseEncodingDirection": "j-",
            "EchoTime1": 0.00492,
            "EchoTime2": 0.00738,
            "AcquisitionTime": "10:15:30.250000",
            "Manufacturer": "Siemens"
        }"#;
        let meta: RunMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(meta.require_repetition_time("r").unwrap(), 2.5);
        assert_eq!(meta.require_slice_timing("r").unwrap().len(), 2);
        assert_eq!(
            meta.require_phase_encoding("r").unwrap(),
            PhaseEncodingDirection { axis: 1, reversed: true }
        );
        assert_eq!(meta.acquired_at(), NaiveTime::from_hms_milli_opt(10, 15, 30, 250));
        assert!(meta.require_echo_times("r").is_ok());
    }

    #[test]
    fn test_missing_field_names_run_and_field() {
        let meta = RunMetadata::default();
        let err = meta.require_repetition_time("sub-01_task-x_bold.nii.gz").unwrap_err();
        assert_eq!(err.field, "RepetitionTime");
        assert_eq!(err.run, "sub-01_task-x_bold.nii.gz");
    }

    #[test]
    fn test_phase_encoding_round_trip_and_rejection() {
        let pe: PhaseEncodingDirection = "k".parse().unwrap();
        assert_eq!(pe.to_string(), "k");
        assert!("x-".parse::<PhaseEncodingDirection>().is_err());
    }
}
