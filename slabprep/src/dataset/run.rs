//! Discovered scans.

use super::entities::FileEntities;
use super::metadata::{PhaseEncodingDirection, RunMetadata};
use crate::errors::{MetadataError, Result, SlabprepError};
use chrono::NaiveTime;
use std::path::{Path, PathBuf};

/// Task label of whole-volume functional runs.
pub const WHOLE_VOLUME_TASK: &str = "wholebrain";

/// Task labels that never denote a slab run.
pub const NON_SLAB_TASKS: &[&str] = &["wholebrain", "reversephase"];

/// What kind of scan a run is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModalityClass {
    /// MP2RAGE or MPRAGE structural image.
    Structural,
    /// Full-coverage functional reference.
    WholeVolumeFunctional,
    /// Reduced field-of-view functional run.
    SlabFunctional,
    /// Fieldmap image.
    Fieldmap,
}

/// One scan with its parsed entities and sidecar metadata. Immutable once discovered.
#[derive(Debug, Clone, PartialEq)]
pub struct Run {
    /// Absolute path to the image.
    pub path: PathBuf,
    /// Filename entities.
    pub entities: FileEntities,
    /// Sidecar metadata.
    pub metadata: RunMetadata,
    /// Classification.
    pub class: ModalityClass,
}

impl Run {
    /// Loads a run, reading the JSON sidecar next to the image when present.
    pub fn load(path: &Path, class: ModalityClass) -> Result<Self> {
        let name = file_name(path)?;
        let entities = FileEntities::parse(name)
            .ok_or_else(|| SlabprepError::UnsupportedVariant(format!("unparseable filename '{name}'")))?;
        let sidecar = sidecar_path(path);
        let metadata = RunMetadata::from_sidecar(&sidecar)?;
        Ok(Self {
            path: path.to_path_buf(),
            entities,
            metadata,
            class,
        })
    }

    /// Builds a run from parts; used by fixtures.
    #[must_use]
    pub fn from_parts(path: PathBuf, entities: FileEntities, metadata: RunMetadata, class: ModalityClass) -> Self {
        Self {
            path,
            entities,
            metadata,
            class,
        }
    }

    /// Image filename.
    #[must_use]
    pub fn filename(&self) -> &str {
        self.path.file_name().and_then(|n| n.to_str()).unwrap_or_default()
    }

    /// Task label.
    #[must_use]
    pub fn task(&self) -> Option<&str> {
        self.entities.task.as_deref()
    }

    /// `task-X_run-Y` label.
    #[must_use]
    pub fn label(&self) -> String {
        self.entities.task_run_label()
    }

    /// Acquisition time.
    #[must_use]
    pub fn acquired_at(&self) -> Option<NaiveTime> {
        self.metadata.acquired_at()
    }

    /// Phase-encoding direction, if recorded.
    #[must_use]
    pub const fn phase_encoding(&self) -> Option<PhaseEncodingDirection> {
        self.metadata.phase_encoding_direction
    }

    /// Repetition time, required for every functional run.
    pub fn repetition_time(&self) -> Result<f64, MetadataError> {
        self.metadata.require_repetition_time(self.filename())
    }
}

/// The selected structural acquisition.
#[derive(Debug, Clone, PartialEq)]
pub enum StructuralRun {
    /// Uniform image plus the two inversion magnitudes.
    Mp2rage {
        /// Uniform (T1-weighted) image.
        uni: Run,
        /// First inversion magnitude.
        inv1: Run,
        /// Second inversion magnitude.
        inv2: Run,
    },
    /// A single T1-weighted image.
    Mprage {
        /// T1-weighted image.
        t1w: Run,
    },
}

impl StructuralRun {
    /// Acquisition label used in derivative names.
    #[must_use]
    pub const fn acquisition(&self) -> &'static str {
        match self {
            Self::Mp2rage { .. } => "MP2RAGE",
            Self::Mprage { .. } => "MPRAGE",
        }
    }

    /// The T1-weighted image.
    #[must_use]
    pub const fn primary(&self) -> &Run {
        match self {
            Self::Mp2rage { uni, .. } => uni,
            Self::Mprage { t1w } => t1w,
        }
    }

    /// Input ports and images handed to the structural brain-masking operator.
    #[must_use]
    pub fn inputs(&self) -> Vec<(&'static str, &Path)> {
        match self {
            Self::Mp2rage { uni, inv1, inv2 } => vec![
                ("uni", uni.path.as_path()),
                ("inv1", inv1.path.as_path()),
                ("inv2", inv2.path.as_path()),
            ],
            Self::Mprage { t1w } => vec![("t1w", t1w.path.as_path())],
        }
    }

    /// `sub-S_ses-E_acq-A_run-R` stem shared by structural derivatives.
    #[must_use]
    pub fn base_name(&self) -> String {
        let e = &self.primary().entities;
        format!(
            "sub-{}_ses-{}_acq-{}_run-{}",
            e.subject.as_deref().unwrap_or_default(),
            e.session.as_deref().unwrap_or_default(),
            self.acquisition(),
            e.run.as_deref().unwrap_or_default()
        )
    }

    /// `(sub-S, ses-E)` the structural was acquired in.
    #[must_use]
    pub fn labels(&self) -> (String, String) {
        let e = &self.primary().entities;
        (
            format!("sub-{}", e.subject.as_deref().unwrap_or_default()),
            format!("ses-{}", e.session.as_deref().unwrap_or_default()),
        )
    }
}

/// A phase-difference fieldmap acquisition.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldmapSet {
    /// First magnitude image.
    pub magnitude1: Run,
    /// Second magnitude image, if acquired.
    pub magnitude2: Option<Run>,
    /// Phase-difference image carrying both echo times.
    pub phasediff: Run,
}

impl FieldmapSet {
    /// The two echo times of the phase difference.
    pub fn echo_times(&self) -> Result<(f64, f64), MetadataError> {
        self.phasediff.metadata.require_echo_times(self.phasediff.filename())
    }
}

/// A fieldmap estimator found in the dataset.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldmapEstimator {
    /// Phase-difference map with magnitudes.
    PhaseDifference(FieldmapSet),
    /// Any other estimator type; not handled by the pipeline.
    Other {
        /// Estimator kind (the file suffix).
        kind: String,
        /// One of its files.
        path: PathBuf,
    },
}

/// Path of the JSON sidecar of an image.
#[must_use]
pub fn sidecar_path(image: &Path) -> PathBuf {
    let name = image.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    let (stem, _) = super::entities::split_extension(name);
    image.with_file_name(format!("{stem}.json"))
}

fn file_name(path: &Path) -> Result<&str> {
    path.file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| SlabprepError::UnsupportedVariant(format!("non UTF-8 path {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_load_reads_sidecar() {
        let dir = TempDir::new().unwrap();
        let image = dir.path().join("sub-01_ses-01_task-motor_dir-AP_run-01_part-mag_bold.nii.gz");
        std::fs::write(&image, b"").unwrap();
        std::fs::write(
            sidecar_path(&image),
            r#"{"RepetitionTime": 3.0, "AcquisitionTime": "09:00:00"}"#,
        )
        .unwrap();

        let run = Run::load(&image, ModalityClass::SlabFunctional).unwrap();
        assert_eq!(run.label(), "task-motor_run-01");
        assert_eq!(run.repetition_time().unwrap(), 3.0);
        assert_eq!(run.acquired_at(), NaiveTime::from_hms_opt(9, 0, 0));
    }

    #[test]
    fn test_structural_base_name() {
        let entities = FileEntities::parse("sub-01_ses-02_acq-MPRAGE_run-01_T1w.nii.gz").unwrap();
        let t1w = Run::from_parts(
            PathBuf::from("/bids/sub-01/ses-02/anat/sub-01_ses-02_acq-MPRAGE_run-01_T1w.nii.gz"),
            entities,
            RunMetadata::default(),
            ModalityClass::Structural,
        );
        let structural = StructuralRun::Mprage { t1w };
        assert_eq!(structural.base_name(), "sub-01_ses-02_acq-MPRAGE_run-01");
        assert_eq!(structural.labels(), ("sub-01".to_string(), "ses-02".to_string()));
        assert_eq!(structural.inputs().len(), 1);
    }
}
