//! On-disk synthetic datasets.

use crate::io::{write_series, write_volume, TimeSeries, Volume};
use crate::spatial::ImageGeometry;
use ndarray::Array3;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const REPETITION_TIME: f64 = 2.0;
const VOLUMES: usize = 3;

/// A temporary dataset tree with tiny images and JSON sidecars.
///
/// Builder methods write their files immediately; the tree lives as long as
/// the value.
#[derive(Debug)]
pub struct SyntheticDataset {
    root: TempDir,
    subject: String,
    session: String,
}

impl SyntheticDataset {
    /// An empty dataset for one subject/session.
    ///
    /// # Panics
    /// Panics when no temporary directory can be created.
    #[must_use]
    pub fn new(subject: &str, session: &str) -> Self {
        #[allow(clippy::expect_used)]
        let root = TempDir::new().expect("temporary dataset directory");
        Self {
            root,
            subject: subject.to_string(),
            session: session.to_string(),
        }
    }

    /// Root of the raw dataset.
    #[must_use]
    pub fn bids_dir(&self) -> PathBuf {
        self.root.path().join("bids")
    }

    /// A derivative root next to the dataset.
    #[must_use]
    pub fn out_dir(&self) -> PathBuf {
        self.root.path().join("derivatives")
    }

    /// A scratch root next to the dataset.
    #[must_use]
    pub fn scratch_dir(&self) -> PathBuf {
        self.root.path().join("scratch")
    }

    fn modality_dir(&self, session: &str, modality: &str) -> PathBuf {
        self.bids_dir()
            .join(format!("sub-{}", self.subject))
            .join(format!("ses-{session}"))
            .join(modality)
    }

    fn stem(&self, session: &str) -> String {
        format!("sub-{}_ses-{session}", self.subject)
    }

    /// An MPRAGE structural in the dataset's session.
    #[must_use]
    pub fn with_mprage(self, run: &str) -> Self {
        let session = self.session.clone();
        self.with_mprage_in_session(&session, run)
    }

    /// An MPRAGE structural in another session of the subject.
    #[must_use]
    pub fn with_mprage_in_session(self, session: &str, run: &str) -> Self {
        let path = self
            .modality_dir(session, "anat")
            .join(format!("{}_acq-MPRAGE_run-{run}_T1w.nii.gz", self.stem(session)));
        write_image(&path, anat_geometry(), 1);
        self
    }

    /// A whole-volume functional run.
    #[must_use]
    pub fn with_whole_volume(self, run: &str, pe: &str, time: &str) -> Self {
        let path = self.func_path("wholebrain", run, pe);
        write_image(&path, whole_geometry(), VOLUMES);
        write_sidecar(&path, &functional_sidecar(pe, Some(time), 6));
        self
    }

    /// A slab functional run.
    #[must_use]
    pub fn with_slab(self, task: &str, run: &str, pe: &str, time: &str) -> Self {
        let path = self.func_path(task, run, pe);
        write_image(&path, slab_geometry(), VOLUMES);
        write_sidecar(&path, &functional_sidecar(pe, Some(time), 3));
        self
    }

    /// A slab functional run whose sidecar has no acquisition time.
    #[must_use]
    pub fn with_untimed_slab(self, task: &str, run: &str, pe: &str) -> Self {
        let path = self.func_path(task, run, pe);
        write_image(&path, slab_geometry(), VOLUMES);
        write_sidecar(&path, &functional_sidecar(pe, None, 3));
        self
    }

    /// A phase-difference fieldmap with both magnitudes.
    #[must_use]
    pub fn with_phasediff(self) -> Self {
        let dir = self.modality_dir(&self.session, "fmap");
        let stem = format!("{}_run-01", self.stem(&self.session));
        for suffix in ["magnitude1", "magnitude2"] {
            write_image(&dir.join(format!("{stem}_{suffix}.nii.gz")), whole_geometry(), 1);
        }
        let phasediff = dir.join(format!("{stem}_phasediff.nii.gz"));
        write_image(&phasediff, whole_geometry(), 1);
        write_sidecar(&phasediff, &json!({ "EchoTime1": 0.00492, "EchoTime2": 0.00738 }));
        self
    }

    /// An empty file under `func/`, for names the helpers cannot produce.
    #[must_use]
    pub fn with_raw_func(self, filename: &str) -> Self {
        touch(&self.modality_dir(&self.session, "func").join(filename));
        self
    }

    /// An empty file under `anat/`.
    #[must_use]
    pub fn with_raw_anat(self, filename: &str) -> Self {
        touch(&self.modality_dir(&self.session, "anat").join(filename));
        self
    }

    /// Finishes the tree.
    #[must_use]
    pub fn build(self) -> Self {
        let func = self.modality_dir(&self.session, "func");
        #[allow(clippy::expect_used)]
        std::fs::create_dir_all(func).expect("functional directory");
        self
    }

    fn func_path(&self, task: &str, run: &str, pe: &str) -> PathBuf {
        self.modality_dir(&self.session, "func").join(format!(
            "{}_task-{task}_dir-{}_run-{run}_part-mag_bold.nii.gz",
            self.stem(&self.session),
            direction_label(pe)
        ))
    }
}

fn direction_label(pe: &str) -> &'static str {
    match pe {
        "j" => "PA",
        "j-" => "AP",
        "i" => "LR",
        _ => "RL",
    }
}

fn anat_geometry() -> ImageGeometry {
    ImageGeometry::axis_aligned([8, 8, 8], [2.0, 2.0, 2.0], [-8.0, -8.0, -8.0])
}

fn whole_geometry() -> ImageGeometry {
    ImageGeometry::axis_aligned([6, 6, 6], [3.0, 3.0, 3.0], [-7.5, -7.5, -7.5])
}

fn slab_geometry() -> ImageGeometry {
    ImageGeometry::axis_aligned([6, 6, 3], [2.0, 2.0, 2.0], [-5.0, -5.0, -2.0])
}

fn functional_sidecar(pe: &str, time: Option<&str>, slices: usize) -> Value {
    #[allow(clippy::cast_precision_loss)]
    let timing: Vec<f64> = (0..slices).map(|s| REPETITION_TIME * s as f64 / slices as f64).collect();
    let mut sidecar = json!({
        "RepetitionTime": REPETITION_TIME,
        "SliceTiming": timing,
        "PhaseEncodingDirection": pe,
        "EffectiveEchoSpacing": 0.00058,
    });
    if let (Some(time), Some(map)) = (time, sidecar.as_object_mut()) {
        map.insert("AcquisitionTime".into(), json!(time));
    }
    sidecar
}

#[allow(clippy::cast_precision_loss, clippy::expect_used)]
fn write_image(path: &Path, geometry: ImageGeometry, volumes: usize) {
    let [ni, nj, nk] = geometry.shape;
    let frame = |t: usize| Array3::from_shape_fn((ni, nj, nk), |(i, j, k)| (1 + i + 2 * j + 3 * k + t) as f32);
    if volumes == 1 {
        write_volume(path, &Volume { geometry, data: frame(0) }).expect("synthetic volume");
    } else {
        let series = TimeSeries {
            geometry,
            volumes: (0..volumes).map(frame).collect(),
            repetition_time: REPETITION_TIME,
        };
        write_series(path, &series).expect("synthetic series");
    }
}

#[allow(clippy::expect_used)]
fn write_sidecar(image: &Path, sidecar: &Value) {
    let path = crate::dataset::sidecar_path(image);
    std::fs::write(path, sidecar.to_string()).expect("synthetic sidecar");
}

#[allow(clippy::expect_used)]
fn touch(path: &Path) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("fixture directory");
    }
    std::fs::write(path, b"").expect("fixture file");
}
