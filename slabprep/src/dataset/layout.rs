//! Dataset inventory.

use super::entities::FileEntities;
use super::run::{FieldmapEstimator, FieldmapSet, ModalityClass, Run, StructuralRun, NON_SLAB_TASKS, WHOLE_VOLUME_TASK};
use crate::errors::{Result, SlabprepError};
use std::collections::BTreeSet;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Source of runs for one subject/session.
pub trait DatasetLayout: Send + Sync + Debug {
    /// Every structural acquisition of the subject, across all sessions.
    fn structural_runs(&self, subject: &str) -> Result<Vec<StructuralRun>>;

    /// Whole-volume functional runs of the session.
    fn whole_volume_runs(&self, subject: &str, session: &str) -> Result<Vec<Run>>;

    /// Slab functional runs of the session, in no particular order.
    fn slab_runs(&self, subject: &str, session: &str) -> Result<Vec<Run>>;

    /// Fieldmap estimators of the session.
    fn fieldmaps(&self, subject: &str, session: &str) -> Result<Vec<FieldmapEstimator>>;
}

/// A dataset laid out as `sub-*/ses-*/{anat,func,fmap}` with JSON sidecars.
#[derive(Debug, Clone)]
pub struct BidsDirectory {
    root: PathBuf,
}

impl BidsDirectory {
    /// Opens a dataset root.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The dataset root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn subject_dir(&self, subject: &str) -> PathBuf {
        self.root.join(format!("sub-{subject}"))
    }

    fn sessions(&self, subject: &str) -> Result<Vec<String>> {
        let dir = self.subject_dir(subject);
        if !dir.is_dir() {
            return Err(SlabprepError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("subject directory {} does not exist", dir.display()),
            )));
        }
        let mut sessions: Vec<String> = list_names(&dir)?
            .into_iter()
            .filter_map(|n| n.strip_prefix("ses-").map(str::to_string))
            .collect();
        sessions.sort();
        Ok(sessions)
    }

    fn bold_runs(&self, subject: &str, session: &str) -> Result<Vec<(String, PathBuf)>> {
        let func = self.subject_dir(subject).join(format!("ses-{session}")).join("func");
        if !func.is_dir() {
            return Err(SlabprepError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("functional directory {} does not exist", func.display()),
            )));
        }
        let mut out = Vec::new();
        for name in list_names(&func)? {
            let Some(entities) = FileEntities::parse(&name) else {
                continue;
            };
            if entities.suffix != "bold" || entities.extension != ".nii.gz" {
                continue;
            }
            if entities.part.as_deref() == Some("phase") {
                continue;
            }
            let Some(task) = entities.task.clone() else {
                continue;
            };
            if entities.direction.is_none() {
                return Err(SlabprepError::UnsupportedVariant(format!(
                    "functional run '{name}' carries no dir- entity"
                )));
            }
            out.push((task, func.join(&name)));
        }
        out.sort_by(|a, b| a.1.cmp(&b.1));
        Ok(out)
    }
}

fn list_names(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        if let Some(name) = entry?.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

fn require_file(path: PathBuf) -> Result<PathBuf> {
    if path.exists() {
        Ok(path)
    } else {
        Err(SlabprepError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("structural image {} does not exist", path.display()),
        )))
    }
}

impl DatasetLayout for BidsDirectory {
    fn structural_runs(&self, subject: &str) -> Result<Vec<StructuralRun>> {
        let mut seen = BTreeSet::new();
        let mut found = Vec::new();
        for session in self.sessions(subject)? {
            let anat = self.subject_dir(subject).join(format!("ses-{session}")).join("anat");
            if !anat.is_dir() {
                continue;
            }
            for name in list_names(&anat)? {
                let Some(entities) = FileEntities::parse(&name) else {
                    continue;
                };
                let (Some(acq), Some(run)) = (entities.acquisition.as_deref(), entities.run.as_deref()) else {
                    continue;
                };
                let class = match acq {
                    "MP2RAGE" | "UNI" => "MP2RAGE",
                    "MPRAGE" => "MPRAGE",
                    other => {
                        return Err(SlabprepError::UnsupportedVariant(format!(
                            "structural acquisition 'acq-{other}' in {name}"
                        )))
                    }
                };
                if !seen.insert((class, run.to_string())) {
                    continue;
                }
                let stem = format!("sub-{subject}_ses-{session}");
                let load = |file: String| -> Result<Run> {
                    Run::load(&require_file(anat.join(file))?, ModalityClass::Structural)
                };
                let structural = if class == "MP2RAGE" {
                    StructuralRun::Mp2rage {
                        uni: load(format!("{stem}_acq-UNI_run-{run}_MP2RAGE.nii.gz"))?,
                        inv1: load(format!("{stem}_inv-1_run-{run}_part-mag_MP2RAGE.nii.gz"))?,
                        inv2: load(format!("{stem}_inv-2_run-{run}_part-mag_MP2RAGE.nii.gz"))?,
                    }
                } else {
                    StructuralRun::Mprage {
                        t1w: load(format!("{stem}_acq-MPRAGE_run-{run}_T1w.nii.gz"))?,
                    }
                };
                debug!(session = %session, acquisition = class, run = %run, "Found structural run");
                found.push(structural);
            }
        }
        if found.len() > 1 {
            warn!(count = found.len(), "Multiple structural acquisitions found");
        }
        Ok(found)
    }

    fn whole_volume_runs(&self, subject: &str, session: &str) -> Result<Vec<Run>> {
        self.bold_runs(subject, session)?
            .into_iter()
            .filter(|(task, _)| task == WHOLE_VOLUME_TASK)
            .map(|(_, path)| Run::load(&path, ModalityClass::WholeVolumeFunctional))
            .collect()
    }

    fn slab_runs(&self, subject: &str, session: &str) -> Result<Vec<Run>> {
        self.bold_runs(subject, session)?
            .into_iter()
            .filter(|(task, _)| !NON_SLAB_TASKS.contains(&task.as_str()))
            .map(|(_, path)| Run::load(&path, ModalityClass::SlabFunctional))
            .collect()
    }

    fn fieldmaps(&self, subject: &str, session: &str) -> Result<Vec<FieldmapEstimator>> {
        let fmap = self.subject_dir(subject).join(format!("ses-{session}")).join("fmap");
        if !fmap.is_dir() {
            return Ok(Vec::new());
        }
        let mut estimators = Vec::new();
        let mut other_kinds = BTreeSet::new();
        for name in list_names(&fmap)? {
            let Some(entities) = FileEntities::parse(&name) else {
                continue;
            };
            if !entities.is_image() {
                continue;
            }
            match entities.suffix.as_str() {
                "phasediff" => {
                    let sibling = |suffix: &str| fmap.join(name.replace("_phasediff.", &format!("_{suffix}.")));
                    let magnitude1 = Run::load(&require_file(sibling("magnitude1"))?, ModalityClass::Fieldmap)?;
                    let magnitude2_path = sibling("magnitude2");
                    let magnitude2 = if magnitude2_path.exists() {
                        Some(Run::load(&magnitude2_path, ModalityClass::Fieldmap)?)
                    } else {
                        None
                    };
                    let phasediff = Run::load(&fmap.join(&name), ModalityClass::Fieldmap)?;
                    estimators.push(FieldmapEstimator::PhaseDifference(FieldmapSet {
                        magnitude1,
                        magnitude2,
                        phasediff,
                    }));
                }
                "magnitude1" | "magnitude2" => {}
                kind => {
                    if other_kinds.insert(kind.to_string()) {
                        estimators.push(FieldmapEstimator::Other {
                            kind: kind.to_string(),
                            path: fmap.join(&name),
                        });
                    }
                }
            }
        }
        Ok(estimators)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SyntheticDataset;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_discovers_runs_by_class() {
        let ds = SyntheticDataset::new("01", "01")
            .with_mprage("01")
            .with_whole_volume("01", "j", "09:00:00")
            .with_slab("motor", "01", "j", "09:10:00")
            .with_slab("motor", "02", "j", "09:20:00")
            .with_phasediff()
            .build();
        let layout = BidsDirectory::new(ds.bids_dir());

        assert_eq!(layout.structural_runs("01").unwrap().len(), 1);
        assert_eq!(layout.whole_volume_runs("01", "01").unwrap().len(), 1);
        assert_eq!(layout.slab_runs("01", "01").unwrap().len(), 2);
        let fmaps = layout.fieldmaps("01", "01").unwrap();
        assert!(matches!(fmaps.as_slice(), [FieldmapEstimator::PhaseDifference(_)]));
    }

    #[test]
    fn test_phase_part_ignored_and_reversephase_excluded() {
        let ds = SyntheticDataset::new("01", "01")
            .with_mprage("01")
            .with_whole_volume("01", "j", "09:00:00")
            .with_slab("motor", "01", "j", "09:10:00")
            .with_raw_func("sub-01_ses-01_task-motor_dir-AP_run-01_part-phase_bold.nii.gz")
            .with_raw_func("sub-01_ses-01_task-reversephase_dir-PA_run-01_part-mag_bold.nii.gz")
            .build();
        let layout = BidsDirectory::new(ds.bids_dir());
        assert_eq!(layout.slab_runs("01", "01").unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_structural_acquisition_is_unsupported() {
        let ds = SyntheticDataset::new("01", "01")
            .with_raw_anat("sub-01_ses-01_acq-SPACE_run-01_T2w.nii.gz")
            .build();
        let err = BidsDirectory::new(ds.bids_dir()).structural_runs("01").unwrap_err();
        assert!(matches!(err, SlabprepError::UnsupportedVariant(_)));
    }

    #[test]
    fn test_structural_deduplicated_across_sessions() {
        let ds = SyntheticDataset::new("01", "01")
            .with_mprage("01")
            .with_mprage_in_session("02", "01")
            .build();
        assert_eq!(BidsDirectory::new(ds.bids_dir()).structural_runs("01").unwrap().len(), 1);
    }
}
