//! Opaque external operations and their declared ports.

use crate::errors::OperatorError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Debug;
use std::path::PathBuf;
use uuid::Uuid;

/// Black-box operations the pipeline delegates to external tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalOp {
    /// Structural background removal and skull stripping.
    AnatBrainmask,
    /// Structural bias correction, segmentation and surface reconstruction.
    AnatPreproc,
    /// Phase-difference fieldmap preparation.
    FmapPreproc,
    /// Phase-difference fieldmap preparation with FSL, in rad/s.
    FslPrepareFieldmap,
    /// Reference-volume extraction from a functional run.
    Boldref,
    /// Functional brain masking guided by a parent reference.
    BoldBrainmask,
    /// Bias-field correction of a single volume.
    BiasCorrection,
    /// Slice-timing correction.
    SliceTiming,
    /// Head-motion estimation against a reference volume.
    MotionCorrection,
    /// Distortion-field estimation from a fieldmap.
    SdcEstimate,
    /// Nuisance regressors and CompCor masks of a T1w-space series.
    Confounds,
}

/// Input and output ports of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperatorDefinition {
    /// Operation name used to look up command templates.
    pub name: &'static str,
    /// Input ports in priority order; the first bound one is the primary input.
    pub inputs: &'static [&'static str],
    /// Output ports with the file (or directory) name they are written to.
    pub outputs: &'static [(&'static str, &'static str)],
}

impl ExternalOp {
    /// Every operation.
    pub const ALL: [Self; 11] = [
        Self::AnatBrainmask,
        Self::AnatPreproc,
        Self::FmapPreproc,
        Self::FslPrepareFieldmap,
        Self::Boldref,
        Self::BoldBrainmask,
        Self::BiasCorrection,
        Self::SliceTiming,
        Self::MotionCorrection,
        Self::SdcEstimate,
        Self::Confounds,
    ];

    /// Declared ports.
    #[must_use]
    pub const fn definition(self) -> OperatorDefinition {
        match self {
            Self::AnatBrainmask => OperatorDefinition {
                name: "anat_brainmask",
                inputs: &["uni", "t1w", "inv1", "inv2"],
                outputs: &[("brain", "brain.nii.gz"), ("mask", "mask.nii.gz")],
            },
            Self::AnatPreproc => OperatorDefinition {
                name: "anat_preproc",
                inputs: &["t1w_brain", "t1w_mask"],
                outputs: &[
                    ("t1w_preproc", "t1w_preproc.nii.gz"),
                    ("t1w_mask", "t1w_mask.nii.gz"),
                    ("t1w_dseg", "t1w_dseg.nii.gz"),
                    ("tpm_gm", "tpm_gm.nii.gz"),
                    ("tpm_wm", "tpm_wm.nii.gz"),
                    ("tpm_csf", "tpm_csf.nii.gz"),
                    ("fsnative_to_t1w", "fsnative_to_t1w.txt"),
                    ("template_to_t1w", "template_to_t1w.h5"),
                ],
            },
            Self::FmapPreproc => OperatorDefinition {
                name: "fmap_preproc",
                inputs: &["magnitude1", "magnitude2", "phasediff"],
                outputs: &[("fmap_ref", "fmap_ref.nii.gz"), ("fmap", "fmap.nii.gz")],
            },
            Self::FslPrepareFieldmap => OperatorDefinition {
                name: "fsl_prepare_fieldmap",
                inputs: &["magnitude1", "phasediff"],
                outputs: &[("fmap_ref", "fmap_ref.nii.gz"), ("fmap", "fmap_rads.nii.gz")],
            },
            Self::Boldref => OperatorDefinition {
                name: "boldref",
                inputs: &["bold"],
                outputs: &[("boldref", "boldref.nii.gz")],
            },
            Self::BoldBrainmask => OperatorDefinition {
                name: "bold_brainmask",
                inputs: &["boldref", "guide_ref", "guide_mask"],
                outputs: &[("brain", "brain.nii.gz"), ("mask", "mask.nii.gz")],
            },
            Self::BiasCorrection => OperatorDefinition {
                name: "bias_correction",
                inputs: &["image"],
                outputs: &[("image", "corrected.nii.gz")],
            },
            Self::SliceTiming => OperatorDefinition {
                name: "slice_timing",
                inputs: &["bold"],
                outputs: &[("bold", "stc_bold.nii.gz")],
            },
            Self::MotionCorrection => OperatorDefinition {
                name: "motion_correction",
                inputs: &["bold", "reference"],
                outputs: &[("mats", "mats"), ("movpar", "movpar.txt")],
            },
            Self::SdcEstimate => OperatorDefinition {
                name: "sdc_estimate",
                inputs: &["boldref", "mask", "fmap_ref", "fmap", "anat"],
                outputs: &[("warp", "sdc_warp.nii.gz"), ("corrected", "corrected.nii.gz")],
            },
            Self::Confounds => OperatorDefinition {
                name: "confounds",
                inputs: &["bold", "mask", "movpar", "t1w_mask", "tpm_gm", "tpm_wm", "tpm_csf"],
                outputs: &[
                    ("confounds", "confounds.tsv"),
                    ("acompcor_csf", "acompcor_csf.nii.gz"),
                    ("acompcor_wm", "acompcor_wm.nii.gz"),
                    ("acompcor_wmcsf", "acompcor_wmcsf.nii.gz"),
                    ("tcompcor", "tcompcor.nii.gz"),
                    ("crown_mask", "crown_mask.nii.gz"),
                    ("rois_plot", "rois.svg"),
                ],
            },
        }
    }

    /// Operation name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        self.definition().name
    }

    /// Output port names.
    #[must_use]
    pub fn output_ports(self) -> Vec<String> {
        self.definition().outputs.iter().map(|(p, _)| (*p).to_string()).collect()
    }
}

impl fmt::Display for ExternalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One call of an external operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorInvocation {
    /// Invocation id, for log correlation.
    pub id: Uuid,
    /// The operation.
    pub op: ExternalOp,
    /// Bound input ports.
    pub inputs: BTreeMap<String, PathBuf>,
    /// Scalar and list parameters.
    pub params: BTreeMap<String, serde_json::Value>,
    /// Directory outputs are written to.
    pub workdir: PathBuf,
}

impl OperatorInvocation {
    /// Creates an invocation with no inputs or parameters.
    #[must_use]
    pub fn new(op: ExternalOp, workdir: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            op,
            inputs: BTreeMap::new(),
            params: BTreeMap::new(),
            workdir: workdir.into(),
        }
    }

    /// Binds an input port.
    #[must_use]
    pub fn with_input(mut self, port: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.inputs.insert(port.into(), path.into());
        self
    }

    /// Sets a parameter.
    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Where each declared output is expected.
    #[must_use]
    pub fn expected_outputs(&self) -> BTreeMap<String, PathBuf> {
        self.op
            .definition()
            .outputs
            .iter()
            .map(|(port, file)| ((*port).to_string(), self.workdir.join(file)))
            .collect()
    }

    /// The first bound input in declaration order.
    #[must_use]
    pub fn primary_input(&self) -> Option<&PathBuf> {
        self.op
            .definition()
            .inputs
            .iter()
            .find_map(|port| self.inputs.get(*port))
    }

    /// Checks that every declared output exists.
    pub fn collect_outputs(&self) -> Result<BTreeMap<String, PathBuf>, OperatorError> {
        let outputs = self.expected_outputs();
        for (port, path) in &outputs {
            if !path.exists() {
                return Err(OperatorError::MissingOutput {
                    operator: self.op.name().to_string(),
                    port: port.clone(),
                    path: path.clone(),
                });
            }
        }
        Ok(outputs)
    }
}

/// Runs opaque external operations.
#[async_trait]
pub trait ExternalToolbox: Send + Sync + Debug {
    /// Runs an invocation and returns its outputs by port.
    async fn run(&self, invocation: &OperatorInvocation) -> Result<BTreeMap<String, PathBuf>, OperatorError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_expected_outputs_live_in_workdir() {
        let inv = OperatorInvocation::new(ExternalOp::MotionCorrection, "/scratch/hmc");
        let outputs = inv.expected_outputs();
        assert_eq!(outputs["mats"], PathBuf::from("/scratch/hmc/mats"));
        assert_eq!(outputs.len(), 2);
    }

    #[test]
    fn test_primary_input_follows_declaration_order() {
        let inv = OperatorInvocation::new(ExternalOp::AnatBrainmask, "/w")
            .with_input("inv1", "/i1.nii.gz")
            .with_input("uni", "/uni.nii.gz");
        assert_eq!(inv.primary_input(), Some(&PathBuf::from("/uni.nii.gz")));
    }

    #[test]
    fn test_missing_output_reported() {
        let dir = TempDir::new().unwrap();
        let inv = OperatorInvocation::new(ExternalOp::Boldref, dir.path());
        let err = inv.collect_outputs().unwrap_err();
        assert!(matches!(err, OperatorError::MissingOutput { ref port, .. } if port == "boldref"));

        std::fs::write(dir.path().join("boldref.nii.gz"), b"").unwrap();
        assert!(inv.collect_outputs().is_ok());
    }

    #[test]
    fn test_names_are_unique() {
        let mut names: Vec<_> = ExternalOp::ALL.iter().map(|op| op.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), ExternalOp::ALL.len());
    }
}
