//! Deterministic derivative paths.
//!
//! Every artifact name is derived from the raw filename by replacing its
//! suffix, so a later invocation can recognise completed work by path alone.

use crate::dataset::{Run, StructuralRun};
use crate::spatial::DistortionState;
use std::path::{Path, PathBuf};

/// Raw functional suffix replaced by every functional derivative name.
pub const RAW_SUFFIX: &str = "part-mag_bold.nii.gz";

/// Replaces the raw suffix of a functional filename.
///
/// Files without a `part-` entity fall back to replacing `bold.nii.gz`.
#[must_use]
pub fn derive_name(filename: &str, suffix: &str) -> String {
    if let Some(stem) = filename.strip_suffix(RAW_SUFFIX) {
        format!("{stem}{suffix}")
    } else if let Some(stem) = filename.strip_suffix("bold.nii.gz") {
        format!("{stem}{suffix}")
    } else {
        format!("{filename}_{suffix}")
    }
}

/// The two functional reference families that persist their own outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceRole {
    /// Whole-volume run, registered to the anatomical image.
    WholeVolume,
    /// Slab-reference run, registered to the whole-volume run.
    SlabReference,
}

impl ReferenceRole {
    /// Tag used in `from-`/`to-` entities.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::WholeVolume => "wholebrain",
            Self::SlabReference => "slabref",
        }
    }

    /// Parent tag in `reg/` and `figures/` names.
    #[must_use]
    pub const fn parent_tag(self) -> &'static str {
        match self {
            Self::WholeVolume => "T1w",
            Self::SlabReference => "wholebrain",
        }
    }

    /// Parent tag in ITK/FSL transform names.
    #[must_use]
    pub const fn parent_xfm_tag(self) -> &'static str {
        match self {
            Self::WholeVolume => "t1",
            Self::SlabReference => "wholebrain",
        }
    }

    /// Checkpoint name of the family.
    #[must_use]
    pub const fn checkpoint(self) -> &'static str {
        match self {
            Self::WholeVolume => "wholebrain_bold",
            Self::SlabReference => "slabref_bold",
        }
    }
}

/// Derivative root with its fixed pipeline subdirectories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivativeLayout {
    root: PathBuf,
}

impl DerivativeLayout {
    /// Creates a layout rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The derivative root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_dir(&self, pipeline: &str, run: &Run) -> PathBuf {
        let e = &run.entities;
        self.root
            .join(pipeline)
            .join(format!("sub-{}", e.subject.as_deref().unwrap_or_default()))
            .join(format!("ses-{}", e.session.as_deref().unwrap_or_default()))
    }

    /// Skull-stripped functional reference and its mask.
    #[must_use]
    pub fn bold_brainmask(&self, run: &Run) -> BrainmaskPaths {
        let dir = self.run_dir("brainmask", run).join("func");
        let name = run.filename();
        let replace = |suffix: &str| match name.strip_suffix("bold.nii.gz") {
            Some(stem) => format!("{stem}{suffix}"),
            None => derive_name(name, suffix),
        };
        BrainmaskPaths {
            brain: dir.join(replace("desc-brain_bold.nii.gz")),
            mask: dir.join(replace("desc-brain_mask.nii.gz")),
        }
    }

    /// Skull-stripped structural image and its mask.
    #[must_use]
    pub fn structural_brainmask(&self, structural: &StructuralRun) -> BrainmaskPaths {
        let (sub, ses) = structural.labels();
        let dir = self.root.join("brainmask").join(sub).join(ses).join("anat");
        let base = structural.base_name();
        BrainmaskPaths {
            brain: dir.join(format!("{base}_desc-brain_T1w.nii.gz")),
            mask: dir.join(format!("{base}_desc-brain_mask.nii.gz")),
        }
    }

    /// Structural preprocessing outputs.
    #[must_use]
    pub fn anat_preproc(&self, structural: &StructuralRun) -> AnatPreprocPaths {
        let (sub, ses) = structural.labels();
        let dir = self.root.join("smriprep").join(sub).join(ses).join("anat");
        let base = structural.base_name();
        let file = |suffix: &str| dir.join(format!("{base}_{suffix}"));
        AnatPreprocPaths {
            t1w: file("desc-preproc_T1w.nii.gz"),
            mask: file("desc-brain_mask.nii.gz"),
            dseg: file("desc-brain_dseg.nii.gz"),
            gm: file("label-GM_desc-brain_probseg.nii.gz"),
            wm: file("label-WM_desc-brain_probseg.nii.gz"),
            csf: file("label-CSF_desc-brain_probseg.nii.gz"),
            fsnative_xfm: file("from-fsnative_to-T1w_mode-image_xfm.txt"),
            mni_xfm: file("from-MNI152NLin2009cAsym_to-T1w_mode-image_xfm.h5"),
        }
    }

    /// Preprocessed fieldmap of a subject/session.
    #[must_use]
    pub fn fieldmap(&self, subject_label: &str, session_label: &str) -> FieldmapPaths {
        let dir = self
            .root
            .join("sdcflows")
            .join(subject_label)
            .join(session_label)
            .join("fmap");
        let base = format!("{subject_label}_{session_label}_fmapid-auto00000");
        FieldmapPaths {
            magnitude: dir.join(format!("{base}_desc-magnitude_fieldmap.nii.gz")),
            fieldmap: dir.join(format!("{base}_desc-preproc_fieldmap.nii.gz")),
        }
    }

    /// Outputs of a reference family (whole-volume or slab-reference).
    #[must_use]
    pub fn reference(&self, run: &Run, role: ReferenceRole) -> ReferencePaths {
        let dir = self.run_dir("bold_preproc", run);
        let name = run.filename();
        let family_dir = dir.join(format!("{}_bold", role.tag()));
        let distorted = family_dir.join("distorted");
        let undistorted = family_dir.join("undistorted");
        let (tag, parent, parent_xfm) = (role.tag(), role.parent_tag(), role.parent_xfm_tag());
        ReferencePaths {
            role,
            space_t1w_boldref: dir.join("func").join(derive_name(name, "space-T1w_boldref.nii.gz")),
            reg_mat: dir.join("reg").join(derive_name(name, &format!("from-{tag}_to-{parent}_xfm.mat"))),
            figure: dir.join("figures").join(derive_name(name, &format!("from-{tag}_to-{parent}.svg"))),
            boldref: distorted.join(derive_name(name, "boldref.nii.gz")),
            brainmask: distorted.join(derive_name(name, "brainmask.nii.gz")),
            dseg: distorted.join(derive_name(name, "dseg.nii.gz")),
            itk_forward: distorted.join(derive_name(name, &format!("from-{tag}_to-{parent_xfm}_xfm.itk.txt"))),
            itk_inverse: distorted.join(derive_name(name, &format!("from-{parent_xfm}_to-{tag}_xfm.itk.txt"))),
            sdc_itk_forward: undistorted.join(derive_name(
                name,
                &format!("proc-sdc_from-{tag}_to-{parent_xfm}_xfm.itk.txt"),
            )),
            sdc_itk_inverse: undistorted.join(derive_name(
                name,
                &format!("proc-sdc_from-{parent_xfm}_to-{tag}_xfm.itk.txt"),
            )),
            sdc_fsl_forward: undistorted.join(derive_name(
                name,
                &format!("proc-sdc_from-{tag}_to-{parent_xfm}_xfm.fsl.mat"),
            )),
            sdc_fsl_inverse: undistorted.join(derive_name(
                name,
                &format!("proc-sdc_from-{parent_xfm}_to-{tag}_xfm.fsl.mat"),
            )),
            sdc_dseg: undistorted.join(derive_name(name, "proc-sdc_dseg.nii.gz")),
            sdc_boldref: undistorted.join(derive_name(name, "proc-sdc_boldref.nii.gz")),
            sdc_warp: undistorted.join(derive_name(name, "proc-sdc_warp.nii.gz")),
        }
    }

    /// Outputs of a slab run.
    #[must_use]
    pub fn slab(&self, run: &Run) -> SlabPaths {
        let dir = self.run_dir("bold_preproc", run);
        let name = run.filename();
        let func = dir.join("func");
        let reg = dir.join("reg");
        let roi = dir.join("roi");
        SlabPaths {
            boldref: func.join(derive_name(name, "space-T1w_boldref.nii.gz")),
            brainmask: func.join(derive_name(name, "space-T1w_desc-boldref_brainmask.nii.gz")),
            preproc_bold: func.join(derive_name(name, "space-T1w_desc-preproc_bold.nii.gz")),
            hmc_mats: reg.join(derive_name(name, "_hmc.mats")),
            sdc_warp: reg.join(derive_name(name, "sdc_warp.nii.gz")),
            to_slabref_mat: reg.join(derive_name(name, "from-slab_to-slabref_xfm.mat")),
            from_slabref_mat: reg.join(derive_name(name, "from-slabref_to-slab_xfm.mat")),
            figure: dir.join("figures").join(derive_name(name, "from-slab_to-slabref.svg")),
            to_t1w_warp: reg.join(derive_name(name, "from-slab_to-T1w_warp.nii.gz")),
            confounds: ConfoundPaths {
                table: func.join(derive_name(name, "confounds.tsv")),
                roi_figure: dir.join("figures").join(derive_name(name, "desc-confound_roi.svg")),
                acompcor_csf: roi.join(derive_name(name, "desc-confound_roi-csf_aCompCor.nii.gz")),
                acompcor_wm: roi.join(derive_name(name, "desc-confound_roi-wm_aCompCor.nii.gz")),
                acompcor_wmcsf: roi.join(derive_name(name, "desc-confound_roi-wmcsf_aCompCor.nii.gz")),
                tcompcor: roi.join(derive_name(name, "desc-confound_tCompCor.nii.gz")),
                crown_mask: roi.join(derive_name(name, "desc-confound_crownmask.nii.gz")),
            },
        }
    }
}

/// A brain-extracted image and its mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrainmaskPaths {
    /// Brain-extracted image.
    pub brain: PathBuf,
    /// Binary mask.
    pub mask: PathBuf,
}

/// Structural preprocessing outputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnatPreprocPaths {
    /// Bias-corrected T1w.
    pub t1w: PathBuf,
    /// Brain mask.
    pub mask: PathBuf,
    /// Tissue segmentation.
    pub dseg: PathBuf,
    /// Grey-matter probability map.
    pub gm: PathBuf,
    /// White-matter probability map.
    pub wm: PathBuf,
    /// CSF probability map.
    pub csf: PathBuf,
    /// Surface-space to T1w transform.
    pub fsnative_xfm: PathBuf,
    /// Template to T1w transform.
    pub mni_xfm: PathBuf,
}

impl AnatPreprocPaths {
    /// Every artifact, keyed by the operator output port that produces it.
    #[must_use]
    pub fn outputs(&self) -> Vec<(&'static str, PathBuf)> {
        vec![
            ("t1w_preproc", self.t1w.clone()),
            ("t1w_mask", self.mask.clone()),
            ("t1w_dseg", self.dseg.clone()),
            ("tpm_gm", self.gm.clone()),
            ("tpm_wm", self.wm.clone()),
            ("tpm_csf", self.csf.clone()),
            ("fsnative_to_t1w", self.fsnative_xfm.clone()),
            ("template_to_t1w", self.mni_xfm.clone()),
        ]
    }
}

/// Preprocessed fieldmap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldmapPaths {
    /// Magnitude reference.
    pub magnitude: PathBuf,
    /// Fieldmap in Hz.
    pub fieldmap: PathBuf,
}

/// Which optional reference-family outputs a configuration produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceOutputs {
    /// Distortion correction is enabled.
    pub sdc: bool,
    /// State the family's registration to its parent is estimated in.
    pub registration_state: DistortionState,
    /// State the anatomical segmentation is resampled into (the child link's state).
    pub segmentation_state: DistortionState,
}

/// Outputs of a reference family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferencePaths {
    /// The family.
    pub role: ReferenceRole,
    /// Reference resampled into T1w space (whole-volume only).
    pub space_t1w_boldref: PathBuf,
    /// FSL registration to the parent frame.
    pub reg_mat: PathBuf,
    /// Registration report.
    pub figure: PathBuf,
    /// Distorted brain-extracted reference.
    pub boldref: PathBuf,
    /// Distorted brain mask.
    pub brainmask: PathBuf,
    /// Segmentation in the distorted frame.
    pub dseg: PathBuf,
    /// ITK forward transform estimated on distorted images.
    pub itk_forward: PathBuf,
    /// ITK inverse transform estimated on distorted images.
    pub itk_inverse: PathBuf,
    /// ITK forward transform estimated on corrected images.
    pub sdc_itk_forward: PathBuf,
    /// ITK inverse transform estimated on corrected images.
    pub sdc_itk_inverse: PathBuf,
    /// FSL forward transform estimated on corrected images.
    pub sdc_fsl_forward: PathBuf,
    /// FSL inverse transform estimated on corrected images.
    pub sdc_fsl_inverse: PathBuf,
    /// Segmentation in the corrected frame.
    pub sdc_dseg: PathBuf,
    /// Distortion-corrected reference.
    pub sdc_boldref: PathBuf,
    /// Distortion field.
    pub sdc_warp: PathBuf,
}

impl ReferencePaths {
    /// Segmentation path for the given state.
    #[must_use]
    pub fn dseg_at(&self, state: DistortionState) -> &Path {
        match state {
            DistortionState::Distorted => &self.dseg,
            DistortionState::Corrected => &self.sdc_dseg,
        }
    }

    /// Artifacts written for a configuration, keyed by the logical output they hold.
    #[must_use]
    pub fn outputs(&self, opts: ReferenceOutputs) -> Vec<(&'static str, PathBuf)> {
        let mut out = vec![
            ("boldref", self.boldref.clone()),
            ("mask", self.brainmask.clone()),
            ("forward_mat", self.reg_mat.clone()),
            ("report", self.figure.clone()),
            ("dseg", self.dseg_at(opts.segmentation_state).to_path_buf()),
        ];
        match opts.registration_state {
            DistortionState::Distorted => {
                out.push(("forward_itk", self.itk_forward.clone()));
                out.push(("inverse_itk", self.itk_inverse.clone()));
            }
            DistortionState::Corrected => {
                out.push(("forward_itk", self.sdc_itk_forward.clone()));
                out.push(("inverse_itk", self.sdc_itk_inverse.clone()));
                out.push(("forward_mat", self.sdc_fsl_forward.clone()));
                out.push(("inverse_mat", self.sdc_fsl_inverse.clone()));
            }
        }
        if opts.sdc {
            out.push(("corrected", self.sdc_boldref.clone()));
            out.push(("sdc_warp", self.sdc_warp.clone()));
        }
        if self.role == ReferenceRole::WholeVolume {
            out.push(("space_t1w_boldref", self.space_t1w_boldref.clone()));
        }
        out
    }
}

/// Outputs of a slab run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlabPaths {
    /// Reference in T1w space.
    pub boldref: PathBuf,
    /// Mask in T1w space.
    pub brainmask: PathBuf,
    /// Final resampled series.
    pub preproc_bold: PathBuf,
    /// Directory of per-volume motion matrices.
    pub hmc_mats: PathBuf,
    /// Distortion field.
    pub sdc_warp: PathBuf,
    /// FSL slab to slab-reference transform.
    pub to_slabref_mat: PathBuf,
    /// FSL slab-reference to slab transform.
    pub from_slabref_mat: PathBuf,
    /// Registration report.
    pub figure: PathBuf,
    /// Composed static field into T1w space.
    pub to_t1w_warp: PathBuf,
    /// Nuisance regressors and their masks.
    pub confounds: ConfoundPaths,
}

/// Confound table, CompCor masks and their report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfoundPaths {
    /// Tab-separated regressor table.
    pub table: PathBuf,
    /// Mask overlay report.
    pub roi_figure: PathBuf,
    /// Anatomical CompCor CSF mask.
    pub acompcor_csf: PathBuf,
    /// Anatomical CompCor white-matter mask.
    pub acompcor_wm: PathBuf,
    /// Anatomical CompCor combined mask.
    pub acompcor_wmcsf: PathBuf,
    /// Temporal CompCor mask.
    pub tcompcor: PathBuf,
    /// Brain-edge crown mask.
    pub crown_mask: PathBuf,
}

impl ConfoundPaths {
    /// Artifacts keyed by the confound operator port that produces them.
    #[must_use]
    pub fn outputs(&self) -> Vec<(&'static str, PathBuf)> {
        vec![
            ("confounds", self.table.clone()),
            ("rois_plot", self.roi_figure.clone()),
            ("acompcor_csf", self.acompcor_csf.clone()),
            ("acompcor_wm", self.acompcor_wm.clone()),
            ("acompcor_wmcsf", self.acompcor_wmcsf.clone()),
            ("tcompcor", self.tcompcor.clone()),
            ("crown_mask", self.crown_mask.clone()),
        ]
    }
}

impl SlabPaths {
    /// Artifacts written for a slab, keyed by the logical output they hold.
    #[must_use]
    pub fn outputs(&self, sdc: bool, is_reference: bool) -> Vec<(&'static str, PathBuf)> {
        let mut out = vec![
            ("space_t1w_boldref", self.boldref.clone()),
            ("space_t1w_mask", self.brainmask.clone()),
            ("preproc_bold", self.preproc_bold.clone()),
            ("hmc_mats", self.hmc_mats.clone()),
            ("static_warp", self.to_t1w_warp.clone()),
        ];
        out.extend(self.confounds.outputs());
        if sdc {
            out.push(("sdc_warp", self.sdc_warp.clone()));
        }
        if !is_reference {
            out.push(("forward_mat", self.to_slabref_mat.clone()));
            out.push(("inverse_mat", self.from_slabref_mat.clone()));
            out.push(("report", self.figure.clone()));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{FileEntities, ModalityClass, RunMetadata};
    use pretty_assertions::assert_eq;

    fn run(name: &str) -> Run {
        Run::from_parts(
            PathBuf::from(format!("/bids/sub-01/ses-02/func/{name}")),
            FileEntities::parse(name).unwrap(),
            RunMetadata::default(),
            ModalityClass::SlabFunctional,
        )
    }

    #[test]
    fn test_slab_names_are_bit_exact() {
        let layout = DerivativeLayout::new("/out");
        let paths = layout.slab(&run("sub-01_ses-02_task-motor_dir-AP_run-01_part-mag_bold.nii.gz"));
        assert_eq!(
            paths.preproc_bold,
            PathBuf::from("/out/bold_preproc/sub-01/ses-02/func/sub-01_ses-02_task-motor_dir-AP_run-01_space-T1w_desc-preproc_bold.nii.gz")
        );
        assert_eq!(
            paths.hmc_mats,
            PathBuf::from("/out/bold_preproc/sub-01/ses-02/reg/sub-01_ses-02_task-motor_dir-AP_run-01__hmc.mats")
        );
        assert_eq!(
            paths.figure,
            PathBuf::from("/out/bold_preproc/sub-01/ses-02/figures/sub-01_ses-02_task-motor_dir-AP_run-01_from-slab_to-slabref.svg")
        );
    }

    #[test]
    fn test_brainmask_keeps_part_entity() {
        let layout = DerivativeLayout::new("/out");
        let paths = layout.bold_brainmask(&run("sub-01_ses-02_task-motor_dir-AP_run-01_part-mag_bold.nii.gz"));
        assert_eq!(
            paths.brain,
            PathBuf::from("/out/brainmask/sub-01/ses-02/func/sub-01_ses-02_task-motor_dir-AP_run-01_part-mag_desc-brain_bold.nii.gz")
        );
    }

    #[test]
    fn test_reference_names() {
        let layout = DerivativeLayout::new("/out");
        let whole = layout.reference(
            &run("sub-01_ses-02_task-wholebrain_dir-AP_run-01_part-mag_bold.nii.gz"),
            ReferenceRole::WholeVolume,
        );
        assert!(whole.reg_mat.ends_with("reg/sub-01_ses-02_task-wholebrain_dir-AP_run-01_from-wholebrain_to-T1w_xfm.mat"));
        assert!(whole
            .sdc_fsl_inverse
            .ends_with("wholebrain_bold/undistorted/sub-01_ses-02_task-wholebrain_dir-AP_run-01_proc-sdc_from-t1_to-wholebrain_xfm.fsl.mat"));

        let slabref = layout.reference(
            &run("sub-01_ses-02_task-motor_dir-AP_run-01_part-mag_bold.nii.gz"),
            ReferenceRole::SlabReference,
        );
        assert!(slabref
            .itk_forward
            .ends_with("slabref_bold/distorted/sub-01_ses-02_task-motor_dir-AP_run-01_from-slabref_to-wholebrain_xfm.itk.txt"));
    }

    #[test]
    fn test_reference_outputs_follow_states() {
        let layout = DerivativeLayout::new("/out");
        let paths = layout.reference(
            &run("sub-01_ses-02_task-motor_dir-AP_run-01_part-mag_bold.nii.gz"),
            ReferenceRole::SlabReference,
        );
        let distorted = paths.outputs(ReferenceOutputs {
            sdc: false,
            registration_state: DistortionState::Distorted,
            segmentation_state: DistortionState::Distorted,
        });
        assert_eq!(distorted.len(), 7);
        assert!(distorted.iter().all(|(_, p)| !p.to_string_lossy().contains("undistorted")));

        let corrected = paths.outputs(ReferenceOutputs {
            sdc: true,
            registration_state: DistortionState::Corrected,
            segmentation_state: DistortionState::Corrected,
        });
        assert!(corrected.iter().any(|(k, p)| *k == "dseg" && p == &paths.sdc_dseg));
        assert!(corrected.iter().any(|(k, _)| *k == "sdc_warp"));
    }

    #[test]
    fn test_whole_volume_writes_one_t1w_reference() {
        let layout = DerivativeLayout::new("/out");
        let paths = layout.reference(
            &run("sub-01_ses-02_task-wholebrain_dir-AP_run-01_part-mag_bold.nii.gz"),
            ReferenceRole::WholeVolume,
        );
        let outputs = paths.outputs(ReferenceOutputs {
            sdc: true,
            registration_state: DistortionState::Corrected,
            segmentation_state: DistortionState::Corrected,
        });
        let t1w: Vec<_> = outputs.iter().filter(|(k, _)| *k == "space_t1w_boldref").collect();
        assert_eq!(t1w.len(), 1);
        assert_eq!(t1w[0].1, paths.space_t1w_boldref);
        assert!(outputs.iter().all(|(_, p)| !p.to_string_lossy().contains("space-T1w_proc-sdc")));
    }

    #[test]
    fn test_confound_names_are_bit_exact() {
        let layout = DerivativeLayout::new("/out");
        let paths = layout.slab(&run("sub-01_ses-02_task-motor_dir-AP_run-01_part-mag_bold.nii.gz"));
        let base = "/out/bold_preproc/sub-01/ses-02";
        let stem = "sub-01_ses-02_task-motor_dir-AP_run-01";
        let confounds = &paths.confounds;
        assert_eq!(confounds.table, PathBuf::from(format!("{base}/func/{stem}_confounds.tsv")));
        assert_eq!(confounds.roi_figure, PathBuf::from(format!("{base}/figures/{stem}_desc-confound_roi.svg")));
        assert_eq!(
            confounds.acompcor_csf,
            PathBuf::from(format!("{base}/roi/{stem}_desc-confound_roi-csf_aCompCor.nii.gz"))
        );
        assert_eq!(
            confounds.acompcor_wm,
            PathBuf::from(format!("{base}/roi/{stem}_desc-confound_roi-wm_aCompCor.nii.gz"))
        );
        assert_eq!(
            confounds.acompcor_wmcsf,
            PathBuf::from(format!("{base}/roi/{stem}_desc-confound_roi-wmcsf_aCompCor.nii.gz"))
        );
        assert_eq!(confounds.tcompcor, PathBuf::from(format!("{base}/roi/{stem}_desc-confound_tCompCor.nii.gz")));
        assert_eq!(confounds.crown_mask, PathBuf::from(format!("{base}/roi/{stem}_desc-confound_crownmask.nii.gz")));

        let outputs = paths.outputs(false, true);
        for (port, path) in confounds.outputs() {
            assert!(outputs.iter().any(|(k, p)| *k == port && *p == path), "{port} not written");
        }
    }

    #[test]
    fn test_derive_name_without_part_entity() {
        assert_eq!(
            derive_name("sub-01_task-x_run-01_bold.nii.gz", "boldref.nii.gz"),
            "sub-01_task-x_run-01_boldref.nii.gz"
        );
    }
}
