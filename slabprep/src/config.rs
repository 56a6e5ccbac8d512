//! Pipeline configuration.
//!
//! A [`PipelineConfig`] is built once (from the command line or a JSON file),
//! validated up front, and then shared read-only by every stage constructor.

use crate::errors::ConfigurationError;
use crate::spatial::{DistortionState, LinkStates};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// What an invocation should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Build and execute the full graph.
    #[default]
    Full,
    /// Report the selection and exit without building any stage.
    InfoOnly,
    /// Only the structural branch.
    AnatOnly,
}

/// Task/run substring filters restricting which slab runs are processed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionFilter {
    /// Task label, matched as `_task-{task}_`.
    #[serde(default)]
    pub task: Option<String>,
    /// Run label, matched as `_run-{run}_`.
    #[serde(default)]
    pub run: Option<String>,
}

impl SelectionFilter {
    /// Returns true if the filename passes the task filter (or no filter is set).
    #[must_use]
    pub fn task_matches(&self, filename: &str) -> bool {
        self.task
            .as_ref()
            .map_or(true, |t| filename.contains(&format!("_task-{t}_")))
    }

    /// Returns true if the filename passes the run filter (or no filter is set).
    #[must_use]
    pub fn run_matches(&self, filename: &str) -> bool {
        self.run
            .as_ref()
            .map_or(true, |r| filename.contains(&format!("_run-{r}_")))
    }
}

/// Cost function used by head-motion correction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum HmcCostFunction {
    /// Mutual information.
    Mutualinfo,
    /// Woods.
    Woods,
    /// Correlation ratio.
    Corratio,
    /// Normalised correlation.
    #[default]
    Normcorr,
    /// Normalised mutual information.
    Normmi,
    /// Least squares.
    Leastsquares,
}

impl fmt::Display for HmcCostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Mutualinfo => "mutualinfo",
            Self::Woods => "woods",
            Self::Corratio => "corratio",
            Self::Normcorr => "normcorr",
            Self::Normmi => "normmi",
            Self::Leastsquares => "leastsquares",
        };
        f.write_str(s)
    }
}

/// Head-motion correction settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HmcConfig {
    /// Cost function.
    #[serde(default)]
    pub cost_function: HmcCostFunction,
    /// Low-pass threshold applied to the reference before estimation.
    #[serde(default = "default_lowpass_threshold")]
    pub lowpass_threshold: f64,
    /// Run bias-field correction on the reference before estimation.
    #[serde(default)]
    pub n4: bool,
}

fn default_lowpass_threshold() -> f64 {
    0.2
}

impl Default for HmcConfig {
    fn default() -> Self {
        Self {
            cost_function: HmcCostFunction::default(),
            lowpass_threshold: default_lowpass_threshold(),
            n4: false,
        }
    }
}

/// Structural preprocessing settings forwarded to the external operators.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnatConfig {
    /// MP2RAGE background denoising factor.
    #[serde(default = "default_denoise_factor")]
    pub mp2rage_denoise_factor: u32,
    /// Exclude CSF from the skull-strip mask.
    #[serde(default)]
    pub skullstrip_no_csf: bool,
    /// Working resolution of the skull-strip operator in mm.
    #[serde(default = "default_skullstrip_resolution")]
    pub skullstrip_resolution: f64,
}

fn default_denoise_factor() -> u32 {
    8
}

fn default_skullstrip_resolution() -> f64 {
    1.0
}

impl Default for AnatConfig {
    fn default() -> Self {
        Self {
            mp2rage_denoise_factor: default_denoise_factor(),
            skullstrip_no_csf: false,
            skullstrip_resolution: default_skullstrip_resolution(),
        }
    }
}

/// Settings for one registration link of the frame hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationLinkConfig {
    /// Degrees of freedom: 6 (rigid), 9 or 12 (affine).
    pub dof: u8,
    /// Use the boundary-based cost function.
    #[serde(default)]
    pub bbr: bool,
    /// Estimate the link between distortion-corrected images.
    #[serde(default = "default_undistorted")]
    pub undistorted: bool,
}

fn default_undistorted() -> bool {
    true
}

impl RegistrationLinkConfig {
    /// Creates a link configuration with the given degrees of freedom.
    #[must_use]
    pub const fn new(dof: u8) -> Self {
        Self {
            dof,
            bbr: false,
            undistorted: true,
        }
    }

    /// Enables or disables the boundary-based cost.
    #[must_use]
    pub const fn with_bbr(mut self, bbr: bool) -> Self {
        self.bbr = bbr;
        self
    }

    /// Sets the distortion state the link is estimated in.
    #[must_use]
    pub const fn with_undistorted(mut self, undistorted: bool) -> Self {
        self.undistorted = undistorted;
        self
    }
}

/// The three registration links from slab to anatomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationLinks {
    /// Whole-volume reference to anatomical.
    #[serde(default = "default_whole_to_anat")]
    pub whole_to_anat: RegistrationLinkConfig,
    /// Slab-reference to whole-volume.
    #[serde(default = "default_rigid")]
    pub slabref_to_whole: RegistrationLinkConfig,
    /// Slab to slab-reference.
    #[serde(default = "default_rigid")]
    pub slab_to_slabref: RegistrationLinkConfig,
}

fn default_whole_to_anat() -> RegistrationLinkConfig {
    RegistrationLinkConfig::new(9)
}

fn default_rigid() -> RegistrationLinkConfig {
    RegistrationLinkConfig::new(6)
}

impl Default for RegistrationLinks {
    fn default() -> Self {
        Self {
            whole_to_anat: default_whole_to_anat(),
            slabref_to_whole: default_rigid(),
            slab_to_slabref: default_rigid(),
        }
    }
}

impl RegistrationLinks {
    fn iter(&self) -> impl Iterator<Item = (&'static str, &RegistrationLinkConfig)> {
        [
            ("whole_to_anat", &self.whole_to_anat),
            ("slabref_to_whole", &self.slabref_to_whole),
            ("slab_to_slabref", &self.slab_to_slabref),
        ]
        .into_iter()
    }
}

/// Command templates for the external operators, keyed by operator name.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ToolboxConfig {
    /// Template per operator; `{in:port}`, `{out:port}`, `{param:name}` and `{workdir}` are substituted.
    #[serde(default)]
    pub templates: BTreeMap<String, String>,
    /// Shell used to run rendered templates.
    #[serde(default = "default_shell")]
    pub shell: String,
}

fn default_shell() -> String {
    "sh".to_string()
}

impl ToolboxConfig {
    /// Returns the template for an operator.
    #[must_use]
    pub fn template(&self, operator: &str) -> Option<&str> {
        self.templates.get(operator).map(String::as_str)
    }

    /// Sets a template.
    #[must_use]
    pub fn with_template(mut self, operator: impl Into<String>, template: impl Into<String>) -> Self {
        self.templates.insert(operator.into(), template.into());
        self
    }
}

/// Immutable configuration for one subject/session invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Subject label without the `sub-` prefix.
    pub subject: String,
    /// Session label without the `ses-` prefix.
    pub session: String,
    /// Raw dataset root.
    pub bids_dir: PathBuf,
    /// Derivative root.
    pub out_dir: PathBuf,
    /// Scratch space for intermediate files.
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
    /// Slab run filters.
    #[serde(default)]
    pub filter: SelectionFilter,
    /// Invocation mode.
    #[serde(default)]
    pub mode: RunMode,
    /// Susceptibility distortion correction.
    #[serde(default = "default_true")]
    pub sdc_enabled: bool,
    /// Prepare the phase-difference fieldmap with `fsl_prepare_fieldmap` (rad/s) instead of the default preparation (Hz).
    #[serde(default)]
    pub fmap_gre_fsl: bool,
    /// Slice-timing correction.
    #[serde(default = "default_true")]
    pub stc_enabled: bool,
    /// Volume used as reference when no single-band reference exists.
    #[serde(default)]
    pub boldref_volume: usize,
    /// Head-motion correction.
    #[serde(default)]
    pub hmc: HmcConfig,
    /// Structural preprocessing.
    #[serde(default)]
    pub anat: AnatConfig,
    /// Registration links.
    #[serde(default)]
    pub links: RegistrationLinks,
    /// Truncate functional runs for a fast debug pass.
    #[serde(default)]
    pub quick: bool,
    /// Number of volumes kept in quick mode.
    #[serde(default = "default_quick_volumes")]
    pub quick_volumes: usize,
    /// Thread count handed to external operators.
    #[serde(default = "default_omp_nthreads")]
    pub omp_nthreads: usize,
    /// External operator templates.
    #[serde(default)]
    pub toolbox: ToolboxConfig,
}

fn default_scratch_dir() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_true() -> bool {
    true
}

fn default_quick_volumes() -> usize {
    10
}

fn default_omp_nthreads() -> usize {
    8
}

impl PipelineConfig {
    /// Creates a configuration with defaults for everything but identity and roots.
    #[must_use]
    pub fn new(
        subject: impl Into<String>,
        session: impl Into<String>,
        bids_dir: impl Into<PathBuf>,
        out_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            subject: subject.into(),
            session: session.into(),
            bids_dir: bids_dir.into(),
            out_dir: out_dir.into(),
            scratch_dir: default_scratch_dir(),
            filter: SelectionFilter::default(),
            mode: RunMode::default(),
            sdc_enabled: true,
            fmap_gre_fsl: false,
            stc_enabled: true,
            boldref_volume: 0,
            hmc: HmcConfig::default(),
            anat: AnatConfig::default(),
            links: RegistrationLinks::default(),
            quick: false,
            quick_volumes: default_quick_volumes(),
            omp_nthreads: default_omp_nthreads(),
            toolbox: ToolboxConfig::default(),
        }
    }

    /// Loads a configuration from a JSON file.
    pub fn from_json_file(path: &Path) -> crate::errors::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        Ok(config)
    }

    /// Sets the scratch directory.
    #[must_use]
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    /// Sets the slab filters.
    #[must_use]
    pub fn with_filter(mut self, filter: SelectionFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Sets the invocation mode.
    #[must_use]
    pub const fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    /// Disables distortion correction; every link falls back to the distorted state.
    #[must_use]
    pub const fn fmapless(mut self) -> Self {
        self.sdc_enabled = false;
        self.links.whole_to_anat.undistorted = false;
        self.links.slabref_to_whole.undistorted = false;
        self.links.slab_to_slabref.undistorted = false;
        self
    }

    /// Selects FSL fieldmap preparation.
    #[must_use]
    pub const fn with_fmap_gre_fsl(mut self, enabled: bool) -> Self {
        self.fmap_gre_fsl = enabled;
        self
    }

    /// Enables or disables slice-timing correction.
    #[must_use]
    pub const fn with_stc(mut self, enabled: bool) -> Self {
        self.stc_enabled = enabled;
        self
    }

    /// Sets the registration links.
    #[must_use]
    pub const fn with_links(mut self, links: RegistrationLinks) -> Self {
        self.links = links;
        self
    }

    /// Enables quick mode.
    #[must_use]
    pub const fn with_quick(mut self, quick: bool) -> Self {
        self.quick = quick;
        self
    }

    /// Sets the toolbox templates.
    #[must_use]
    pub fn with_toolbox(mut self, toolbox: ToolboxConfig) -> Self {
        self.toolbox = toolbox;
        self
    }

    /// `sub-XX` label.
    #[must_use]
    pub fn subject_label(&self) -> String {
        format!("sub-{}", self.subject)
    }

    /// `ses-YY` label.
    #[must_use]
    pub fn session_label(&self) -> String {
        format!("ses-{}", self.session)
    }

    /// Number of volumes functional runs are truncated to, if any.
    #[must_use]
    pub const fn truncate_to(&self) -> Option<usize> {
        if self.quick {
            Some(self.quick_volumes)
        } else {
            None
        }
    }

    /// Distortion states the three registration links are estimated in.
    #[must_use]
    pub const fn link_states(&self) -> LinkStates {
        LinkStates {
            slab_to_slabref: DistortionState::from_undistorted(self.links.slab_to_slabref.undistorted),
            slabref_to_whole: DistortionState::from_undistorted(self.links.slabref_to_whole.undistorted),
            whole_to_anat: DistortionState::from_undistorted(self.links.whole_to_anat.undistorted),
        }
    }

    /// Checks option consistency.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.subject.trim().is_empty() || self.session.trim().is_empty() {
            return Err(ConfigurationError::inconsistent(
                "subject and session labels must not be empty",
            ));
        }
        for (name, link) in self.links.iter() {
            if !matches!(link.dof, 6 | 9 | 12) {
                return Err(ConfigurationError::inconsistent(format!(
                    "registration link '{name}' has unsupported dof {} (expected 6, 9 or 12)",
                    link.dof
                )));
            }
            if link.undistorted && !self.sdc_enabled {
                return Err(ConfigurationError::inconsistent(format!(
                    "registration link '{name}' is configured as undistorted but distortion correction is disabled"
                )));
            }
        }
        if self.quick && self.quick_volumes == 0 {
            return Err(ConfigurationError::inconsistent(
                "quick mode requires at least one volume",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn config() -> PipelineConfig {
        PipelineConfig::new("01", "01", "/data/bids", "/data/derivatives")
    }

    #[test]
    fn test_defaults() {
        let c = config();
        assert_eq!(c.links.whole_to_anat.dof, 9);
        assert_eq!(c.links.slabref_to_whole.dof, 6);
        assert_eq!(c.hmc.cost_function, HmcCostFunction::Normcorr);
        assert!((c.hmc.lowpass_threshold - 0.2).abs() < f64::EPSILON);
        assert_eq!(c.scratch_dir, PathBuf::from("/tmp"));
        assert_eq!(c.truncate_to(), None);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_undistorted_link_requires_sdc() {
        let mut c = config();
        c.sdc_enabled = false;
        let err = c.validate().unwrap_err();
        assert_eq!(err.error_info.code, "CONFIG-003-INCONSISTENT");

        assert!(config().fmapless().validate().is_ok());
    }

    #[test]
    fn test_link_states_follow_sdc() {
        assert_eq!(config().link_states(), LinkStates::corrected());
        assert_eq!(config().fmapless().link_states(), LinkStates::distorted());
    }

    #[test]
    fn test_invalid_dof_rejected() {
        let mut links = RegistrationLinks::default();
        links.slab_to_slabref.dof = 7;
        assert!(config().with_links(links).validate().is_err());
    }

    #[test]
    fn test_filter_matching() {
        let filter = SelectionFilter {
            task: Some("motor".into()),
            run: Some("02".into()),
        };
        let name = "sub-01_ses-01_task-motor_dir-AP_run-02_part-mag_bold.nii.gz";
        assert!(filter.task_matches(name));
        assert!(filter.run_matches(name));
        assert!(!filter.run_matches("sub-01_ses-01_task-motor_dir-AP_run-01_part-mag_bold.nii.gz"));
        assert!(SelectionFilter::default().task_matches("anything"));
    }

    #[test]
    fn test_json_round_trip_with_defaults() {
        let json = r#"{"subject":"01","session":"02","bids_dir":"/b","out_dir":"/o","quick":true}"#;
        let c: PipelineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(c.truncate_to(), Some(10));
        assert!(c.sdc_enabled);
        assert!(!c.fmap_gre_fsl);
        assert_eq!(c.session_label(), "ses-02");
    }

    #[test]
    fn test_fmap_gre_fsl_from_json() {
        let json = r#"{"subject":"01","session":"02","bids_dir":"/b","out_dir":"/o","fmap_gre_fsl":true}"#;
        let c: PipelineConfig = serde_json::from_str(json).unwrap();
        assert!(c.fmap_gre_fsl);
        assert!(c.validate().is_ok());
    }
}
