//! Slabprep command line.
//!
//! Plans one subject/session against a BIDS-like dataset, logs the run
//! selection, and executes whatever checkpoints are not yet complete.

use anyhow::{bail, Context, Result};
use clap::Parser;
use slabprep::config::{HmcCostFunction, PipelineConfig, RegistrationLinkConfig, RunMode, SelectionFilter};
use slabprep::context::PipelineContext;
use slabprep::core::StageStatus;
use slabprep::dataset::BidsDirectory;
use slabprep::events::LoggingEventSink;
use slabprep::observability::init_tracing;
use slabprep::operators::{CommandRegistration, CommandToolbox};
use slabprep::pipeline::{Planner, PlannerServices};
use slabprep::resample::KernelResampler;
use slabprep::resume::FilesystemStore;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, Level};

#[derive(Parser, Debug)]
#[command(name = "slabprep")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Registration and single-step resampling of slab fMRI runs", long_about = None)]
struct Cli {
    /// Subject label, without `sub-`
    #[arg(long)]
    subject_id: Option<String>,

    /// Session label, without `ses-`
    #[arg(long)]
    session_id: Option<String>,

    /// Raw dataset root
    #[arg(long)]
    bids_dir: Option<PathBuf>,

    /// Derivative root
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// Scratch directory for intermediate files
    #[arg(long, env = "SLABPREP_SCRATCH_DIR")]
    scratch_dir: Option<PathBuf>,

    /// Threads handed to external operators
    #[arg(long)]
    omp_nthreads: Option<usize>,

    /// Report the run selection and exit
    #[arg(long, conflicts_with = "anat_only")]
    info: bool,

    /// Only run the structural branch
    #[arg(long)]
    anat_only: bool,

    /// Only process slab runs of this task
    #[arg(long)]
    select_task: Option<String>,

    /// Only process slab runs with this run label
    #[arg(long)]
    select_run: Option<String>,

    /// Truncate functional runs for a fast debug pass
    #[arg(long)]
    quick: bool,

    /// Volume used as functional reference
    #[arg(long)]
    boldref_volume: Option<usize>,

    /// Disable slice-timing correction
    #[arg(long)]
    stc_off: bool,

    /// Bias-correct the motion-correction reference
    #[arg(long)]
    hmc_n4: bool,

    /// Motion-correction cost function
    #[arg(long, value_enum)]
    hmc_cost_function: Option<HmcCostFunction>,

    /// Motion-correction low-pass threshold
    #[arg(long)]
    hmc_lowpass_threshold: Option<f64>,

    /// Disable distortion correction; every registration link runs on distorted images
    #[arg(long)]
    fmapless: bool,

    /// Prepare the phase-difference fieldmap with fsl_prepare_fieldmap
    #[arg(long)]
    fmap_gre_fsl: bool,

    /// Register the whole-volume reference on distorted images
    #[arg(long)]
    reg_wholebrain_to_anat_distorted: bool,

    /// Boundary-based whole-volume to anatomical registration
    #[arg(long)]
    reg_wholebrain_to_anat_bbr: bool,

    /// Degrees of freedom of whole-volume to anatomical registration
    #[arg(long)]
    reg_wholebrain_to_anat_dof: Option<u8>,

    /// Register the slab reference on distorted images
    #[arg(long)]
    reg_slabref_to_wholebrain_distorted: bool,

    /// Boundary-based slab-reference to whole-volume registration
    #[arg(long)]
    reg_slabref_to_wholebrain_bbr: bool,

    /// Degrees of freedom of slab-reference to whole-volume registration
    #[arg(long)]
    reg_slabref_to_wholebrain_dof: Option<u8>,

    /// Register slabs to the slab reference on distorted images
    #[arg(long)]
    reg_slab_to_slabref_distorted: bool,

    /// Boundary-based slab to slab-reference registration
    #[arg(long)]
    reg_slab_to_slabref_bbr: bool,

    /// Degrees of freedom of slab to slab-reference registration
    #[arg(long)]
    reg_slab_to_slabref_dof: Option<u8>,

    /// JSON configuration file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,
}

/// Applies the per-link flags on top of a link configuration.
fn apply_link(link: &mut RegistrationLinkConfig, distorted: bool, bbr: bool, dof: Option<u8>) {
    if distorted {
        link.undistorted = false;
    }
    if bbr {
        link.bbr = true;
    }
    if let Some(dof) = dof {
        link.dof = dof;
    }
}

impl Cli {
    fn to_config(&self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_json_file(path)
                .with_context(|| format!("cannot load configuration {}", path.display()))?,
            None => {
                let (Some(subject), Some(session), Some(bids_dir), Some(out_dir)) =
                    (&self.subject_id, &self.session_id, &self.bids_dir, &self.out_dir)
                else {
                    bail!("--subject-id, --session-id, --bids-dir and --out-dir are required without --config");
                };
                PipelineConfig::new(subject.clone(), session.clone(), bids_dir.clone(), out_dir.clone())
            }
        };

        if let Some(subject) = &self.subject_id {
            config.subject.clone_from(subject);
        }
        if let Some(session) = &self.session_id {
            config.session.clone_from(session);
        }
        if let Some(dir) = &self.bids_dir {
            config.bids_dir.clone_from(dir);
        }
        if let Some(dir) = &self.out_dir {
            config.out_dir.clone_from(dir);
        }
        if let Some(dir) = &self.scratch_dir {
            config.scratch_dir.clone_from(dir);
        }
        if let Some(n) = self.omp_nthreads {
            config.omp_nthreads = n;
        }
        if self.info {
            config.mode = RunMode::InfoOnly;
        } else if self.anat_only {
            config.mode = RunMode::AnatOnly;
        }
        if self.select_task.is_some() || self.select_run.is_some() {
            config.filter = SelectionFilter {
                task: self.select_task.clone(),
                run: self.select_run.clone(),
            };
        }
        config.quick |= self.quick;
        if let Some(volume) = self.boldref_volume {
            config.boldref_volume = volume;
        }
        if self.stc_off {
            config.stc_enabled = false;
        }
        config.fmap_gre_fsl |= self.fmap_gre_fsl;
        config.hmc.n4 |= self.hmc_n4;
        if let Some(cost) = self.hmc_cost_function {
            config.hmc.cost_function = cost;
        }
        if let Some(threshold) = self.hmc_lowpass_threshold {
            config.hmc.lowpass_threshold = threshold;
        }

        apply_link(
            &mut config.links.whole_to_anat,
            self.reg_wholebrain_to_anat_distorted,
            self.reg_wholebrain_to_anat_bbr,
            self.reg_wholebrain_to_anat_dof,
        );
        apply_link(
            &mut config.links.slabref_to_whole,
            self.reg_slabref_to_wholebrain_distorted,
            self.reg_slabref_to_wholebrain_bbr,
            self.reg_slabref_to_wholebrain_dof,
        );
        apply_link(
            &mut config.links.slab_to_slabref,
            self.reg_slab_to_slabref_distorted,
            self.reg_slab_to_slabref_bbr,
            self.reg_slab_to_slabref_dof,
        );
        if self.fmapless {
            config = config.fmapless();
        }

        config.validate()?;
        Ok(config)
    }
}

async fn run(cli: &Cli) -> Result<bool> {
    let config = cli.to_config()?;
    info!(
        subject = %config.subject_label(),
        session = %config.session_label(),
        bids_dir = %config.bids_dir.display(),
        out_dir = %config.out_dir.display(),
        mode = ?config.mode,
        sdc = config.sdc_enabled,
        fmap_gre_fsl = config.fmap_gre_fsl,
        stc = config.stc_enabled,
        quick = config.quick,
        "Configuration"
    );

    let nthreads = config.omp_nthreads;
    let services = PlannerServices {
        toolbox: Arc::new(CommandToolbox::new(config.toolbox.clone(), nthreads)),
        registration: Arc::new(CommandRegistration::new(config.toolbox.clone(), nthreads)),
        resampler: Arc::new(KernelResampler),
        store: Arc::new(FilesystemStore),
    };
    let scratch = config
        .scratch_dir
        .join(format!("slabprep_{}_{}", config.subject_label(), config.session_label()));
    let dataset = BidsDirectory::new(config.bids_dir.clone());
    let plan = Planner::new(config, services).plan(&dataset)?;

    // [already processed|task match|run match]
    for line in plan.selection.report_lines() {
        info!("{line}");
    }

    let sink = if cli.verbose {
        LoggingEventSink::debug()
    } else {
        LoggingEventSink::new(Level::INFO)
    };
    let ctx = Arc::new(PipelineContext::new(scratch).with_event_sink(Arc::new(sink)));
    let Some(result) = plan.execute(ctx).await? else {
        info!(resumed = plan.resumed.len(), "Nothing to run");
        return Ok(true);
    };

    if result.success {
        info!(
            stages = result.summary.total_stages,
            duration_ms = result.duration_ms,
            "Pipeline finished"
        );
    } else {
        for stage in result.stages_with_status(StageStatus::Fail) {
            let message = result.outputs[stage].error.as_deref().unwrap_or("unknown error");
            error!(stage, error = message, "Stage failed");
        }
        error!(
            failed = result.summary.failed_stages,
            aborted = result.stages_with_status(StageStatus::Aborted).len(),
            "Pipeline finished with failures"
        );
    }
    Ok(result.success)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_tracing(cli.verbose, cli.json) {
        eprintln!("{e}");
    }
    match run(&cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = %format!("{e:#}"), "slabprep failed");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use slabprep::spatial::DistortionState;

    fn parse(extra: &[&str]) -> Cli {
        let base = [
            "slabprep",
            "--subject-id",
            "01",
            "--session-id",
            "02",
            "--bids-dir",
            "/data/bids",
            "--out-dir",
            "/data/out",
        ];
        Cli::try_parse_from(base.iter().chain(extra)).unwrap()
    }

    #[test]
    fn test_defaults_correct_every_link() {
        let config = parse(&[]).to_config().unwrap();
        assert_eq!(config.mode, RunMode::Full);
        let states = config.link_states();
        assert_eq!(states.whole_to_anat, DistortionState::Corrected);
        assert_eq!(states.slab_to_slabref, DistortionState::Corrected);
    }

    #[test]
    fn test_distorted_flag_opts_one_link_out() {
        let config = parse(&["--reg-slabref-to-wholebrain-distorted", "--reg-slab-to-slabref-dof", "12"])
            .to_config()
            .unwrap();
        let states = config.link_states();
        assert_eq!(states.slabref_to_whole, DistortionState::Distorted);
        assert_eq!(states.whole_to_anat, DistortionState::Corrected);
        assert_eq!(config.links.slab_to_slabref.dof, 12);
    }

    #[test]
    fn test_fmapless_distorts_every_link() {
        let config = parse(&["--fmapless", "--stc-off", "--select-run", "03"]).to_config().unwrap();
        assert!(!config.sdc_enabled);
        assert!(!config.stc_enabled);
        assert_eq!(config.link_states().whole_to_anat, DistortionState::Distorted);
        assert_eq!(config.filter.run.as_deref(), Some("03"));
    }

    #[test]
    fn test_fmap_gre_fsl_flag() {
        assert!(!parse(&[]).to_config().unwrap().fmap_gre_fsl);
        let config = parse(&["--fmap-gre-fsl"]).to_config().unwrap();
        assert!(config.fmap_gre_fsl);
        assert!(config.sdc_enabled);
    }

    #[test]
    fn test_modes_and_hmc_options() {
        let config = parse(&["--anat-only", "--hmc-cost-function", "mutualinfo", "--hmc-n4"])
            .to_config()
            .unwrap();
        assert_eq!(config.mode, RunMode::AnatOnly);
        assert_eq!(config.hmc.cost_function, HmcCostFunction::Mutualinfo);
        assert!(config.hmc.n4);
        assert!(Cli::try_parse_from(["slabprep", "--info", "--anat-only"]).is_err());
    }

    #[test]
    fn test_required_labels_without_config_file() {
        let cli = Cli::try_parse_from(["slabprep", "--subject-id", "01"]).unwrap();
        assert!(cli.to_config().is_err());
    }

    #[test]
    fn test_invalid_dof_is_rejected() {
        let cli = parse(&["--reg-wholebrain-to-anat-dof", "7"]);
        assert!(cli.to_config().is_err());
    }
}
