//! Subject/session planning: run selection, checkpoints and the stage graph.
//!
//! Every checkpoint either binds its persisted artifacts or contributes the
//! stages that produce them. Downstream branches only ever see
//! [`InputBinding`]s, so they are planned the same way in both cases.

use super::{GraphExecutionResult, InputBinding, PipelineBuilder, StageGraph, StageSpec};
use crate::config::{PipelineConfig, RegistrationLinkConfig, RunMode};
use crate::context::PipelineContext;
use crate::core::StageKind;
use crate::dataset::{select_runs, DatasetLayout, FieldmapSet, Run, Selection, SlabRun, StructuralRun};
use crate::derivatives::{DerivativeLayout, DerivativeWriter, ReferenceOutputs, ReferenceRole};
use crate::errors::{Result, SlabprepError};
use crate::operators::{ExternalOp, ExternalToolbox, RegistrationOperator};
use crate::resample::{Interpolation, VolumeResampler};
use crate::resume::{Checkpoint, PresenceStore, ResumabilityManager};
use crate::spatial::{plan_chain, plan_chain_from, DistortionState, FrameFamily, PlannedLink};
use crate::stages::{
    ComposeStage, OperatorStage, RegisterStage, ResampleMode, ResampleStage, Stage, TruncateStage,
    WriteDerivativesStage, FIXED_PORT, IMAGE_PORT, MOTION_PORT, MOVING_PORT, RESAMPLED_PORT, SEGMENTATION_PORT,
    SOURCE_REF_PORT, TARGET_REF_PORT, WARP_PORT,
};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// The collaborators stages are built with.
#[derive(Clone)]
pub struct PlannerServices {
    /// Opaque external operations.
    pub toolbox: Arc<dyn ExternalToolbox>,
    /// Linear registration.
    pub registration: Arc<dyn RegistrationOperator>,
    /// Single-volume resampling kernel.
    pub resampler: Arc<dyn VolumeResampler>,
    /// Presence checks for checkpoints.
    pub store: Arc<dyn PresenceStore>,
}

impl fmt::Debug for PlannerServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlannerServices")
            .field("toolbox", &self.toolbox)
            .field("resampler", &self.resampler)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

/// What one invocation will do for a subject/session.
#[derive(Debug)]
pub struct PipelinePlan {
    /// The selected runs.
    pub selection: Selection,
    /// Stages to execute; `None` for an info-only invocation or when every
    /// checkpoint is already complete.
    pub graph: Option<StageGraph>,
    /// Checkpoints bound from existing derivatives.
    pub resumed: Vec<String>,
    /// Checkpoints whose stages were built.
    pub built: Vec<String>,
}

impl PipelinePlan {
    /// Number of stages to execute.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.graph.as_ref().map_or(0, StageGraph::stage_count)
    }

    /// Number of stages of a kind.
    #[must_use]
    pub fn count_kind(&self, kind: StageKind) -> usize {
        self.graph.as_ref().map_or(0, |g| g.count_kind(kind))
    }

    /// Executes the graph, if there is one.
    pub async fn execute(&self, ctx: Arc<PipelineContext>) -> Result<Option<GraphExecutionResult>> {
        match &self.graph {
            Some(graph) => Ok(Some(graph.execute(ctx).await?)),
            None => Ok(None),
        }
    }
}

/// Bindings of the structural branch.
#[derive(Debug, Clone)]
struct AnatExports {
    t1w: InputBinding,
    mask: InputBinding,
    dseg: InputBinding,
    /// Grey-matter, white-matter and CSF probability maps.
    tpms: [InputBinding; 3],
}

/// Bindings of the preprocessed fieldmap.
#[derive(Debug, Clone)]
struct FieldmapExports {
    fmap_ref: InputBinding,
    fmap: InputBinding,
    /// Units of `fmap`, passed on to distortion estimation.
    units: &'static str,
}

/// Bindings of one frame family.
#[derive(Debug, Clone)]
struct FamilyExports {
    /// Brain-extracted distorted reference.
    boldref: InputBinding,
    mask: InputBinding,
    /// Distortion-corrected reference.
    corrected: Option<InputBinding>,
    /// Pull field of the distortion correction.
    sdc_warp: Option<InputBinding>,
    /// FSL matrix to the parent family, once registered.
    reg_mat: Option<InputBinding>,
    /// Anatomical segmentation in this family's frame.
    dseg: Option<InputBinding>,
}

impl FamilyExports {
    fn new(boldref: InputBinding, mask: InputBinding) -> Self {
        Self {
            boldref,
            mask,
            corrected: None,
            sdc_warp: None,
            reg_mat: None,
            dseg: None,
        }
    }

    fn boldref_at(&self, state: DistortionState) -> Result<InputBinding> {
        match state {
            DistortionState::Distorted => Ok(self.boldref.clone()),
            DistortionState::Corrected => self
                .corrected
                .clone()
                .ok_or_else(|| missing("distortion-corrected reference")),
        }
    }
}

fn missing(what: &str) -> SlabprepError {
    SlabprepError::Internal(format!("planned chain needs a {what} that no branch provides"))
}

/// The anatomical bindings plus every family planned so far.
#[derive(Debug, Clone)]
struct Frames {
    anat: AnatExports,
    families: BTreeMap<FrameFamily, FamilyExports>,
}

impl Frames {
    fn family(&self, family: &FrameFamily) -> Result<&FamilyExports> {
        self.families
            .get(family)
            .ok_or_else(|| SlabprepError::Internal(format!("frame family {family:?} is not planned")))
    }

    fn family_mut(&mut self, family: &FrameFamily) -> Result<&mut FamilyExports> {
        self.families
            .get_mut(family)
            .ok_or_else(|| SlabprepError::Internal(format!("frame family {family:?} is not planned")))
    }

    /// The image a family is registered onto.
    fn fixed_at(&self, family: &FrameFamily, state: DistortionState) -> Result<InputBinding> {
        match family.parent() {
            Some(parent) => self.family(&parent)?.boldref_at(state),
            None => Ok(self.anat.t1w.clone()),
        }
    }

    /// Segmentation of the image a family is registered onto.
    fn parent_dseg(&self, family: &FrameFamily) -> Result<InputBinding> {
        match family.parent() {
            Some(parent) => self.family(&parent)?.dseg.clone().ok_or_else(|| missing("segmentation")),
            None => Ok(self.anat.dseg.clone()),
        }
    }

    /// Binds every link input of a compose stage.
    fn bind_chain(&self, mut spec: StageSpec, links: &[(PlannedLink, bool)]) -> Result<StageSpec> {
        for (i, (link, _)) in links.iter().enumerate() {
            let bindings = match link {
                PlannedLink::Distortion { family, .. } => vec![self
                    .family(family)?
                    .sdc_warp
                    .clone()
                    .ok_or_else(|| missing("distortion field"))?],
                PlannedLink::Registration { family, state } => {
                    let exports = self.family(family)?;
                    vec![
                        exports.reg_mat.clone().ok_or_else(|| missing("registration matrix"))?,
                        exports.boldref_at(*state)?,
                        self.fixed_at(family, *state)?,
                    ]
                }
            };
            for (port, binding) in ComposeStage::link_ports(i, link).into_iter().zip(bindings) {
                spec = spec.with_input(port, binding);
            }
        }
        Ok(spec)
    }
}

/// Stages accumulated so far plus checkpoint bookkeeping.
#[derive(Debug)]
struct GraphDraft {
    builder: PipelineBuilder,
    resumed: Vec<String>,
    built: Vec<String>,
}

impl GraphDraft {
    fn add(&mut self, spec: StageSpec) -> Result<()> {
        debug!(stage = %spec.name, kind = %spec.kind, "planned stage");
        Ok(self.builder.add_stage_spec(spec)?)
    }

    /// Returns true when the checkpoint is complete and its artifacts can be bound.
    fn bind(&mut self, resume: &ResumabilityManager, checkpoint: &Checkpoint) -> Result<bool> {
        if resume.bind(checkpoint)?.is_some() {
            self.resumed.push(checkpoint.name.clone());
            Ok(true)
        } else {
            self.built.push(checkpoint.name.clone());
            Ok(false)
        }
    }
}

fn spec(name: impl Into<String>, stage: impl Stage + 'static) -> StageSpec {
    StageSpec::new(name, Arc::new(stage))
}

fn out(stage: &str, port: &str) -> InputBinding {
    InputBinding::stage(stage, port)
}

fn artifact(path: &std::path::Path) -> InputBinding {
    InputBinding::artifact(path)
}

/// A write stage copying each `(source key, destination)` from `sources`.
fn write_spec(
    name: &str,
    targets: &[(&'static str, PathBuf)],
    sources: &BTreeMap<&'static str, InputBinding>,
) -> Result<StageSpec> {
    let mut stage = WriteDerivativesStage::new(DerivativeWriter::new().with_overwrite(true));
    let mut inputs = BTreeMap::new();
    for (key, dest) in targets {
        let source = sources
            .get(key)
            .ok_or_else(|| SlabprepError::Internal(format!("no stage produces derivative '{key}' for {name}")))?;
        stage = stage.with_target(*key, dest);
        inputs.insert(*key, source.clone());
    }
    Ok(inputs
        .into_iter()
        .fold(spec(name, stage), |spec, (port, binding)| spec.with_input(port, binding)))
}

fn checkpoint_of(name: impl Into<String>, outputs: &[(&'static str, PathBuf)]) -> Checkpoint {
    let mut artifacts: Vec<PathBuf> = outputs.iter().map(|(_, p)| p.clone()).collect();
    artifacts.sort();
    artifacts.dedup();
    Checkpoint::new(name, artifacts)
}

/// Builds the stage graph of one subject/session.
#[derive(Debug)]
pub struct Planner {
    config: PipelineConfig,
    services: PlannerServices,
    derivatives: DerivativeLayout,
    resume: ResumabilityManager,
}

impl Planner {
    /// Creates a planner for a validated configuration.
    #[must_use]
    pub fn new(config: PipelineConfig, services: PlannerServices) -> Self {
        let derivatives = DerivativeLayout::new(config.out_dir.clone());
        let resume = ResumabilityManager::new(Arc::clone(&services.store));
        Self {
            config,
            services,
            derivatives,
            resume,
        }
    }

    /// The configuration planned for.
    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Selects runs and plans every checkpoint the invocation mode asks for.
    pub fn plan(&self, dataset: &dyn DatasetLayout) -> Result<PipelinePlan> {
        self.config.validate()?;
        let selection = select_runs(dataset, &self.config, |run| {
            self.resume.exists(&self.derivatives.slab(run).preproc_bold)
        })?;

        let mut draft = GraphDraft {
            builder: PipelineBuilder::new(format!(
                "{}_{}",
                self.config.subject_label(),
                self.config.session_label()
            )),
            resumed: Vec::new(),
            built: Vec::new(),
        };

        if self.config.mode == RunMode::InfoOnly {
            info!("Info-only invocation, no stages built");
            return Ok(PipelinePlan {
                selection,
                graph: None,
                resumed: draft.resumed,
                built: draft.built,
            });
        }

        if self.config.mode == RunMode::Full {
            self.check_metadata(&selection)?;
        }

        let anat = self.plan_structural(&mut draft, &selection.structural)?;
        if self.config.mode == RunMode::Full {
            let fieldmap = match (&selection.fieldmap, self.config.sdc_enabled) {
                (Some(set), true) => Some(self.plan_fieldmap(&mut draft, set)?),
                _ => None,
            };
            let mut frames = Frames {
                anat,
                families: BTreeMap::new(),
            };
            self.plan_reference(
                &mut draft,
                &mut frames,
                fieldmap.as_ref(),
                ReferenceRole::WholeVolume,
                &selection.whole_volume,
            )?;
            self.plan_reference(
                &mut draft,
                &mut frames,
                fieldmap.as_ref(),
                ReferenceRole::SlabReference,
                &selection.slab_reference().run,
            )?;
            for slab in selection.selected_slabs() {
                self.plan_slab(&mut draft, &frames, fieldmap.as_ref(), slab)?;
            }
        }

        let graph = if draft.builder.stage_count() == 0 {
            None
        } else {
            Some(draft.builder.build()?)
        };
        info!(
            stages = graph.as_ref().map_or(0, StageGraph::stage_count),
            resumed = draft.resumed.len(),
            built = draft.built.len(),
            "Pipeline planned"
        );
        Ok(PipelinePlan {
            selection,
            graph,
            resumed: draft.resumed,
            built: draft.built,
        })
    }

    /// Fails before any stage exists when a run lacks metadata its branch needs.
    fn check_metadata(&self, selection: &Selection) -> Result<()> {
        let references = [&selection.whole_volume, &selection.slab_reference().run];
        let slabs: Vec<&Run> = selection.selected_slabs().map(|s| &s.run).collect();
        for run in references.iter().copied().chain(slabs.iter().copied()) {
            run.repetition_time()?;
            if self.config.sdc_enabled {
                run.metadata.require_phase_encoding(run.filename())?;
                run.metadata.require_echo_spacing(run.filename())?;
            }
        }
        if self.config.stc_enabled {
            for run in &slabs {
                run.metadata.require_slice_timing(run.filename())?;
            }
        }
        if let Some(fieldmap) = &selection.fieldmap {
            fieldmap.echo_times()?;
        }
        Ok(())
    }

    fn operator(&self, op: ExternalOp) -> OperatorStage {
        OperatorStage::new(op, Arc::clone(&self.services.toolbox)).with_param("omp_nthreads", self.config.omp_nthreads)
    }

    fn resample(&self, mode: ResampleMode, interpolation: Interpolation) -> ResampleStage {
        ResampleStage::new(mode, interpolation, Arc::clone(&self.services.resampler))
    }

    fn register(&self, family: &FrameFamily, state: DistortionState, link: RegistrationLinkConfig) -> RegisterStage {
        let planned = PlannedLink::Registration {
            family: family.clone(),
            state,
        };
        RegisterStage::new(
            planned.source(),
            planned.target(),
            link.dof,
            link.bbr,
            Arc::clone(&self.services.registration),
        )
    }

    fn plan_structural(&self, draft: &mut GraphDraft, structural: &StructuralRun) -> Result<AnatExports> {
        let brainmask = self.derivatives.structural_brainmask(structural);
        let targets = [("brain", brainmask.brain.clone()), ("mask", brainmask.mask.clone())];
        let (brain, mask) = if draft.bind(&self.resume, &checkpoint_of("anat_brainmask", &targets))? {
            (artifact(&brainmask.brain), artifact(&brainmask.mask))
        } else {
            let anat = &self.config.anat;
            let stage = self
                .operator(ExternalOp::AnatBrainmask)
                .with_param("acquisition", structural.acquisition())
                .with_param("denoise_factor", anat.mp2rage_denoise_factor)
                .with_param("no_csf", anat.skullstrip_no_csf)
                .with_param("resolution", anat.skullstrip_resolution);
            let spec = structural
                .inputs()
                .into_iter()
                .fold(spec("anat_brainmask", stage), |spec, (port, path)| spec.with_artifact(port, path));
            draft.add(spec)?;
            let sources = BTreeMap::from([
                ("brain", out("anat_brainmask", "brain")),
                ("mask", out("anat_brainmask", "mask")),
            ]);
            draft.add(write_spec("anat_brainmask_write", &targets, &sources)?)?;
            (out("anat_brainmask", "brain"), out("anat_brainmask", "mask"))
        };

        let paths = self.derivatives.anat_preproc(structural);
        let targets = paths.outputs();
        if draft.bind(&self.resume, &checkpoint_of("anat_preproc", &targets))? {
            return Ok(AnatExports {
                t1w: artifact(&paths.t1w),
                mask: artifact(&paths.mask),
                dseg: artifact(&paths.dseg),
                tpms: [artifact(&paths.gm), artifact(&paths.wm), artifact(&paths.csf)],
            });
        }
        draft.add(
            spec("anat_preproc", self.operator(ExternalOp::AnatPreproc))
                .with_input("t1w_brain", brain)
                .with_input("t1w_mask", mask),
        )?;
        let sources = targets.iter().map(|(port, _)| (*port, out("anat_preproc", port))).collect();
        draft.add(write_spec("anat_preproc_write", &targets, &sources)?)?;
        Ok(AnatExports {
            t1w: out("anat_preproc", "t1w_preproc"),
            mask: out("anat_preproc", "t1w_mask"),
            dseg: out("anat_preproc", "t1w_dseg"),
            tpms: [
                out("anat_preproc", "tpm_gm"),
                out("anat_preproc", "tpm_wm"),
                out("anat_preproc", "tpm_csf"),
            ],
        })
    }

    fn plan_fieldmap(&self, draft: &mut GraphDraft, fieldmap: &FieldmapSet) -> Result<FieldmapExports> {
        let paths = self
            .derivatives
            .fieldmap(&self.config.subject_label(), &self.config.session_label());
        let targets = [("fmap_ref", paths.magnitude.clone()), ("fmap", paths.fieldmap.clone())];
        let units = if self.config.fmap_gre_fsl { "rad/s" } else { "hz" };
        if draft.bind(&self.resume, &checkpoint_of("fmap_preproc", &targets))? {
            return Ok(FieldmapExports {
                fmap_ref: artifact(&paths.magnitude),
                fmap: artifact(&paths.fieldmap),
                units,
            });
        }
        let (te1, te2) = fieldmap.echo_times()?;
        let preproc = if self.config.fmap_gre_fsl {
            let delta_te_ms = (te2 - te1) * 1000.0;
            debug!(delta_te_ms, "preparing fieldmap with fsl_prepare_fieldmap");
            spec(
                "fmap_preproc",
                self.operator(ExternalOp::FslPrepareFieldmap)
                    .with_param("scanner", "SIEMENS")
                    .with_param("delta_te", delta_te_ms),
            )
            .with_artifact("magnitude1", &fieldmap.magnitude1.path)
            .with_artifact("phasediff", &fieldmap.phasediff.path)
        } else {
            let mut preproc = spec(
                "fmap_preproc",
                self.operator(ExternalOp::FmapPreproc)
                    .with_param("echo_time1", te1)
                    .with_param("echo_time2", te2),
            )
            .with_artifact("magnitude1", &fieldmap.magnitude1.path)
            .with_artifact("phasediff", &fieldmap.phasediff.path);
            if let Some(magnitude2) = &fieldmap.magnitude2 {
                preproc = preproc.with_artifact("magnitude2", &magnitude2.path);
            }
            preproc
        };
        draft.add(preproc)?;
        let sources = BTreeMap::from([
            ("fmap_ref", out("fmap_preproc", "fmap_ref")),
            ("fmap", out("fmap_preproc", "fmap")),
        ]);
        draft.add(write_spec("fmap_preproc_write", &targets, &sources)?)?;
        Ok(FieldmapExports {
            fmap_ref: out("fmap_preproc", "fmap_ref"),
            fmap: out("fmap_preproc", "fmap"),
            units,
        })
    }

    fn sdc_spec(
        &self,
        name: &str,
        exports: &FamilyExports,
        fieldmap: &FieldmapExports,
        anat: &AnatExports,
        run: &Run,
    ) -> Result<StageSpec> {
        let pe = run.metadata.require_phase_encoding(run.filename())?;
        let echo_spacing = run.metadata.require_echo_spacing(run.filename())?;
        Ok(spec(
            name,
            self.operator(ExternalOp::SdcEstimate)
                .with_param("phase_encoding_direction", pe.to_string())
                .with_param("echo_spacing", echo_spacing)
                .with_param("fmap_units", fieldmap.units),
        )
        .with_input("boldref", exports.boldref.clone())
        .with_input("mask", exports.mask.clone())
        .with_input("fmap_ref", fieldmap.fmap_ref.clone())
        .with_input("fmap", fieldmap.fmap.clone())
        .with_input("anat", anat.t1w.clone()))
    }

    /// Reference volume, brain mask and distortion field of a run.
    fn plan_run_reference(
        &self,
        draft: &mut GraphDraft,
        prefix: &str,
        run: &Run,
        guide: (InputBinding, InputBinding),
        fieldmap: Option<&FieldmapExports>,
        anat: &AnatExports,
    ) -> Result<FamilyExports> {
        let boldref = format!("{prefix}_boldref");
        let brainmask = format!("{prefix}_brainmask");
        draft.add(
            spec(
                boldref.as_str(),
                self.operator(ExternalOp::Boldref).with_param("volume", self.config.boldref_volume),
            )
            .with_artifact("bold", &run.path),
        )?;
        draft.add(
            spec(brainmask.as_str(), self.operator(ExternalOp::BoldBrainmask))
                .with_stage_input("boldref", boldref.as_str(), "boldref")
                .with_input("guide_ref", guide.0)
                .with_input("guide_mask", guide.1),
        )?;
        let mut exports = FamilyExports::new(out(&brainmask, "brain"), out(&brainmask, "mask"));
        if let Some(fieldmap) = fieldmap {
            let sdc = format!("{prefix}_sdc");
            draft.add(self.sdc_spec(&sdc, &exports, fieldmap, anat, run)?)?;
            exports.corrected = Some(out(&sdc, "corrected"));
            exports.sdc_warp = Some(out(&sdc, "warp"));
        }
        Ok(exports)
    }

    fn plan_reference(
        &self,
        draft: &mut GraphDraft,
        frames: &mut Frames,
        fieldmap: Option<&FieldmapExports>,
        role: ReferenceRole,
        run: &Run,
    ) -> Result<()> {
        let states = self.config.link_states();
        let (family, link, registration_state, segmentation_state) = match role {
            ReferenceRole::WholeVolume => (
                FrameFamily::WholeVolume,
                self.config.links.whole_to_anat,
                states.whole_to_anat,
                states.slabref_to_whole,
            ),
            ReferenceRole::SlabReference => (
                FrameFamily::SlabReference,
                self.config.links.slabref_to_whole,
                states.slabref_to_whole,
                states.slab_to_slabref,
            ),
        };
        let sdc = self.config.sdc_enabled;
        let paths = self.derivatives.reference(run, role);
        let mut targets = paths.outputs(ReferenceOutputs {
            sdc,
            registration_state,
            segmentation_state,
        });
        if role == ReferenceRole::WholeVolume {
            let brainmask = self.derivatives.bold_brainmask(run);
            targets.push(("boldref", brainmask.brain));
            targets.push(("mask", brainmask.mask));
        }
        let mut checkpoint = checkpoint_of(role.checkpoint(), &targets);
        if let Some(distorted) = paths.boldref.parent() {
            checkpoint = checkpoint.with_sentinel(distorted);
        }

        if draft.bind(&self.resume, &checkpoint)? {
            frames.families.insert(
                family,
                FamilyExports {
                    boldref: artifact(&paths.boldref),
                    mask: artifact(&paths.brainmask),
                    corrected: sdc.then(|| artifact(&paths.sdc_boldref)),
                    sdc_warp: sdc.then(|| artifact(&paths.sdc_warp)),
                    reg_mat: Some(artifact(&paths.reg_mat)),
                    dseg: Some(artifact(paths.dseg_at(segmentation_state))),
                },
            );
            return Ok(());
        }

        let prefix = role.tag();
        let name = |step: &str| format!("{prefix}_{step}");
        let guide = match role {
            ReferenceRole::WholeVolume => (frames.anat.t1w.clone(), frames.anat.mask.clone()),
            ReferenceRole::SlabReference => {
                let whole = frames.family(&FrameFamily::WholeVolume)?;
                (whole.boldref.clone(), whole.mask.clone())
            }
        };
        let mut exports = self.plan_run_reference(draft, prefix, run, guide, fieldmap, &frames.anat)?;

        let mut register = spec(name("register"), self.register(&family, registration_state, link))
            .with_input(MOVING_PORT, exports.boldref_at(registration_state)?)
            .with_input(FIXED_PORT, frames.fixed_at(&family, registration_state)?);
        if link.bbr {
            register = register.with_input(SEGMENTATION_PORT, frames.parent_dseg(&family)?);
        }
        draft.add(register)?;
        exports.reg_mat = Some(out(&name("register"), "forward_mat"));
        frames.families.insert(family.clone(), exports.clone());

        // Anatomical segmentation pulled into this family's frame, for the next link down.
        let chain: Vec<(PlannedLink, bool)> = plan_chain_from(&family, segmentation_state, states)
            .into_iter()
            .rev()
            .map(|l| (l, true))
            .collect();
        let compose = frames
            .bind_chain(spec(name("dseg_compose"), ComposeStage::new(chain.clone())), &chain)?
            .with_input(SOURCE_REF_PORT, frames.anat.t1w.clone())
            .with_input(TARGET_REF_PORT, exports.boldref_at(segmentation_state)?);
        draft.add(compose)?;
        draft.add(
            spec(name("dseg_resample"), self.resample(ResampleMode::Volume, Interpolation::MultiLabel))
                .with_input(IMAGE_PORT, frames.anat.dseg.clone())
                .with_stage_input(WARP_PORT, name("dseg_compose"), WARP_PORT),
        )?;
        let dseg = out(&name("dseg_resample"), RESAMPLED_PORT);
        frames.family_mut(&family)?.dseg = Some(dseg.clone());

        let register_name = name("register");
        let mut sources: BTreeMap<&'static str, InputBinding> = BTreeMap::from([
            ("boldref", exports.boldref.clone()),
            ("mask", exports.mask.clone()),
            ("dseg", dseg),
            ("forward_mat", out(&register_name, "forward_mat")),
            ("inverse_mat", out(&register_name, "inverse_mat")),
            ("forward_itk", out(&register_name, "forward_itk")),
            ("inverse_itk", out(&register_name, "inverse_itk")),
            ("report", out(&register_name, "report")),
        ]);
        if let (Some(corrected), Some(warp)) = (&exports.corrected, &exports.sdc_warp) {
            sources.insert("corrected", corrected.clone());
            sources.insert("sdc_warp", warp.clone());
        }
        if role == ReferenceRole::WholeVolume {
            let chain: Vec<(PlannedLink, bool)> = plan_chain(&family, states).into_iter().map(|l| (l, false)).collect();
            let compose = frames
                .bind_chain(spec(name("t1w_compose"), ComposeStage::new(chain.clone())), &chain)?
                .with_input(SOURCE_REF_PORT, exports.boldref.clone())
                .with_input(TARGET_REF_PORT, frames.anat.t1w.clone());
            draft.add(compose)?;
            draft.add(
                spec(name("t1w_resample"), self.resample(ResampleMode::Volume, Interpolation::WindowedSinc))
                    .with_input(IMAGE_PORT, exports.boldref.clone())
                    .with_stage_input(WARP_PORT, name("t1w_compose"), WARP_PORT),
            )?;
            sources.insert("space_t1w_boldref", out(&name("t1w_resample"), RESAMPLED_PORT));
        }
        draft.add(write_spec(&name("write"), &targets, &sources)?)?;
        Ok(())
    }

    fn plan_slab(
        &self,
        draft: &mut GraphDraft,
        frames: &Frames,
        fieldmap: Option<&FieldmapExports>,
        slab: &SlabRun,
    ) -> Result<()> {
        let run = &slab.run;
        let label = run.label();
        let sdc = self.config.sdc_enabled;
        let states = self.config.link_states();
        let paths = self.derivatives.slab(run);
        let brainmask = self.derivatives.bold_brainmask(run);
        let mut targets = paths.outputs(sdc, slab.is_reference);
        targets.push(("brain", brainmask.brain));
        targets.push(("mask", brainmask.mask));
        if draft.bind(&self.resume, &checkpoint_of(format!("slab_bold:{label}"), &targets))? {
            return Ok(());
        }

        let prefix = format!("slab_{label}");
        let name = |step: &str| format!("{prefix}_{step}");
        let mut frames = frames.clone();
        let mut sources: BTreeMap<&'static str, InputBinding> = BTreeMap::new();

        let family = if slab.is_reference {
            FrameFamily::SlabReference
        } else {
            let family = FrameFamily::NativeSlab(label.clone());
            let slabref = frames.family(&FrameFamily::SlabReference)?;
            let guide = (slabref.boldref.clone(), slabref.mask.clone());
            let mut exports = self.plan_run_reference(draft, &prefix, run, guide, fieldmap, &frames.anat)?;
            frames.families.insert(family.clone(), exports.clone());

            let state = states.slab_to_slabref;
            let link = self.config.links.slab_to_slabref;
            let mut register = spec(name("register"), self.register(&family, state, link))
                .with_input(MOVING_PORT, exports.boldref_at(state)?)
                .with_input(FIXED_PORT, frames.fixed_at(&family, state)?);
            if link.bbr {
                register = register.with_input(SEGMENTATION_PORT, frames.parent_dseg(&family)?);
            }
            draft.add(register)?;
            exports.reg_mat = Some(out(&name("register"), "forward_mat"));
            frames.families.insert(family.clone(), exports);
            for port in ["forward_mat", "inverse_mat", "report"] {
                sources.insert(port, out(&name("register"), port));
            }
            family
        };
        let native = frames.family(&family)?.clone();

        let repetition_time = run.repetition_time()?;
        let mut series = artifact(&run.path);
        if let Some(volumes) = self.config.truncate_to() {
            draft.add(spec(name("truncate"), TruncateStage::new(volumes)).with_input(TruncateStage::PORT, series))?;
            series = out(&name("truncate"), TruncateStage::PORT);
        }
        if self.config.stc_enabled {
            let timing = run.metadata.require_slice_timing(run.filename())?.to_vec();
            draft.add(
                spec(
                    name("stc"),
                    self.operator(ExternalOp::SliceTiming)
                        .with_param("slice_timing", timing)
                        .with_param("repetition_time", repetition_time),
                )
                .with_input("bold", series),
            )?;
            series = out(&name("stc"), "bold");
        }

        let mut reference = native.boldref.clone();
        if self.config.hmc.n4 {
            draft.add(spec(name("n4"), self.operator(ExternalOp::BiasCorrection)).with_input("image", reference))?;
            reference = out(&name("n4"), "image");
        }
        draft.add(
            spec(
                name("hmc"),
                self.operator(ExternalOp::MotionCorrection)
                    .with_param("cost_function", self.config.hmc.cost_function.to_string())
                    .with_param("lowpass_threshold", self.config.hmc.lowpass_threshold),
            )
            .with_input("bold", series.clone())
            .with_input("reference", reference),
        )?;

        let chain: Vec<(PlannedLink, bool)> = plan_chain(&family, states).into_iter().map(|l| (l, false)).collect();
        debug!(run = %label, links = chain.len(), "planned native-to-anatomical chain");
        let compose = frames
            .bind_chain(
                spec(name("compose"), ComposeStage::new(chain.clone()).with_regrid(true)),
                &chain,
            )?
            .with_input(SOURCE_REF_PORT, native.boldref.clone())
            .with_input(TARGET_REF_PORT, frames.anat.t1w.clone());
        draft.add(compose)?;
        let warp = out(&name("compose"), WARP_PORT);

        draft.add(
            spec(
                name("resample"),
                self.resample(ResampleMode::Series { repetition_time }, Interpolation::WindowedSinc),
            )
            .with_input(IMAGE_PORT, series)
            .with_input(WARP_PORT, warp.clone())
            .with_stage_input(MOTION_PORT, name("hmc"), "mats"),
        )?;
        draft.add(
            spec(name("boldref_t1w"), self.resample(ResampleMode::Volume, Interpolation::WindowedSinc))
                .with_input(IMAGE_PORT, native.boldref.clone())
                .with_input(WARP_PORT, warp.clone()),
        )?;
        draft.add(
            spec(name("mask_t1w"), self.resample(ResampleMode::Volume, Interpolation::Nearest))
                .with_input(IMAGE_PORT, native.mask.clone())
                .with_input(WARP_PORT, warp.clone()),
        )?;

        let [gm, wm, csf] = frames.anat.tpms.clone();
        draft.add(
            spec(
                name("confounds"),
                self.operator(ExternalOp::Confounds)
                    .with_param("repetition_time", repetition_time)
                    .with_param("skip_vols", 0)
                    .with_param("dvars_threshold", 1.5)
                    .with_param("fd_threshold", 0.5)
                    .with_param("all_components", false),
            )
            .with_stage_input("bold", name("resample"), RESAMPLED_PORT)
            .with_stage_input("mask", name("mask_t1w"), RESAMPLED_PORT)
            .with_stage_input("movpar", name("hmc"), "movpar")
            .with_input("t1w_mask", frames.anat.mask.clone())
            .with_input("tpm_gm", gm)
            .with_input("tpm_wm", wm)
            .with_input("tpm_csf", csf),
        )?;
        for (port, _) in paths.confounds.outputs() {
            sources.insert(port, out(&name("confounds"), port));
        }

        sources.insert("space_t1w_boldref", out(&name("boldref_t1w"), RESAMPLED_PORT));
        sources.insert("space_t1w_mask", out(&name("mask_t1w"), RESAMPLED_PORT));
        sources.insert("preproc_bold", out(&name("resample"), RESAMPLED_PORT));
        sources.insert("hmc_mats", out(&name("hmc"), "mats"));
        sources.insert("static_warp", warp);
        sources.insert("brain", native.boldref.clone());
        sources.insert("mask", native.mask.clone());
        if let Some(field) = &native.sdc_warp {
            sources.insert("sdc_warp", field.clone());
        }
        draft.add(write_spec(&name("write"), &targets, &sources)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SelectionFilter;
    use crate::dataset::BidsDirectory;
    use crate::resample::KernelResampler;
    use crate::resume::{FilesystemStore, InMemoryStore};
    use crate::testing::{StubRegistration, StubToolbox, SyntheticDataset};
    use pretty_assertions::assert_eq;

    fn services(store: Arc<dyn PresenceStore>) -> PlannerServices {
        PlannerServices {
            toolbox: Arc::new(StubToolbox::new()),
            registration: Arc::new(StubRegistration::identity()),
            resampler: Arc::new(KernelResampler),
            store,
        }
    }

    fn dataset() -> SyntheticDataset {
        SyntheticDataset::new("01", "01")
            .with_mprage("01")
            .with_whole_volume("01", "j", "08:00:00")
            .with_slab("motor", "01", "j", "09:00:00")
            .with_slab("motor", "02", "j", "09:10:00")
            .with_phasediff()
            .build()
    }

    fn config(ds: &SyntheticDataset) -> PipelineConfig {
        PipelineConfig::new("01", "01", ds.bids_dir(), ds.out_dir()).with_scratch_dir(ds.scratch_dir())
    }

    fn plan(config: PipelineConfig, ds: &SyntheticDataset) -> Result<PipelinePlan> {
        Planner::new(config, services(Arc::new(FilesystemStore))).plan(&BidsDirectory::new(ds.bids_dir()))
    }

    #[test]
    fn test_info_only_builds_nothing() {
        let ds = dataset();
        let plan = plan(config(&ds).with_mode(RunMode::InfoOnly), &ds).unwrap();
        assert!(plan.graph.is_none());
        assert_eq!(plan.selection.slabs.len(), 2);

        let ctx = Arc::new(PipelineContext::new(ds.scratch_dir()));
        assert!(tokio_test::block_on(plan.execute(ctx)).unwrap().is_none());
    }

    #[test]
    fn test_anat_only_stops_after_structural_branch() {
        let ds = dataset();
        let plan = plan(config(&ds).with_mode(RunMode::AnatOnly), &ds).unwrap();
        assert_eq!(plan.built, vec!["anat_brainmask", "anat_preproc"]);
        assert_eq!(plan.count_kind(StageKind::Register), 0);
        assert_eq!(plan.stage_count(), 4);
    }

    #[test]
    fn test_full_plan_with_distortion_correction() {
        let ds = dataset();
        let plan = plan(config(&ds), &ds).unwrap();
        let graph = plan.graph.as_ref().unwrap();

        assert_eq!(
            plan.built,
            vec![
                "anat_brainmask",
                "anat_preproc",
                "fmap_preproc",
                "wholebrain_bold",
                "slabref_bold",
                "slab_bold:task-motor_run-01",
                "slab_bold:task-motor_run-02",
            ]
        );
        // whole -> anat, slabref -> whole, slab run-02 -> slabref
        assert_eq!(plan.count_kind(StageKind::Register), 3);
        assert!(graph.stage("slab_task-motor_run-02_sdc").is_some());
        assert!(graph.stage("slab_task-motor_run-01_sdc").is_none());
        assert!(graph.stage("slab_task-motor_run-01_register").is_none());

        // All links corrected: the slab's own field leads its chain.
        let compose = graph.stage("slab_task-motor_run-02_compose").unwrap();
        assert_eq!(
            compose.inputs["link0_warp"],
            InputBinding::stage("slab_task-motor_run-02_sdc", "warp")
        );
        assert_eq!(
            compose.inputs["link1_mat"],
            InputBinding::stage("slab_task-motor_run-02_register", "forward_mat")
        );
    }

    #[test]
    fn test_slab_confounds_follow_t1w_resampling() {
        let ds = dataset();
        let plan = plan(config(&ds).fmapless(), &ds).unwrap();
        let graph = plan.graph.as_ref().unwrap();
        let confounds = graph.stage("slab_task-motor_run-02_confounds").unwrap();
        assert_eq!(confounds.runner.name(), "confounds");
        assert_eq!(
            confounds.inputs["bold"],
            InputBinding::stage("slab_task-motor_run-02_resample", RESAMPLED_PORT)
        );
        assert_eq!(
            confounds.inputs["mask"],
            InputBinding::stage("slab_task-motor_run-02_mask_t1w", RESAMPLED_PORT)
        );
        assert_eq!(confounds.inputs["movpar"], InputBinding::stage("slab_task-motor_run-02_hmc", "movpar"));
        assert_eq!(confounds.inputs["tpm_csf"], InputBinding::stage("anat_preproc", "tpm_csf"));

        let write = graph.stage("slab_task-motor_run-02_write").unwrap();
        assert!(write
            .inputs
            .values()
            .any(|b| *b == InputBinding::stage("slab_task-motor_run-02_confounds", "confounds")));
    }

    #[test]
    fn test_fmap_gre_fsl_swaps_fieldmap_preparation() {
        let ds = dataset();
        let plan = plan(config(&ds).with_fmap_gre_fsl(true), &ds).unwrap();
        let graph = plan.graph.as_ref().unwrap();
        let preproc = graph.stage("fmap_preproc").unwrap();
        assert_eq!(preproc.runner.name(), "fsl_prepare_fieldmap");
        assert!(preproc.inputs.contains_key("phasediff"));
        assert!(!preproc.inputs.contains_key("magnitude2"));
        let sdc = graph.stage("slab_task-motor_run-02_sdc").unwrap();
        assert_eq!(sdc.inputs["fmap"], InputBinding::stage("fmap_preproc", "fmap"));

        let default = self::plan(config(&ds), &ds).unwrap();
        let default_preproc = default.graph.as_ref().unwrap().stage("fmap_preproc").unwrap();
        assert_eq!(default_preproc.runner.name(), "fmap_preproc");
    }

    #[test]
    fn test_fmapless_plan_omits_distortion_stages() {
        let ds = dataset();
        let plan = plan(config(&ds).fmapless(), &ds).unwrap();
        let graph = plan.graph.as_ref().unwrap();
        assert!(!plan.built.contains(&"fmap_preproc".to_string()));
        assert!(graph.stages().all(|s| !s.name.ends_with("_sdc")));
        let compose = graph.stage("slab_task-motor_run-02_compose").unwrap();
        assert!(compose.inputs.contains_key("link0_mat"));
        assert!(!compose.inputs.contains_key("link0_warp"));
    }

    #[test]
    fn test_quick_mode_truncates_and_stc_off_skips_slice_timing() {
        let ds = dataset();
        let plan = plan(config(&ds).fmapless().with_quick(true).with_stc(false), &ds).unwrap();
        let graph = plan.graph.as_ref().unwrap();
        assert_eq!(plan.count_kind(StageKind::Prepare), 2);
        assert!(graph.stages().all(|s| !s.name.ends_with("_stc")));
        let hmc = graph.stage("slab_task-motor_run-01_hmc").unwrap();
        assert_eq!(hmc.inputs["bold"], InputBinding::stage("slab_task-motor_run-01_truncate", "bold"));
    }

    #[test]
    fn test_filters_restrict_slab_branches() {
        let ds = dataset();
        let config = config(&ds).fmapless().with_filter(SelectionFilter {
            task: None,
            run: Some("02".into()),
        });
        let plan = plan(config, &ds).unwrap();
        assert!(plan.built.contains(&"slab_bold:task-motor_run-02".to_string()));
        assert!(!plan.built.contains(&"slab_bold:task-motor_run-01".to_string()));
        // The slab-reference family is still planned for the filtered-out reference run.
        assert!(plan.built.contains(&"slabref_bold".to_string()));
    }

    #[test]
    fn test_missing_slice_timing_is_metadata_error() {
        let ds = dataset();
        let sidecar = ds
            .bids_dir()
            .join("sub-01/ses-01/func/sub-01_ses-01_task-motor_dir-PA_run-02_part-mag_bold.json");
        std::fs::write(&sidecar, r#"{"RepetitionTime": 2.0, "PhaseEncodingDirection": "j", "AcquisitionTime": "09:10:00"}"#).unwrap();
        let err = plan(config(&ds).fmapless(), &ds).unwrap_err();
        assert_eq!(err.code(), Some("METADATA-001-MISSING"));
    }

    #[test]
    fn test_claimed_but_incomplete_family_is_fatal() {
        let ds = dataset();
        let store = Arc::new(InMemoryStore::new());
        let probe = plan(config(&ds).fmapless().with_mode(RunMode::InfoOnly), &ds).unwrap();
        let whole = DerivativeLayout::new(ds.out_dir()).reference(&probe.selection.whole_volume, ReferenceRole::WholeVolume);
        store.insert(whole.boldref.parent().unwrap());

        let err = Planner::new(config(&ds).fmapless(), services(store))
            .plan(&BidsDirectory::new(ds.bids_dir()))
            .unwrap_err();
        assert_eq!(err.code(), Some("RESUME-001-MISSING_ARTIFACT"));
    }
}
