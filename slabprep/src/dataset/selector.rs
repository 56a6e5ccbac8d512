//! Run selection: one structural, one whole-volume run, ordered slabs.

use super::layout::DatasetLayout;
use super::metadata::PhaseEncodingDirection;
use super::run::{FieldmapEstimator, FieldmapSet, Run, StructuralRun};
use crate::config::PipelineConfig;
use crate::errors::{ConfigurationError, Result, SlabprepError};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// The three independent booleans that decide whether a slab is processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SelectionFlags {
    /// The run's final artifact already exists.
    pub already_processed: bool,
    /// The filename passes the task filter.
    pub task_match: bool,
    /// The filename passes the run filter.
    pub run_match: bool,
}

impl SelectionFlags {
    /// A run is processed iff it is not yet computed and matches both filters.
    #[must_use]
    pub const fn selected(&self) -> bool {
        !self.already_processed && self.task_match && self.run_match
    }
}

/// A slab run with its selection status.
#[derive(Debug, Clone, PartialEq)]
pub struct SlabRun {
    /// The run.
    pub run: Run,
    /// Selection flags.
    pub flags: SelectionFlags,
    /// True for the earliest-acquired slab.
    pub is_reference: bool,
}

/// Outcome of run selection for one subject/session.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    /// The structural acquisition.
    pub structural: StructuralRun,
    /// The whole-volume functional run.
    pub whole_volume: Run,
    /// Slab runs in acquisition order; the first is the slab-reference.
    pub slabs: Vec<SlabRun>,
    /// The fieldmap, when distortion correction is enabled.
    pub fieldmap: Option<FieldmapSet>,
}

impl Selection {
    /// The slab-reference run.
    #[must_use]
    pub fn slab_reference(&self) -> &SlabRun {
        &self.slabs[0]
    }

    /// Slab runs that will be processed.
    pub fn selected_slabs(&self) -> impl Iterator<Item = &SlabRun> {
        self.slabs.iter().filter(|s| s.flags.selected())
    }

    /// One line per slab with its flags, as logged in the configuration report.
    #[must_use]
    pub fn report_lines(&self) -> Vec<String> {
        self.slabs
            .iter()
            .map(|s| {
                format!(
                    "[{}|{}|{}] {}{}",
                    u8::from(s.flags.already_processed),
                    u8::from(s.flags.task_match),
                    u8::from(s.flags.run_match),
                    s.run.filename(),
                    if s.is_reference { " (slab-reference)" } else { "" }
                )
            })
            .collect()
    }
}

/// Selects runs for the configured subject/session.
///
/// `is_processed` reports whether a slab run's final artifact exists.
pub fn select_runs(
    layout: &dyn DatasetLayout,
    config: &PipelineConfig,
    is_processed: impl Fn(&Run) -> bool,
) -> Result<Selection> {
    let mut structurals = layout.structural_runs(&config.subject)?;
    if structurals.len() != 1 {
        return Err(ConfigurationError::cardinality("structural", "exactly one", structurals.len()).into());
    }
    let structural = structurals.remove(0);

    let mut slab_runs = layout.slab_runs(&config.subject, &config.session)?;
    if slab_runs.is_empty() {
        return Err(ConfigurationError::cardinality("slab", "at least one", 0).into());
    }
    order_by_acquisition(&mut slab_runs);

    let whole_volume = choose_whole_volume(
        layout.whole_volume_runs(&config.subject, &config.session)?,
        &slab_runs,
    )?;

    let slabs = slab_runs
        .into_iter()
        .enumerate()
        .map(|(i, run)| {
            let flags = SelectionFlags {
                already_processed: is_processed(&run),
                task_match: config.filter.task_matches(run.filename()),
                run_match: config.filter.run_matches(run.filename()),
            };
            SlabRun {
                run,
                flags,
                is_reference: i == 0,
            }
        })
        .collect::<Vec<_>>();

    let fieldmap = if config.sdc_enabled {
        Some(choose_fieldmap(layout.fieldmaps(&config.subject, &config.session)?)?)
    } else {
        None
    };

    info!(
        structural = structural.acquisition(),
        whole_volume = whole_volume.filename(),
        slab_reference = slabs[0].run.filename(),
        slabs = slabs.len(),
        "Runs selected"
    );
    Ok(Selection {
        structural,
        whole_volume,
        slabs,
        fieldmap,
    })
}

/// Sorts runs by acquisition time; untimed runs go last, by filename.
pub fn order_by_acquisition(runs: &mut [Run]) {
    runs.sort_by(|a, b| {
        let key = |r: &Run| (r.acquired_at().is_none(), r.acquired_at());
        key(a).cmp(&key(b)).then_with(|| a.filename().cmp(b.filename()))
    });
}

/// Picks the whole-volume run: majority phase-encoding direction over the slabs, then latest acquisition.
pub fn choose_whole_volume(mut candidates: Vec<Run>, slabs: &[Run]) -> Result<Run> {
    match candidates.len() {
        0 => return Err(ConfigurationError::cardinality("whole-volume", "exactly one", 0).into()),
        1 => return Ok(candidates.remove(0)),
        _ => {}
    }

    let majority = majority_direction(slabs)?;
    debug!(direction = %majority, candidates = candidates.len(), "Resolving whole-volume run by phase encoding");
    let mut matching: Vec<Run> = candidates
        .into_iter()
        .filter(|r| r.phase_encoding() == Some(majority))
        .collect();
    if matching.is_empty() {
        return Err(ConfigurationError::phase_encoding(format!(
            "no whole-volume run matches the majority slab phase-encoding direction '{majority}'"
        ))
        .into());
    }
    order_by_acquisition(&mut matching);
    // latest timed run wins; untimed runs only when nothing is timed
    let timed = matching.iter().rposition(|r| r.acquired_at().is_some());
    let index = timed.unwrap_or(matching.len() - 1);
    Ok(matching.swap_remove(index))
}

fn majority_direction(slabs: &[Run]) -> Result<PhaseEncodingDirection> {
    let mut counts: BTreeMap<PhaseEncodingDirection, usize> = BTreeMap::new();
    for slab in slabs {
        if let Some(pe) = slab.phase_encoding() {
            *counts.entry(pe).or_default() += 1;
        }
    }
    let best = counts.values().copied().max().unwrap_or(0);
    let leaders: Vec<_> = counts.iter().filter(|(_, c)| **c == best).map(|(d, _)| *d).collect();
    match leaders.as_slice() {
        [single] if best > 0 => Ok(*single),
        [] => Err(ConfigurationError::phase_encoding("no slab run records a phase-encoding direction").into()),
        tied => Err(ConfigurationError::phase_encoding(format!(
            "slab phase-encoding directions are tied between {}",
            tied.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
        ))
        .into()),
    }
}

fn choose_fieldmap(mut estimators: Vec<FieldmapEstimator>) -> Result<FieldmapSet> {
    if estimators.len() != 1 {
        return Err(ConfigurationError::cardinality("fieldmap estimator", "exactly one", estimators.len()).into());
    }
    match estimators.remove(0) {
        FieldmapEstimator::PhaseDifference(set) => Ok(set),
        FieldmapEstimator::Other { kind, path } => Err(SlabprepError::UnsupportedVariant(format!(
            "fieldmap estimator '{kind}' ({})",
            path.display()
        ))),
    }
}
