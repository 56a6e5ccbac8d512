//! StageGraph DAG execution engine.
//!
//! Stages run as soon as every upstream stage they read from has succeeded,
//! so independent branches proceed in parallel.

use super::{FailureCollector, FailureMode, FailureRecord, FailureSummary, InputBinding, StageSpec};
use crate::context::{PipelineContext, StageContext, StageInputs};
use crate::core::{PipelineEvent, StageKind, StageOutput, StageStatus};
use crate::errors::{Result, SlabprepError};
use crate::observability::{SpanTimer, StageSpanAttributes};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

type Artifacts = Arc<RwLock<BTreeMap<String, BTreeMap<String, PathBuf>>>>;

/// Result of executing a stage graph.
#[derive(Debug)]
pub struct GraphExecutionResult {
    /// Per-stage outputs, including aborted stages.
    pub outputs: BTreeMap<String, StageOutput>,
    /// Total execution time in milliseconds.
    pub duration_ms: f64,
    /// Whether every stage succeeded.
    pub success: bool,
    /// The first failure, if any.
    pub error: Option<String>,
    /// Failure bookkeeping.
    pub summary: FailureSummary,
}

impl GraphExecutionResult {
    /// Names of stages that ended with `status`.
    #[must_use]
    pub fn stages_with_status(&self, status: StageStatus) -> Vec<&str> {
        self.outputs
            .iter()
            .filter(|(_, o)| o.status == status)
            .map(|(n, _)| n.as_str())
            .collect()
    }
}

/// A validated directed acyclic graph of stages.
#[derive(Debug)]
pub struct StageGraph {
    name: String,
    stages: BTreeMap<String, StageSpec>,
    execution_order: Vec<String>,
    dependents: BTreeMap<String, Vec<String>>,
    failure_mode: FailureMode,
}

impl StageGraph {
    /// Creates a new stage graph. Bindings must already be validated.
    #[must_use]
    pub fn new(name: String, stages: BTreeMap<String, StageSpec>, stage_order: Vec<String>) -> Self {
        let execution_order = topological_sort(&stages, &stage_order);
        let mut dependents: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for spec in stages.values() {
            for dep in spec.dependencies() {
                dependents.entry(dep).or_default().push(spec.name.clone());
            }
        }
        Self {
            name,
            stages,
            execution_order,
            dependents,
            failure_mode: FailureMode::default(),
        }
    }

    /// Sets the failure mode.
    #[must_use]
    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Returns the execution order.
    #[must_use]
    pub fn execution_order(&self) -> &[String] {
        &self.execution_order
    }

    /// Looks up a stage.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageSpec> {
        self.stages.get(name)
    }

    /// Iterates stages in execution order.
    pub fn stages(&self) -> impl Iterator<Item = &StageSpec> {
        self.execution_order.iter().filter_map(|n| self.stages.get(n))
    }

    /// Number of stages of a kind.
    #[must_use]
    pub fn count_kind(&self, kind: StageKind) -> usize {
        self.stages.values().filter(|s| s.kind == kind).count()
    }

    /// Executes the graph.
    pub async fn execute(&self, ctx: Arc<PipelineContext>) -> Result<GraphExecutionResult> {
        let start = Instant::now();
        let artifacts: Artifacts = Arc::new(RwLock::new(BTreeMap::new()));
        let mut outputs: BTreeMap<String, StageOutput> = BTreeMap::new();
        let mut collector = FailureCollector::new(self.failure_mode);

        let mut in_degree: BTreeMap<&str, usize> = self
            .stages
            .iter()
            .map(|(name, spec)| (name.as_str(), spec.dependencies().len()))
            .collect();

        let mut active: FuturesUnordered<tokio::task::JoinHandle<(String, StageOutput)>> = FuturesUnordered::new();
        for name in &self.execution_order {
            if in_degree.get(name.as_str()) == Some(&0) {
                active.push(self.spawn_stage_task(name, &ctx, &artifacts)?);
            }
        }

        while let Some(joined) = active.next().await {
            let (stage_name, output) =
                joined.map_err(|e| SlabprepError::Internal(format!("Task join error: {e}")))?;

            if output.is_success() {
                collector.record_completion(&stage_name);
                artifacts.write().insert(stage_name.clone(), output.artifacts.clone());
                outputs.insert(stage_name.clone(), output);
                for child in self.dependents.get(&stage_name).into_iter().flatten() {
                    let Some(count) = in_degree.get_mut(child.as_str()) else {
                        continue;
                    };
                    *count = count.saturating_sub(1);
                    if *count == 0 && !outputs.contains_key(child) && !collector.should_stop() {
                        active.push(self.spawn_stage_task(child, &ctx, &artifacts)?);
                    }
                }
            } else {
                collector.record_failure(
                    FailureRecord::new(&stage_name, output.error.clone().unwrap_or_default())
                        .with_code(output.error_code.clone()),
                );
                outputs.insert(stage_name.clone(), output);
                match self.failure_mode {
                    FailureMode::ContinueOnFailure => {
                        self.abort_dependents(&stage_name, &ctx, &mut outputs, &mut collector).await;
                    }
                    FailureMode::FailFast => {
                        warn!(stage = %stage_name, "stage failed, draining running stages");
                        ctx.cancel();
                    }
                }
            }
        }

        // Fail-fast leaves unscheduled stages behind.
        if let Some(first) = collector.first_failure().map(|f| f.stage.clone()) {
            for name in &self.execution_order {
                if !outputs.contains_key(name) {
                    ctx.emit(&PipelineEvent::stage_aborted(name, &first)).await;
                    collector.record_abort(name);
                    outputs.insert(name.clone(), StageOutput::aborted(&first));
                }
            }
        }

        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
        let summary = collector.summary(self.stages.len());
        let success = !summary.has_failures();
        let error = collector
            .first_failure()
            .map(|f| format!("Stage '{}' failed: {}", f.stage, f.error));
        ctx.emit(&PipelineEvent::pipeline_completed(
            success,
            self.stages.len(),
            summary.failed_stages,
            duration_ms,
        ))
        .await;
        info!(
            pipeline = %self.name,
            success,
            completed = summary.completed_stages,
            failed = summary.failed_stages,
            aborted = summary.aborted_stages,
            duration_ms,
            "graph finished"
        );

        Ok(GraphExecutionResult {
            outputs,
            duration_ms,
            success,
            error,
            summary,
        })
    }

    /// Marks every transitive dependent of `failed` as aborted.
    async fn abort_dependents(
        &self,
        failed: &str,
        ctx: &PipelineContext,
        outputs: &mut BTreeMap<String, StageOutput>,
        collector: &mut FailureCollector,
    ) {
        let mut queue: VecDeque<&str> = self
            .dependents
            .get(failed)
            .into_iter()
            .flatten()
            .map(String::as_str)
            .collect();
        let mut seen = BTreeSet::new();
        while let Some(name) = queue.pop_front() {
            if !seen.insert(name) || outputs.contains_key(name) {
                continue;
            }
            warn!(stage = name, failed_dependency = failed, "aborting dependent stage");
            ctx.emit(&PipelineEvent::stage_aborted(name, failed)).await;
            collector.record_abort(name);
            outputs.insert(name.to_string(), StageOutput::aborted(failed));
            queue.extend(self.dependents.get(name).into_iter().flatten().map(String::as_str));
        }
    }

    /// Spawns a task executing one stage with its resolved inputs.
    fn spawn_stage_task(
        &self,
        stage_name: &str,
        ctx: &Arc<PipelineContext>,
        artifacts: &Artifacts,
    ) -> Result<tokio::task::JoinHandle<(String, StageOutput)>> {
        let spec = self
            .stages
            .get(stage_name)
            .cloned()
            .ok_or_else(|| SlabprepError::Internal(format!("unknown stage '{stage_name}'")))?;
        let ctx = Arc::clone(ctx);
        let artifacts = Arc::clone(artifacts);

        Ok(tokio::spawn(async move {
            let name = spec.name.clone();
            ctx.emit(&PipelineEvent::stage_started(&name, spec.kind)).await;
            let timer = SpanTimer::start(&name);

            let resolved = resolve_inputs(&spec, &artifacts.read());
            let output = match resolved {
                Ok(bound) => {
                    let stage_ctx = StageContext::new(Arc::clone(&ctx), &name, StageInputs::new(&name, bound));
                    let output = spec.runner.execute(&stage_ctx).await;
                    verify_outputs(&spec, output)
                }
                Err(e) => StageOutput::from_error(&e),
            };
            let duration_ms = timer.finish();

            match output.status {
                StageStatus::Ok => ctx.emit(&PipelineEvent::stage_completed(&name, duration_ms)).await,
                StageStatus::Skip => {
                    ctx.emit(&PipelineEvent::stage_skipped(&name, output.skip_reason.as_deref().unwrap_or("")))
                        .await;
                }
                _ => {
                    ctx.emit(&PipelineEvent::stage_failed(
                        &name,
                        output.error.as_deref().unwrap_or(""),
                        output.error_code.as_deref(),
                    ))
                    .await;
                }
            }
            StageSpanAttributes::new(&name, spec.kind)
                .with_status(output.status)
                .with_duration_ms(duration_ms)
                .with_error(output.error.clone())
                .with_ports(output.artifacts.keys().cloned().collect())
                .record();

            (name, output)
        }))
    }
}

/// Resolves every input port to a file.
fn resolve_inputs(
    spec: &StageSpec,
    artifacts: &BTreeMap<String, BTreeMap<String, PathBuf>>,
) -> Result<BTreeMap<String, PathBuf>> {
    spec.inputs
        .iter()
        .map(|(port, binding)| {
            let path = match binding {
                InputBinding::Artifact(path) => path.clone(),
                InputBinding::Stage { stage, port: upstream_port } => artifacts
                    .get(stage)
                    .and_then(|a| a.get(upstream_port))
                    .cloned()
                    .ok_or_else(|| {
                        SlabprepError::Internal(format!(
                            "stage '{}' input '{port}': '{stage}.{upstream_port}' was not produced",
                            spec.name
                        ))
                    })?,
            };
            Ok((port.clone(), path))
        })
        .collect()
}

/// Turns a successful output that lacks a declared port into a failure.
fn verify_outputs(spec: &StageSpec, output: StageOutput) -> StageOutput {
    if output.status != StageStatus::Ok {
        return output;
    }
    for port in spec.runner.outputs() {
        match output.artifact(&port) {
            Some(path) if path.exists() => {}
            Some(path) => {
                return StageOutput::fail(format!(
                    "stage '{}' output '{port}' does not exist at {}",
                    spec.name,
                    path.display()
                ))
            }
            None => return StageOutput::fail(format!("stage '{}' did not produce output '{port}'", spec.name)),
        }
    }
    output
}

/// Depth-first topological order, visiting in insertion order for determinism.
fn topological_sort(stages: &BTreeMap<String, StageSpec>, stage_order: &[String]) -> Vec<String> {
    fn visit(
        node: &str,
        stages: &BTreeMap<String, StageSpec>,
        visited: &mut BTreeSet<String>,
        temp_visited: &mut BTreeSet<String>,
        result: &mut Vec<String>,
    ) {
        if visited.contains(node) || temp_visited.contains(node) {
            return;
        }
        temp_visited.insert(node.to_string());
        if let Some(spec) = stages.get(node) {
            for dep in spec.dependencies() {
                visit(&dep, stages, visited, temp_visited, result);
            }
        }
        temp_visited.remove(node);
        visited.insert(node.to_string());
        result.push(node.to_string());
    }

    let mut result = Vec::new();
    let mut visited = BTreeSet::new();
    let mut temp_visited = BTreeSet::new();
    for name in stage_order {
        visit(name, stages, &mut visited, &mut temp_visited, &mut result);
    }
    result
}
