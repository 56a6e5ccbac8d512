//! Pipeline builder with validation.

use super::{InputBinding, StageGraph, StageSpec};
use crate::errors::{CycleDetectedError, ErrorInfo, PipelineValidationError};
use std::collections::{BTreeMap, BTreeSet};

/// Collects stage specifications and validates them into a [`StageGraph`].
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    name: String,
    stages: BTreeMap<String, StageSpec>,
    stage_order: Vec<String>,
}

impl PipelineBuilder {
    /// Creates a new pipeline builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: BTreeMap::new(),
            stage_order: Vec::new(),
        }
    }

    /// Adds a stage, consuming and returning the builder.
    ///
    /// # Errors
    ///
    /// Returns an error if the stage is invalid or its name is taken.
    pub fn stage(mut self, spec: StageSpec) -> Result<Self, PipelineValidationError> {
        self.add_stage_spec(spec)?;
        Ok(self)
    }

    /// Adds a stage.
    ///
    /// Upstream stages may be added later; bindings are checked by [`Self::build`].
    ///
    /// # Errors
    ///
    /// Returns an error if the stage is invalid or its name is taken.
    pub fn add_stage_spec(&mut self, spec: StageSpec) -> Result<(), PipelineValidationError> {
        spec.validate()?;
        if self.stages.contains_key(&spec.name) {
            return Err(PipelineValidationError::new(format!("Stage '{}' is defined twice", spec.name))
                .with_stages(vec![spec.name.clone()])
                .with_error_info(
                    ErrorInfo::new("GRAPH-004-DUPLICATE", format!("Duplicate stage '{}'", spec.name))
                        .with_fix_hint("Stage names must be unique within a subject/session graph."),
                ));
        }
        self.stage_order.push(spec.name.clone());
        self.stages.insert(spec.name.clone(), spec);
        Ok(())
    }

    /// Returns true if a stage with this name was added.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.stages.contains_key(name)
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

    /// Validates every binding and builds the graph.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty graph, a binding to an unknown stage or
    /// port, or a dependency cycle.
    pub fn build(self) -> Result<StageGraph, PipelineValidationError> {
        if self.stages.is_empty() {
            return Err(PipelineValidationError::new("Pipeline has no stages").with_error_info(
                ErrorInfo::new("GRAPH-003-EMPTY", "Cannot build an empty pipeline")
                    .with_fix_hint("Nothing to do: every checkpoint may already be complete."),
            ));
        }
        self.check_bindings()?;
        self.detect_cycles()?;
        Ok(StageGraph::new(self.name, self.stages, self.stage_order))
    }

    fn check_bindings(&self) -> Result<(), PipelineValidationError> {
        for spec in self.stages.values() {
            for (port, binding) in &spec.inputs {
                let InputBinding::Stage { stage, port: upstream_port } = binding else {
                    continue;
                };
                let Some(upstream) = self.stages.get(stage) else {
                    return Err(PipelineValidationError::new(format!(
                        "Stage '{}' depends on unknown stage '{stage}'",
                        spec.name
                    ))
                    .with_stages(vec![spec.name.clone(), stage.clone()])
                    .with_error_info(
                        ErrorInfo::new("GRAPH-001-MISSING_DEP", format!("Dependency '{stage}' not found"))
                            .with_fix_hint("Add the upstream stage or bind the port to an existing artifact.")
                            .with_context_entry("port", port.as_str()),
                    ));
                };
                if !upstream.runner.outputs().iter().any(|p| p == upstream_port) {
                    return Err(PipelineValidationError::new(format!(
                        "Stage '{}' reads port '{upstream_port}' which '{stage}' does not produce",
                        spec.name
                    ))
                    .with_stages(vec![spec.name.clone(), stage.clone()])
                    .with_error_info(
                        ErrorInfo::new(
                            "GRAPH-005-UNKNOWN_PORT",
                            format!("Unknown output port '{stage}.{upstream_port}'"),
                        )
                        .with_context_entry("input_port", port.as_str()),
                    ));
                }
            }
        }
        Ok(())
    }

    fn detect_cycles(&self) -> Result<(), CycleDetectedError> {
        let mut visited = BTreeSet::new();
        let mut rec_stack = BTreeSet::new();
        let mut path = Vec::new();

        for name in self.stages.keys() {
            if !visited.contains(name) {
                if let Some(cycle) = self.dfs_cycle(name, &mut visited, &mut rec_stack, &mut path) {
                    return Err(CycleDetectedError::new(cycle));
                }
            }
        }
        Ok(())
    }

    fn dfs_cycle(
        &self,
        node: &str,
        visited: &mut BTreeSet<String>,
        rec_stack: &mut BTreeSet<String>,
        path: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        visited.insert(node.to_string());
        rec_stack.insert(node.to_string());
        path.push(node.to_string());

        if let Some(spec) = self.stages.get(node) {
            for dep in spec.dependencies() {
                if !visited.contains(&dep) {
                    if let Some(cycle) = self.dfs_cycle(&dep, visited, rec_stack, path) {
                        return Some(cycle);
                    }
                } else if rec_stack.contains(&dep) {
                    let start = path.iter().position(|n| *n == dep).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(dep);
                    return Some(cycle);
                }
            }
        }

        path.pop();
        rec_stack.remove(node);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockStage;
    use std::sync::Arc;

    fn spec(name: &str) -> StageSpec {
        StageSpec::new(name, Arc::new(MockStage::new(&["out"])))
    }

    fn code(err: PipelineValidationError) -> String {
        err.error_info.map(|i| i.code).unwrap_or_default()
    }

    #[test]
    fn test_builder_add_and_build() {
        let graph = PipelineBuilder::new("sub-01")
            .stage(spec("a"))
            .unwrap()
            .stage(spec("b").with_stage_input("in", "a", "out"))
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(graph.name(), "sub-01");
        assert_eq!(graph.stage_count(), 2);
    }

    #[test]
    fn test_upstream_may_be_added_later() {
        let graph = PipelineBuilder::new("p")
            .stage(spec("b").with_stage_input("in", "a", "out"))
            .unwrap()
            .stage(spec("a"))
            .unwrap()
            .build();
        assert!(graph.is_ok());
    }

    #[test]
    fn test_duplicate_stage_rejected() {
        let err = PipelineBuilder::new("p").stage(spec("a")).unwrap().stage(spec("a")).unwrap_err();
        assert_eq!(code(err), "GRAPH-004-DUPLICATE");
    }

    #[test]
    fn test_missing_dependency() {
        let err = PipelineBuilder::new("p")
            .stage(spec("b").with_stage_input("in", "missing", "out"))
            .unwrap()
            .build()
            .unwrap_err();
        assert_eq!(code(err), "GRAPH-001-MISSING_DEP");
    }

    #[test]
    fn test_unknown_port() {
        let err = PipelineBuilder::new("p")
            .stage(spec("a"))
            .unwrap()
            .stage(spec("b").with_stage_input("in", "a", "nope"))
            .unwrap()
            .build()
            .unwrap_err();
        assert_eq!(code(err), "GRAPH-005-UNKNOWN_PORT");
    }

    #[test]
    fn test_cycle_detection() {
        let err = PipelineBuilder::new("p")
            .stage(spec("a").with_stage_input("in", "c", "out"))
            .unwrap()
            .stage(spec("b").with_stage_input("in", "a", "out"))
            .unwrap()
            .stage(spec("c").with_stage_input("in", "b", "out"))
            .unwrap()
            .build()
            .unwrap_err();
        assert_eq!(err.stages.len(), 4);
        assert_eq!(code(err), "GRAPH-002-CYCLE");
    }

    #[test]
    fn test_empty_build() {
        let err = PipelineBuilder::new("p").build().unwrap_err();
        assert_eq!(code(err), "GRAPH-003-EMPTY");
    }
}
