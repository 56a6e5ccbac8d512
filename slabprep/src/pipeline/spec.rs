//! Stage specifications: a runner plus where each input port comes from.

use crate::core::StageKind;
use crate::errors::PipelineValidationError;
use crate::stages::Stage;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

/// Where an input port's file comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InputBinding {
    /// An output port of an upstream stage.
    Stage {
        /// Upstream stage name.
        stage: String,
        /// Its output port.
        port: String,
    },
    /// A file that already exists (raw input or a resumed derivative).
    Artifact(PathBuf),
}

impl InputBinding {
    /// Binds an upstream stage's output port.
    #[must_use]
    pub fn stage(stage: impl Into<String>, port: impl Into<String>) -> Self {
        Self::Stage {
            stage: stage.into(),
            port: port.into(),
        }
    }

    /// Binds an existing file.
    #[must_use]
    pub fn artifact(path: impl Into<PathBuf>) -> Self {
        Self::Artifact(path.into())
    }

    /// The upstream stage, if any.
    #[must_use]
    pub fn upstream(&self) -> Option<&str> {
        match self {
            Self::Stage { stage, .. } => Some(stage),
            Self::Artifact(_) => None,
        }
    }
}

/// Specification for a single stage in the graph.
#[derive(Debug, Clone)]
pub struct StageSpec {
    /// The unique name of the stage.
    pub name: String,
    /// The stage implementation.
    pub runner: Arc<dyn Stage>,
    /// Input port bindings.
    pub inputs: BTreeMap<String, InputBinding>,
    /// The kind of stage.
    pub kind: StageKind,
}

impl StageSpec {
    /// Creates a new stage specification.
    #[must_use]
    pub fn new(name: impl Into<String>, runner: Arc<dyn Stage>) -> Self {
        let kind = runner.kind();
        Self {
            name: name.into(),
            runner,
            inputs: BTreeMap::new(),
            kind,
        }
    }

    /// Binds `port` to an input.
    #[must_use]
    pub fn with_input(mut self, port: impl Into<String>, binding: InputBinding) -> Self {
        self.inputs.insert(port.into(), binding);
        self
    }

    /// Binds `port` to `upstream`'s output `upstream_port`.
    #[must_use]
    pub fn with_stage_input(self, port: impl Into<String>, upstream: impl Into<String>, upstream_port: impl Into<String>) -> Self {
        self.with_input(port, InputBinding::stage(upstream, upstream_port))
    }

    /// Binds `port` to an existing file.
    #[must_use]
    pub fn with_artifact(self, port: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.with_input(port, InputBinding::artifact(path))
    }

    /// Names of the upstream stages.
    #[must_use]
    pub fn dependencies(&self) -> BTreeSet<String> {
        self.inputs
            .values()
            .filter_map(InputBinding::upstream)
            .map(str::to_string)
            .collect()
    }

    /// Validates the stage specification.
    ///
    /// # Errors
    ///
    /// Returns an error if the stage reads one of its own outputs.
    pub fn validate(&self) -> Result<(), PipelineValidationError> {
        if self.dependencies().contains(&self.name) {
            return Err(PipelineValidationError::new(format!(
                "Stage '{}' cannot depend on itself",
                self.name
            ))
            .with_stages(vec![self.name.clone()]));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockStage;

    #[test]
    fn test_stage_spec_dependencies_from_bindings() {
        let spec = StageSpec::new("compose", Arc::new(MockStage::new(&["warp"])))
            .with_stage_input("link0_mat", "register", "forward_mat")
            .with_stage_input("link0_moving", "boldref", "boldref")
            .with_stage_input("source_ref", "boldref", "boldref")
            .with_artifact("target_ref", "/d/t1w.nii.gz");

        assert_eq!(spec.inputs.len(), 4);
        assert_eq!(
            spec.dependencies().into_iter().collect::<Vec<_>>(),
            vec!["boldref".to_string(), "register".to_string()]
        );
        assert_eq!(spec.kind, StageKind::Operator);
    }

    #[test]
    fn test_stage_spec_self_dependency() {
        let spec = StageSpec::new("a", Arc::new(MockStage::new(&["x"]))).with_stage_input("in", "a", "x");
        assert!(spec.validate().is_err());
    }
}
