use super::Stage;
use crate::context::StageContext;
use crate::core::{StageKind, StageOutput};
use crate::derivatives::{DerivativeWriter, WriteOutcome};
use crate::errors::Result;
use async_trait::async_trait;
use std::path::PathBuf;

/// Copies bound inputs to their derivative paths.
///
/// One input port may be written to several destinations.
#[derive(Debug, Clone, Default)]
pub struct WriteDerivativesStage {
    targets: Vec<(String, PathBuf)>,
    writer: DerivativeWriter,
}

impl WriteDerivativesStage {
    /// Creates a stage writing with `writer`.
    #[must_use]
    pub fn new(writer: DerivativeWriter) -> Self {
        Self {
            targets: Vec::new(),
            writer,
        }
    }

    /// Writes the file bound to `port` to `dest`.
    #[must_use]
    pub fn with_target(mut self, port: impl Into<String>, dest: impl Into<PathBuf>) -> Self {
        self.targets.push((port.into(), dest.into()));
        self
    }

    /// Destinations in write order.
    #[must_use]
    pub fn targets(&self) -> &[(String, PathBuf)] {
        &self.targets
    }

    fn run(&self, ctx: &StageContext) -> Result<(usize, usize)> {
        let mut written = 0;
        let mut kept = 0;
        for (port, dest) in &self.targets {
            match self.writer.write(ctx.input(port)?, dest)? {
                WriteOutcome::Written => written += 1,
                WriteOutcome::Kept => kept += 1,
            }
        }
        Ok((written, kept))
    }
}

#[async_trait]
impl Stage for WriteDerivativesStage {
    fn name(&self) -> &str {
        "write_derivatives"
    }

    fn kind(&self) -> StageKind {
        StageKind::Write
    }

    fn outputs(&self) -> Vec<String> {
        Vec::new()
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutput {
        match self.run(ctx) {
            Ok((written, kept)) => StageOutput::ok_empty()
                .add_metadata("written", serde_json::json!(written))
                .add_metadata("kept", serde_json::json!(kept)),
            Err(e) => StageOutput::from_error(&e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageStatus;
    use crate::stages::test_support::stage_context;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_one_port_written_to_two_destinations() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("boldref.nii.gz");
        std::fs::write(&src, b"ref").unwrap();
        let a = dir.path().join("out/distorted/a_boldref.nii.gz");
        let b = dir.path().join("out/b_boldref.nii.gz");
        let stage = WriteDerivativesStage::new(DerivativeWriter::new())
            .with_target("boldref", &a)
            .with_target("boldref", &b);

        let output = stage.execute(&stage_context(dir.path(), "write", &[("boldref", src)])).await;

        assert_eq!(output.status, StageStatus::Ok);
        assert_eq!(output.metadata["written"], serde_json::json!(2));
        assert_eq!(std::fs::read(&a).unwrap(), b"ref");
        assert!(b.exists());
    }

    #[tokio::test]
    async fn test_unbound_port_fails() {
        let dir = TempDir::new().unwrap();
        let stage = WriteDerivativesStage::new(DerivativeWriter::new()).with_target("mask", dir.path().join("m"));
        let output = stage.execute(&stage_context(dir.path(), "write", &[])).await;
        assert_eq!(output.status, StageStatus::Fail);
    }
}
