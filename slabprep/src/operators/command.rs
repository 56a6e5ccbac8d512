//! Operators backed by shell command templates.

use super::registration::{RegistrationOperator, RegistrationOutput, RegistrationRequest, REGISTRATION_OPERATOR};
use super::toolbox::{ExternalToolbox, OperatorInvocation};
use crate::config::ToolboxConfig;
use crate::errors::OperatorError;
use async_trait::async_trait;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, info};

const PLACEHOLDER: &str = r"\{(in|out|param):([A-Za-z0-9_]+)\}|\{workdir\}";
const STDERR_TAIL: usize = 2000;

/// Values a template can refer to.
#[derive(Debug, Default)]
pub struct TemplateBindings<'a> {
    /// Input files by port.
    pub inputs: BTreeMap<&'a str, &'a Path>,
    /// Output files by port.
    pub outputs: BTreeMap<&'a str, &'a Path>,
    /// Rendered parameters.
    pub params: BTreeMap<&'a str, String>,
    /// Working directory.
    pub workdir: Option<&'a Path>,
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn param_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        serde_json::Value::Array(items) => items.iter().map(param_text).collect::<Vec<_>>().join(","),
        other => other.to_string(),
    }
}

/// Substitutes placeholders; every substituted value is shell-quoted.
pub fn render_template(operator: &str, template: &str, bindings: &TemplateBindings<'_>) -> Result<String, OperatorError> {
    let pattern = Regex::new(PLACEHOLDER)
        .map_err(|e| OperatorError::invalid_request(operator, format!("bad placeholder pattern: {e}")))?;
    let missing = |kind: &str, name: &str| {
        OperatorError::invalid_request(operator, format!("template refers to unbound {kind} '{name}'"))
    };

    let mut rendered = String::with_capacity(template.len());
    let mut last = 0;
    for caps in pattern.captures_iter(template) {
        let Some(whole) = caps.get(0) else { continue };
        rendered.push_str(&template[last..whole.start()]);
        last = whole.end();

        let value = match (caps.get(1).map(|m| m.as_str()), caps.get(2).map(|m| m.as_str())) {
            (Some("in"), Some(name)) => bindings
                .inputs
                .get(name)
                .map(|p| p.display().to_string())
                .ok_or_else(|| missing("input", name))?,
            (Some("out"), Some(name)) => bindings
                .outputs
                .get(name)
                .map(|p| p.display().to_string())
                .ok_or_else(|| missing("output", name))?,
            (Some(_), Some(name)) => bindings.params.get(name).cloned().ok_or_else(|| missing("parameter", name))?,
            _ => bindings
                .workdir
                .map(|p| p.display().to_string())
                .ok_or_else(|| missing("directory", "workdir"))?,
        };
        rendered.push_str(&quote(&value));
    }
    rendered.push_str(&template[last..]);
    Ok(rendered)
}

fn tail(text: &str) -> String {
    let start = text.len().saturating_sub(STDERR_TAIL);
    let start = (start..text.len()).find(|i| text.is_char_boundary(*i)).unwrap_or(text.len());
    text[start..].trim().to_string()
}

/// Runs rendered templates through a shell.
#[derive(Debug, Clone)]
pub struct CommandToolbox {
    config: ToolboxConfig,
    nthreads: usize,
}

impl CommandToolbox {
    /// Creates a toolbox from configured templates.
    #[must_use]
    pub const fn new(config: ToolboxConfig, nthreads: usize) -> Self {
        Self { config, nthreads }
    }

    async fn execute(&self, operator: &str, command: &str, workdir: &Path) -> Result<(), OperatorError> {
        std::fs::create_dir_all(workdir).map_err(|e| OperatorError::Failed {
            operator: operator.to_string(),
            status: None,
            stderr: format!("cannot create {}: {e}", workdir.display()),
        })?;
        debug!(operator, command, "running external command");
        let start = Instant::now();
        let output = Command::new(&self.config.shell)
            .arg("-c")
            .arg(command)
            .current_dir(workdir)
            .env("OMP_NUM_THREADS", self.nthreads.to_string())
            .output()
            .await
            .map_err(|e| OperatorError::Failed {
                operator: operator.to_string(),
                status: None,
                stderr: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(OperatorError::Failed {
                operator: operator.to_string(),
                status: output.status.code(),
                stderr: tail(&String::from_utf8_lossy(&output.stderr)),
            });
        }
        info!(
            operator,
            duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            "external command finished"
        );
        Ok(())
    }

    fn template(&self, operator: &str) -> Result<&str, OperatorError> {
        self.config.template(operator).ok_or_else(|| OperatorError::NotConfigured {
            operator: operator.to_string(),
        })
    }
}

#[async_trait]
impl ExternalToolbox for CommandToolbox {
    async fn run(&self, invocation: &OperatorInvocation) -> Result<BTreeMap<String, PathBuf>, OperatorError> {
        let operator = invocation.op.name();
        let template = self.template(operator)?;
        let expected = invocation.expected_outputs();
        let params: BTreeMap<&str, String> = invocation
            .params
            .iter()
            .map(|(k, v)| (k.as_str(), param_text(v)))
            .collect();
        let bindings = TemplateBindings {
            inputs: invocation.inputs.iter().map(|(k, v)| (k.as_str(), v.as_path())).collect(),
            outputs: expected.iter().map(|(k, v)| (k.as_str(), v.as_path())).collect(),
            params,
            workdir: Some(&invocation.workdir),
        };
        let command = render_template(operator, template, &bindings)?;
        self.execute(operator, &command, &invocation.workdir).await?;
        invocation.collect_outputs()
    }
}

/// Registration through the `registration` command template.
///
/// The template sees `{in:moving}`, `{in:fixed}`, `{in:segmentation}`,
/// `{param:dof}`, `{param:cost}`, `{out:forward_mat}` and `{out:report}`.
#[derive(Debug, Clone)]
pub struct CommandRegistration {
    toolbox: CommandToolbox,
}

impl CommandRegistration {
    /// Creates the operator.
    #[must_use]
    pub const fn new(config: ToolboxConfig, nthreads: usize) -> Self {
        Self {
            toolbox: CommandToolbox::new(config, nthreads),
        }
    }
}

#[async_trait]
impl RegistrationOperator for CommandRegistration {
    async fn register(&self, request: &RegistrationRequest) -> Result<RegistrationOutput, OperatorError> {
        request.validate()?;
        let template = self.toolbox.template(REGISTRATION_OPERATOR)?;
        let output = RegistrationOutput {
            forward_mat: request.workdir.join("forward.mat"),
            report: request.workdir.join("report.svg"),
        };

        let mut inputs: BTreeMap<&str, &Path> = BTreeMap::new();
        inputs.insert("moving", &request.moving);
        inputs.insert("fixed", &request.fixed);
        if let Some(seg) = &request.segmentation {
            inputs.insert("segmentation", seg);
        }
        let bindings = TemplateBindings {
            inputs,
            outputs: [
                ("forward_mat", output.forward_mat.as_path()),
                ("report", output.report.as_path()),
            ]
            .into_iter()
            .collect(),
            params: [("dof", request.dof.to_string()), ("cost", request.cost().to_string())]
                .into_iter()
                .collect(),
            workdir: Some(&request.workdir),
        };
        let command = render_template(REGISTRATION_OPERATOR, template, &bindings)?;
        self.toolbox.execute(REGISTRATION_OPERATOR, &command, &request.workdir).await?;

        for (port, path) in [("forward_mat", &output.forward_mat), ("report", &output.report)] {
            if !path.exists() {
                return Err(OperatorError::MissingOutput {
                    operator: REGISTRATION_OPERATOR.to_string(),
                    port: port.to_string(),
                    path: path.clone(),
                });
            }
        }
        Ok(output)
    }
}
