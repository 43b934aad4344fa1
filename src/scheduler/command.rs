//! Command nodes: reference rendering and the shell runner.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{render_value, Execution, NodeContext, NodeResult};
use crate::experiment::{interpolate, CommandNode, ExperimentNode, NodeRunStatus, Reference};
use crate::{Error, Result};

/// A fully rendered command, ready to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInvocation {
    /// Node run name
    pub run_name: String,
    /// Node name
    pub node: String,
    /// Command line with every reference substituted
    pub command: String,
    /// Working directory (the node's snapshot), if any
    pub working_dir: Option<PathBuf>,
    /// Environment variables added to the inherited environment
    pub env: BTreeMap<String, String>,
    /// Run output directory; logs go here
    pub run_dir: PathBuf,
}

/// How a command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandOutcome {
    /// Exit code, `-1` if the process was ended by a signal
    pub exit_code: i32,
}

impl CommandOutcome {
    /// Whether the command exited with code 0.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs command nodes.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `invocation` to completion.
    ///
    /// # Errors
    /// Returns [`Error::Canceled`] if `cancel` fired (the process is
    /// killed), or an IO error if it could not be started
    async fn run(
        &self,
        invocation: &CommandInvocation,
        cancel: &CancellationToken,
    ) -> Result<CommandOutcome>;
}

/// Runs commands through `sh -c`, capturing `stdout.log` and `stderr.log`
/// in the run directory.
#[derive(Debug, Clone)]
pub struct ShellCommandRunner {
    shell: PathBuf,
}

impl ShellCommandRunner {
    /// Runner using `shell` instead of `sh`.
    #[must_use]
    pub fn with_shell(shell: impl AsRef<Path>) -> Self {
        Self {
            shell: shell.as_ref().to_path_buf(),
        }
    }
}

impl Default for ShellCommandRunner {
    fn default() -> Self {
        Self::with_shell("sh")
    }
}

#[async_trait]
impl CommandRunner for ShellCommandRunner {
    async fn run(
        &self,
        invocation: &CommandInvocation,
        cancel: &CancellationToken,
    ) -> Result<CommandOutcome> {
        std::fs::create_dir_all(&invocation.run_dir)?;
        let stdout = File::create(invocation.run_dir.join("stdout.log"))?;
        let stderr = File::create(invocation.run_dir.join("stderr.log"))?;

        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(&invocation.command)
            .envs(&invocation.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);
        if let Some(dir) = &invocation.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn()?;
        tracing::debug!(node = %invocation.node, run = %invocation.run_name, pid = child.id(), "command started");
        tokio::select! {
            status = child.wait() => {
                let status = status?;
                Ok(CommandOutcome { exit_code: status.code().unwrap_or(-1) })
            }
            () = cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(node = %invocation.node, error = %e, "failed to kill command");
                }
                Err(Error::Canceled)
            }
        }
    }
}

/// Render the command line of `node`.
fn render(
    command_node: &CommandNode,
    node_inputs: &BTreeMap<String, Value>,
    ctx: &NodeContext,
    run_dir: &Path,
) -> Result<String> {
    interpolate(command_node.command(), |reference| match reference {
        Reference::Input { name } => node_inputs
            .get(name)
            .cloned()
            .map_or_else(|| ctx.input(name), Ok)
            .map(|value| render_value(&value)),
        Reference::RunOutput { name } => Ok(run_dir.join(name).display().to_string()),
        Reference::Data { name, column: None } => {
            Ok(ctx.data_path(name)?.display().to_string())
        }
        Reference::Data { name, .. } => Err(Error::Validation(format!(
            "data column references cannot be used in a command (data '{name}')"
        ))),
        Reference::NodeOutput { node, column } => {
            let output = &ctx.upstream(node)?.output;
            let key = column.as_deref().unwrap_or("output_path");
            output.get(key).map(render_value).ok_or_else(|| {
                Error::Validation(format!("node '{node}' has no output '{key}'"))
            })
        }
        Reference::NodeStatus { node } => Ok(ctx.upstream(node)?.status.as_str().to_string()),
    })
}

pub(super) async fn run_command(
    node: &ExperimentNode,
    command_node: &CommandNode,
    ctx: &NodeContext,
    run_name: &str,
    run_dir: &Path,
    cancel: &CancellationToken,
) -> Result<Execution> {
    let node_inputs = node
        .inputs()
        .iter()
        .map(|(name, binding)| Ok((name.clone(), ctx.resolve_binding(binding)?)))
        .collect::<Result<BTreeMap<_, _>>>()?;
    for output in command_node.outputs() {
        tokio::fs::create_dir_all(run_dir.join(output)).await?;
    }

    let invocation = CommandInvocation {
        run_name: run_name.to_string(),
        node: node.name().to_string(),
        command: render(command_node, &node_inputs, ctx, run_dir)?,
        working_dir: command_node.code_dir().map(Path::to_path_buf),
        env: node.environment_variables().clone(),
        run_dir: run_dir.to_path_buf(),
    };
    tracing::debug!(node = %node.name(), run = %run_name, command = %invocation.command, "running command");
    let outcome = ctx.shared.commands.run(&invocation, cancel).await?;

    let mut output = json!({
        "output_path": run_dir.display().to_string(),
        "exit_code": outcome.exit_code,
    });
    for name in command_node.outputs() {
        output[name.as_str()] = json!(run_dir.join(name).display().to_string());
    }
    let (status, error) = if outcome.success() {
        (NodeRunStatus::Completed, None)
    } else {
        (
            NodeRunStatus::Failed,
            Some(format!("command exited with code {}", outcome.exit_code)),
        )
    };

    Ok(Execution {
        result: NodeResult {
            status,
            output,
            lines: None,
        },
        output_path: Some(run_dir.to_path_buf()),
        metrics: BTreeMap::new(),
        error,
    })
}
