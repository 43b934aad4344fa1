//! DAG Scheduler - drives every node of an experiment to a terminal status
//!
//! ## Dispatch rules
//!
//! A node is ready once every node it references is terminal. Then, in order:
//!
//! 1. an upstream `Failed` makes it `Failed` without running, unless its
//!    activate guard reads that upstream's status;
//! 2. an upstream `Canceled` makes it `Canceled` without running, with the
//!    same exemption, so a guard on `${node.status}` can react to a skip;
//! 3. a guard that does not hold makes it `Canceled` without running;
//! 4. otherwise it runs: flow nodes in the [`WorkerPool`], command nodes
//!    through the [`CommandRunner`].
//!
//! Skipped nodes still count as terminal for their own dependents.
//! Cancellation stops dispatching, in-flight nodes end `Canceled`, and nodes
//! never dispatched get no [`NodeRun`] at all.

mod command;
mod flow;

pub use command::{CommandInvocation, CommandOutcome, CommandRunner, ShellCommandRunner};

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::experiment::{
    Experiment, ExperimentNode, ExperimentStatus, MetricRecord, NodeRun, NodeRunStatus, Reference,
};
use crate::graph::ExperimentGraph;
use crate::pool::WorkerPool;
use crate::trace::{SpanContext, TraceCollector};
use crate::{Error, Result};

/// Default number of nodes running at once.
pub const DEFAULT_MAX_PARALLELISM: usize = 4;

/// Scheduler configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerConfig {
    max_parallelism: usize,
    max_node_retries: u32,
    line_error_tolerance: f64,
}

impl SchedulerConfig {
    /// Create a builder.
    #[must_use]
    pub fn builder() -> SchedulerConfigBuilder {
        SchedulerConfigBuilder::default()
    }

    /// Get the maximum number of nodes running at once.
    #[must_use]
    pub const fn max_parallelism(&self) -> usize {
        self.max_parallelism
    }

    /// Get how many times a failed node execution is re-attempted.
    #[must_use]
    pub const fn max_node_retries(&self) -> u32 {
        self.max_node_retries
    }

    /// Get the ratio of failed lines a flow node tolerates and still completes.
    #[must_use]
    pub const fn line_error_tolerance(&self) -> f64 {
        self.line_error_tolerance
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallelism: DEFAULT_MAX_PARALLELISM,
            max_node_retries: 0,
            line_error_tolerance: 0.0,
        }
    }
}

/// Builder for `SchedulerConfig`.
#[derive(Debug, Default)]
pub struct SchedulerConfigBuilder {
    config: SchedulerConfig,
}

impl SchedulerConfigBuilder {
    /// Set the maximum number of nodes running at once (at least 1).
    #[must_use]
    pub fn max_parallelism(mut self, max: usize) -> Self {
        self.config.max_parallelism = max.max(1);
        self
    }

    /// Set how many times a failed node execution is re-attempted.
    #[must_use]
    pub const fn max_node_retries(mut self, retries: u32) -> Self {
        self.config.max_node_retries = retries;
        self
    }

    /// Set the tolerated failed-line ratio, clamped to `0.0..=1.0`.
    #[must_use]
    pub fn line_error_tolerance(mut self, tolerance: f64) -> Self {
        self.config.line_error_tolerance = tolerance.clamp(0.0, 1.0);
        self
    }

    /// Build the configuration.
    #[must_use]
    pub const fn build(self) -> SchedulerConfig {
        self.config
    }
}

/// Node run transitions reported while a run is in progress.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    /// A node run was created (running, or already terminal if skipped)
    NodeRunStarted(NodeRun),
    /// A node run reached its terminal status
    NodeRunFinished {
        /// The finished run
        run: NodeRun,
        /// Metrics of an evaluation node
        metrics: Vec<MetricRecord>,
    },
}

/// Result of one scheduler run.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerReport {
    status: ExperimentStatus,
    node_runs: Vec<NodeRun>,
}

impl SchedulerReport {
    /// `Completed`, `Failed` or `Canceled`.
    #[must_use]
    pub const fn status(&self) -> ExperimentStatus {
        self.status
    }

    /// Node runs in the order they finished.
    #[must_use]
    pub fn node_runs(&self) -> &[NodeRun] {
        &self.node_runs
    }

    /// Run of a node by name.
    #[must_use]
    pub fn run_of(&self, node: &str) -> Option<&NodeRun> {
        self.node_runs.iter().find(|run| run.node() == node)
    }
}

/// Terminal result of a node, as seen by its dependents.
#[derive(Debug, Clone, PartialEq)]
struct NodeResult {
    status: NodeRunStatus,
    output: Value,
    lines: Option<Vec<Value>>,
}

impl NodeResult {
    fn skipped(status: NodeRunStatus) -> Self {
        Self {
            status,
            output: Value::Null,
            lines: None,
        }
    }
}

/// What one attempt of a node produced.
#[derive(Debug)]
struct Execution {
    result: NodeResult,
    output_path: Option<PathBuf>,
    metrics: BTreeMap<String, f64>,
    error: Option<String>,
}

impl Execution {
    fn failed(message: String) -> Self {
        Self {
            result: NodeResult::skipped(NodeRunStatus::Failed),
            output_path: None,
            metrics: BTreeMap::new(),
            error: Some(message),
        }
    }

    fn canceled() -> Self {
        Self {
            result: NodeResult::skipped(NodeRunStatus::Canceled),
            output_path: None,
            metrics: BTreeMap::new(),
            error: Some(Error::Canceled.to_string()),
        }
    }
}

/// Everything a node run needs from its experiment and the scheduler.
struct Shared {
    experiment: String,
    output_dir: PathBuf,
    inputs: BTreeMap<String, Value>,
    data: BTreeMap<String, PathBuf>,
    pool: Arc<WorkerPool>,
    commands: Arc<dyn CommandRunner>,
    collector: Arc<TraceCollector>,
    config: SchedulerConfig,
}

/// Resolution scope of one node: experiment inputs, data and the results of
/// the nodes it depends on.
struct NodeContext {
    shared: Arc<Shared>,
    upstream: HashMap<String, Arc<NodeResult>>,
}

impl NodeContext {
    fn upstream(&self, node: &str) -> Result<&NodeResult> {
        self.upstream
            .get(node)
            .map(AsRef::as_ref)
            .ok_or_else(|| Error::Validation(format!("node '{node}' has not finished")))
    }

    fn input(&self, name: &str) -> Result<Value> {
        self.shared
            .inputs
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Validation(format!("unknown input '{name}'")))
    }

    fn data_path(&self, name: &str) -> Result<&Path> {
        self.shared
            .data
            .get(name)
            .map(PathBuf::as_path)
            .ok_or_else(|| Error::Validation(format!("unknown data '{name}'")))
    }

    /// Whole-value view of a reference: what a guard compares and what a
    /// non-line input binding receives.
    fn value_of(&self, reference: &Reference) -> Result<Value> {
        match reference {
            Reference::Data { name, column: None } => {
                Ok(json!(self.data_path(name)?.display().to_string()))
            }
            Reference::Data { .. } => Ok(Value::Array(
                flow::line_values(self, reference)?.unwrap_or_default(),
            )),
            Reference::NodeOutput { node, column } => {
                let upstream = self.upstream(node)?;
                if upstream.lines.is_some() {
                    return Ok(Value::Array(
                        flow::line_values(self, reference)?.unwrap_or_default(),
                    ));
                }
                Ok(match column {
                    None => upstream.output.clone(),
                    Some(column) => upstream.output.get(column).cloned().unwrap_or(Value::Null),
                })
            }
            Reference::Input { name } => self.input(name),
            Reference::NodeStatus { node } => Ok(json!(self.upstream(node)?.status.as_str())),
            Reference::RunOutput { name } => Err(Error::Validation(format!(
                "${{outputs.{name}}} is only allowed in a command string"
            ))),
        }
    }

    fn resolve_binding(&self, binding: &Value) -> Result<Value> {
        match Reference::from_value(binding)? {
            Some(reference) => self.value_of(&reference),
            None => Ok(binding.clone()),
        }
    }
}

enum Gate {
    Run,
    Skip(NodeRunStatus, String),
}

/// Drives experiments node by node.
pub struct DagScheduler {
    config: SchedulerConfig,
    pool: Arc<WorkerPool>,
    commands: Arc<dyn CommandRunner>,
    collector: Arc<TraceCollector>,
}

impl DagScheduler {
    /// Scheduler running flow nodes in `pool` and commands through the shell.
    #[must_use]
    pub fn new(config: SchedulerConfig, pool: WorkerPool, collector: Arc<TraceCollector>) -> Self {
        Self {
            config,
            pool: Arc::new(pool),
            commands: Arc::new(ShellCommandRunner::default()),
            collector,
        }
    }

    /// Replace the command runner.
    #[must_use]
    pub fn command_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.commands = runner;
        self
    }

    /// Get the configuration.
    #[must_use]
    pub const fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Get the trace collector.
    #[must_use]
    pub const fn collector(&self) -> &Arc<TraceCollector> {
        &self.collector
    }

    /// Run every node of `experiment`, writing node outputs under
    /// `<output_dir>/runs/<run name>`.
    ///
    /// Node transitions are sent on `events` as they happen; a closed
    /// receiver is ignored. Node failures never fail the call: they are
    /// recorded in the report.
    ///
    /// # Errors
    /// Returns [`Error::Validation`] if the experiment graph is invalid
    pub async fn run(
        &self,
        experiment: &Experiment,
        output_dir: &Path,
        events: &UnboundedSender<SchedulerEvent>,
        cancel: &CancellationToken,
    ) -> Result<SchedulerReport> {
        let graph = ExperimentGraph::build(experiment)?;
        let shared = Arc::new(Shared {
            experiment: experiment.name().to_string(),
            output_dir: output_dir.to_path_buf(),
            inputs: experiment.input_values(),
            data: experiment.data_paths(),
            pool: Arc::clone(&self.pool),
            commands: Arc::clone(&self.commands),
            collector: Arc::clone(&self.collector),
            config: self.config,
        });

        let mut experiment_span = self
            .collector
            .start_span(format!("experiment {}", experiment.name()), experiment.name());
        experiment_span.set_attribute("experiment", json!(experiment.name()));
        let parent = experiment_span.context();
        tracing::info!(experiment = %experiment.name(), nodes = graph.len(), "scheduler started");

        let total = graph.len();
        let mut results: Vec<Option<Arc<NodeResult>>> = vec![None; total];
        let mut dispatched = vec![false; total];
        let mut node_runs = Vec::with_capacity(total);
        let mut running: JoinSet<(usize, NodeRun, NodeResult, Vec<MetricRecord>)> = JoinSet::new();
        let mut canceled = false;

        loop {
            canceled |= cancel.is_cancelled();
            let mut progressed = !canceled;
            while progressed {
                progressed = false;
                for &i in graph.order() {
                    if dispatched[i] || running.len() >= self.config.max_parallelism {
                        continue;
                    }
                    let Some(upstream) = graph
                        .dependencies(i)
                        .iter()
                        .map(|&d| results[d].as_ref().map(|r| (graph.name_of(d).to_string(), Arc::clone(r))))
                        .collect::<Option<HashMap<_, _>>>()
                    else {
                        continue;
                    };
                    dispatched[i] = true;
                    progressed = true;

                    let node = &experiment.nodes()[i];
                    let ctx = NodeContext {
                        shared: Arc::clone(&shared),
                        upstream,
                    };
                    let name = NodeRun::generate_name(experiment.name(), node.name());
                    let mut run = NodeRun::builder(name.clone(), experiment.name(), node.name())
                        .output_path(output_dir.join("runs").join(&name))
                        .build();

                    match gate(node, &ctx) {
                        Gate::Run => {
                            run.start();
                            tracing::info!(experiment = %experiment.name(), node = %node.name(), run = %run.name(), "node dispatched");
                            let _ = events.send(SchedulerEvent::NodeRunStarted(run.clone()));
                            running.spawn(execute(
                                i,
                                node.clone(),
                                ctx,
                                run,
                                parent.clone(),
                                cancel.clone(),
                            ));
                        }
                        Gate::Skip(status, reason) => {
                            tracing::info!(node = %node.name(), status = %status, reason = %reason, "node skipped");
                            run.set_error(reason);
                            run.complete(status);
                            let _ = events.send(SchedulerEvent::NodeRunStarted(run.clone()));
                            let _ = events.send(SchedulerEvent::NodeRunFinished {
                                run: run.clone(),
                                metrics: Vec::new(),
                            });
                            results[i] = Some(Arc::new(NodeResult::skipped(status)));
                            node_runs.push(run);
                        }
                    }
                }
            }

            if running.is_empty() {
                break;
            }
            tokio::select! {
                () = cancel.cancelled(), if !canceled => {
                    canceled = true;
                    tracing::info!(experiment = %experiment.name(), in_flight = running.len(), "cancellation requested");
                }
                joined = running.join_next() => match joined {
                    Some(Ok((i, run, result, metrics))) => {
                        if result.status == NodeRunStatus::Failed {
                            tracing::error!(node = %run.node(), run = %run.name(), error = run.error().unwrap_or_default(), "node failed");
                        } else {
                            tracing::info!(node = %run.node(), run = %run.name(), status = %run.status(), "node finished");
                        }
                        let _ = events.send(SchedulerEvent::NodeRunFinished { run: run.clone(), metrics });
                        results[i] = Some(Arc::new(result));
                        node_runs.push(run);
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "node task was lost");
                    }
                    None => break,
                },
            }
        }

        let status = if canceled || cancel.is_cancelled() {
            ExperimentStatus::Canceled
        } else if node_runs
            .iter()
            .any(|run| run.status() == NodeRunStatus::Failed)
        {
            ExperimentStatus::Failed
        } else {
            ExperimentStatus::Completed
        };
        experiment_span.set_attribute("status", json!(status.as_str()));
        experiment_span.finish();
        tracing::info!(experiment = %experiment.name(), status = %status, "scheduler finished");

        Ok(SchedulerReport { status, node_runs })
    }
}

impl std::fmt::Debug for DagScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DagScheduler")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

/// Decide whether a ready node runs.
fn gate(node: &ExperimentNode, ctx: &NodeContext) -> Gate {
    let condition = node.activate_condition();
    let guarded = condition
        .and_then(|c| c.reference().ok())
        .and_then(|r| match r {
            Reference::NodeStatus { node } => Some(node),
            _ => None,
        });

    let mut upstream: Vec<(&String, &Arc<NodeResult>)> = ctx.upstream.iter().collect();
    upstream.sort_by(|a, b| a.0.cmp(b.0));
    for wanted in [NodeRunStatus::Failed, NodeRunStatus::Canceled] {
        if let Some((name, _)) = upstream
            .iter()
            .find(|(name, r)| r.status == wanted && guarded.as_deref() != Some(name.as_str()))
        {
            let verb = if wanted == NodeRunStatus::Failed { "failed" } else { "was canceled" };
            return Gate::Skip(wanted, format!("upstream node '{name}' {verb}"));
        }
    }

    let Some(condition) = condition else {
        return Gate::Run;
    };
    match condition
        .reference()
        .and_then(|reference| ctx.value_of(&reference))
    {
        Ok(value) if guard_matches(&value, &condition.is) => Gate::Run,
        Ok(value) => Gate::Skip(
            NodeRunStatus::Canceled,
            format!(
                "activate condition not met: {} is {value}, expected {}",
                condition.when, condition.is
            ),
        ),
        Err(e) => Gate::Skip(NodeRunStatus::Failed, format!("activate condition: {e}")),
    }
}

fn guard_matches(value: &Value, expected: &Value) -> bool {
    value == expected || render_value(value) == render_value(expected)
}

/// Text form of a value: strings raw, everything else as JSON.
fn render_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Run one dispatched node to a terminal status, retrying failed attempts.
async fn execute(
    index: usize,
    node: ExperimentNode,
    ctx: NodeContext,
    mut run: NodeRun,
    parent: SpanContext,
    cancel: CancellationToken,
) -> (usize, NodeRun, NodeResult, Vec<MetricRecord>) {
    let shared = Arc::clone(&ctx.shared);
    let mut span = shared
        .collector
        .start_child_span(format!("node {}", node.name()), &parent, run.name());
    span.set_attribute("node", json!(node.name()));
    span.set_attribute("experiment", json!(shared.experiment));
    let run_dir = shared.output_dir.join("runs").join(run.name());
    let max_retries = shared.config.max_node_retries;

    let ctx = Arc::new(ctx);
    let execution = loop {
        run.record_attempt();
        let handle = {
            let ctx = Arc::clone(&ctx);
            let node = node.clone();
            let run_name = run.name().to_string();
            let run_dir = run_dir.clone();
            let parent = span.context();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_attempt(&node, &ctx, &run_name, &run_dir, parent, &cancel).await
            })
        };
        let execution = match handle.await {
            Ok(Ok(execution)) => execution,
            Ok(Err(Error::Canceled)) => Execution::canceled(),
            Ok(Err(e)) => Execution::failed(e.to_string()),
            Err(e) => Execution::failed(format!("node execution panicked: {e}")),
        };
        let execution = if cancel.is_cancelled() && execution.result.status != NodeRunStatus::Completed {
            Execution::canceled()
        } else {
            execution
        };
        if execution.result.status != NodeRunStatus::Failed || run.attempts() > max_retries {
            break execution;
        }
        tracing::warn!(node = %node.name(), run = %run.name(), attempt = run.attempts(), error = execution.error.as_deref().unwrap_or_default(), "node attempt failed, retrying");
    };

    let Execution {
        result,
        output_path,
        metrics,
        error,
    } = execution;
    run.set_output(result.output.clone(), output_path.or(Some(run_dir)));
    if let Some(error) = error {
        run.set_error(error);
    }
    run.set_metrics(metrics);
    run.complete(result.status);
    let records = MetricRecord::from_run(&run);

    span.set_attribute("status", json!(result.status.as_str()));
    span.set_attribute("attempts", json!(run.attempts()));
    span.finish();
    (index, run, result, records)
}

async fn run_attempt(
    node: &ExperimentNode,
    ctx: &NodeContext,
    run_name: &str,
    run_dir: &Path,
    parent: SpanContext,
    cancel: &CancellationToken,
) -> Result<Execution> {
    tokio::fs::create_dir_all(run_dir).await?;
    match node {
        ExperimentNode::Flow(flow_node) => {
            flow::run_flow(node, flow_node, ctx, run_name, run_dir, parent, cancel).await
        }
        ExperimentNode::Command(command_node) => {
            command::run_command(node, command_node, ctx, run_name, run_dir, cancel).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder_clamps() {
        let config = SchedulerConfig::builder()
            .max_parallelism(0)
            .line_error_tolerance(2.0)
            .max_node_retries(3)
            .build();
        assert_eq!(config.max_parallelism(), 1);
        assert!((config.line_error_tolerance() - 1.0).abs() < f64::EPSILON);
        assert_eq!(config.max_node_retries(), 3);
        assert_eq!(SchedulerConfig::default().max_parallelism(), DEFAULT_MAX_PARALLELISM);
    }

    #[test]
    fn test_guard_matching_compares_text_forms() {
        assert!(guard_matches(&json!("Completed"), &json!("Completed")));
        assert!(guard_matches(&json!(true), &json!("true")));
        assert!(guard_matches(&json!(1), &json!(1)));
        assert!(!guard_matches(&json!("Failed"), &json!("Completed")));
    }
}
