//! Node Run - one dispatch of one experiment node

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status of a node run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeRunStatus {
    /// Dispatched but not yet executing.
    Queued,
    /// Currently executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Failed, either itself or propagated from an upstream node.
    Failed,
    /// Skipped by its activate guard, or stopped by cancellation.
    Canceled,
}

impl NodeRunStatus {
    /// Whether the status is final.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// Display name, also the value `${<node>.status}` resolves to.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "Queued",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Canceled => "Canceled",
        }
    }
}

impl fmt::Display for NodeRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Node Run records a single execution of an experiment node.
///
/// Each start of an experiment appends one node run per dispatched node;
/// earlier runs are never rewritten.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeRun {
    name: String,
    experiment: String,
    node: String,
    status: NodeRunStatus,
    #[serde(default)]
    attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    output_path: Option<PathBuf>,
    #[serde(default)]
    metrics: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
}

impl NodeRun {
    /// Create a queued run with a generated name `<experiment>_<node>_<suffix>`.
    #[must_use]
    pub fn new(experiment: impl Into<String>, node: impl Into<String>) -> Self {
        let experiment = experiment.into();
        let node = node.into();
        Self::builder(Self::generate_name(&experiment, &node), experiment, node).build()
    }

    /// Fresh run name `<experiment>_<node>_<8 hex chars>`.
    #[must_use]
    pub fn generate_name(experiment: &str, node: &str) -> String {
        let mut suffix = uuid::Uuid::new_v4().simple().to_string();
        suffix.truncate(8);
        format!("{experiment}_{node}_{suffix}")
    }

    /// Create a builder for a run with an explicit name.
    #[must_use]
    pub fn builder(
        name: impl Into<String>,
        experiment: impl Into<String>,
        node: impl Into<String>,
    ) -> NodeRunBuilder {
        NodeRunBuilder::new(name, experiment, node)
    }

    /// Get the run name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the parent experiment name.
    #[must_use]
    pub fn experiment(&self) -> &str {
        &self.experiment
    }

    /// Get the node name.
    #[must_use]
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Get the current status.
    #[must_use]
    pub const fn status(&self) -> NodeRunStatus {
        self.status
    }

    /// Get the number of execution attempts.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Get the output reference, once finished.
    #[must_use]
    pub const fn output(&self) -> Option<&Value> {
        self.output.as_ref()
    }

    /// Get the output directory.
    #[must_use]
    pub fn output_path(&self) -> Option<&Path> {
        self.output_path.as_deref()
    }

    /// Get aggregated metrics (evaluation nodes only).
    #[must_use]
    pub const fn metrics(&self) -> &BTreeMap<String, f64> {
        &self.metrics
    }

    /// Get the failure or skip reason.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Get the creation timestamp.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Get the start timestamp, if execution began.
    #[must_use]
    pub const fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Get the end timestamp, if finished.
    #[must_use]
    pub const fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// Start the run, transitioning from Queued to Running.
    ///
    /// Sets the `started_at` timestamp to now.
    pub fn start(&mut self) {
        self.status = NodeRunStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Count one more execution attempt.
    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    /// Attach the output reference and directory.
    pub fn set_output(&mut self, output: Value, output_path: Option<PathBuf>) {
        self.output = Some(output);
        self.output_path = output_path;
    }

    /// Attach aggregated metrics.
    pub fn set_metrics(&mut self, metrics: BTreeMap<String, f64>) {
        self.metrics = metrics;
    }

    /// Attach a failure or skip reason.
    pub fn set_error(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
    }

    /// Complete the run with the given terminal status.
    ///
    /// Sets the `ended_at` timestamp to now.
    pub fn complete(&mut self, status: NodeRunStatus) {
        self.status = status;
        self.ended_at = Some(Utc::now());
    }
}

/// Builder for `NodeRun`.
#[derive(Debug)]
pub struct NodeRunBuilder {
    name: String,
    experiment: String,
    node: String,
    output_path: Option<PathBuf>,
}

impl NodeRunBuilder {
    /// Create a new builder with required fields.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        experiment: impl Into<String>,
        node: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            experiment: experiment.into(),
            node: node.into(),
            output_path: None,
        }
    }

    /// Set the output directory up front.
    #[must_use]
    pub fn output_path(mut self, path: impl AsRef<Path>) -> Self {
        self.output_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Build the `NodeRun` in Queued status.
    #[must_use]
    pub fn build(self) -> NodeRun {
        NodeRun {
            name: self.name,
            experiment: self.experiment,
            node: self.node,
            status: NodeRunStatus::Queued,
            attempts: 0,
            output: None,
            output_path: self.output_path,
            metrics: BTreeMap::new(),
            error: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }
}
