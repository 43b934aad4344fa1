//! Experiment - root entity: a DAG of flow and command nodes with a lifecycle

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ExperimentNode, NodeRun};
use crate::{Error, Result};

/// Lifecycle status of an experiment.
///
/// ```text
/// NotStarted ─start─► Queuing ─► InProgress ─► Completed | Failed | Canceled ─► Terminated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ExperimentStatus {
    /// Never started.
    #[default]
    NotStarted,
    /// Start accepted, scheduler not yet running.
    Queuing,
    /// Scheduler running.
    InProgress,
    /// Every node finished and none failed.
    Completed,
    /// At least one node failed.
    Failed,
    /// Stopped before every node finished.
    Canceled,
    /// Run over; see [`Experiment::last_run_status`] for how it ended.
    Terminated,
}

impl ExperimentStatus {
    /// Whether a run is in flight (start is illegal).
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Queuing | Self::InProgress)
    }

    /// Display name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "NotStarted",
            Self::Queuing => "Queuing",
            Self::InProgress => "InProgress",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Canceled => "Canceled",
            Self::Terminated => "Terminated",
        }
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named data file (JSON lines) supplied to the experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentData {
    /// Data name, referenced as `${data.<name>}`
    pub name: String,
    /// Path of the JSON-lines file
    pub path: PathBuf,
}

impl ExperimentData {
    /// Data `name` read from `path`.
    #[must_use]
    pub fn new(name: impl Into<String>, path: impl AsRef<Path>) -> Self {
        Self {
            name: name.into(),
            path: path.as_ref().to_path_buf(),
        }
    }
}

/// Declared type of an experiment input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    /// Signed integer
    Int,
    /// Floating point number
    Float,
    /// Boolean
    Bool,
    /// Text
    String,
    /// JSON array
    List,
    /// JSON object
    Object,
}

impl InputType {
    /// Resolve `value` to this type. Strings are parsed where the type allows.
    ///
    /// # Errors
    /// Returns [`Error::Validation`] if the value does not fit
    pub fn coerce(self, value: &Value) -> Result<Value> {
        let fits = match (self, value) {
            (Self::Int, Value::Number(n)) if n.is_i64() || n.is_u64() => Some(value.clone()),
            (Self::Float, Value::Number(_))
            | (Self::Bool, Value::Bool(_))
            | (Self::String, Value::String(_))
            | (Self::List, Value::Array(_))
            | (Self::Object, Value::Object(_)) => Some(value.clone()),
            (Self::String, other) => Some(Value::String(other.to_string())),
            (Self::Int, Value::String(s)) => s.trim().parse::<i64>().ok().map(Value::from),
            (Self::Float, Value::String(s)) => s.trim().parse::<f64>().ok().map(Value::from),
            (Self::Bool, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },
            (Self::List | Self::Object, Value::String(s)) => serde_json::from_str::<Value>(s)
                .ok()
                .filter(|parsed| matches!((self, parsed), (Self::List, Value::Array(_)) | (Self::Object, Value::Object(_)))),
            _ => None,
        };
        fits.ok_or_else(|| Error::Validation(format!("value {value} is not a valid {self:?}")))
    }
}

/// Named, typed scalar supplied to the experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentInput {
    /// Input name, referenced as `${inputs.<name>}`
    pub name: String,
    /// Declared type
    #[serde(rename = "type")]
    pub input_type: InputType,
    /// Default value, resolved to `input_type`
    pub default: Value,
}

impl ExperimentInput {
    /// Input `name` of `input_type` with `default`, resolved to the type.
    ///
    /// # Errors
    /// Returns [`Error::Validation`] if `default` does not fit `input_type`
    pub fn new(name: impl Into<String>, input_type: InputType, default: Value) -> Result<Self> {
        Self {
            name: name.into(),
            input_type,
            default,
        }
        .resolved()
    }

    /// Resolve the default to the declared type, e.g. after deserializing.
    ///
    /// # Errors
    /// Returns [`Error::Validation`] if `default` does not fit `input_type`
    pub fn resolved(mut self) -> Result<Self> {
        self.default = self
            .input_type
            .coerce(&self.default)
            .map_err(|e| Error::Validation(format!("input '{}': {e}", self.name)))?;
        Ok(self)
    }
}

/// Already-loaded experiment definition, before materialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentTemplate {
    /// Experiment name
    pub name: String,
    /// Free-form description
    #[serde(default)]
    pub description: Option<String>,
    /// Nodes in declaration order
    #[serde(default)]
    pub nodes: Vec<ExperimentNode>,
    /// Data files
    #[serde(default)]
    pub data: Vec<ExperimentData>,
    /// Inputs; defaults may be raw and are resolved by
    /// [`Experiment::from_template`]
    #[serde(default)]
    pub inputs: Vec<ExperimentInput>,
}

/// Experiment represents a DAG of nodes and the history of its runs.
///
/// Only the controller mutates status and node runs; nodes report results
/// that the controller folds in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Experiment {
    name: String,
    #[serde(default)]
    description: Option<String>,
    nodes: Vec<ExperimentNode>,
    #[serde(default)]
    data: Vec<ExperimentData>,
    #[serde(default)]
    inputs: Vec<ExperimentInput>,
    #[serde(default)]
    status: ExperimentStatus,
    #[serde(default)]
    last_run_status: Option<ExperimentStatus>,
    #[serde(default)]
    node_runs: BTreeMap<String, Vec<NodeRun>>,
    #[serde(default)]
    output_dir: Option<PathBuf>,
    created_on: DateTime<Utc>,
    #[serde(default)]
    last_start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    last_end_time: Option<DateTime<Utc>>,
}

impl Experiment {
    /// Create an empty experiment in `NotStarted` status.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::builder(name).build()
    }

    /// Create a builder.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> ExperimentBuilder {
        ExperimentBuilder::new(name)
    }

    /// Materialize a template under `output_root`.
    ///
    /// Resolves every input default to its declared type, then allocates `<output_root>/<name>/` and copies every node's source
    /// directory to `<output_dir>/snapshots/<node>`, pointing the node at
    /// the snapshot. A command node without code gets an empty snapshot.
    ///
    /// # Errors
    /// Returns [`Error::Validation`] for an input default that does not fit
    /// its type, duplicate node names or a missing flow source, or an IO
    /// error if copying fails
    pub fn from_template(template: ExperimentTemplate, output_root: impl AsRef<Path>) -> Result<Self> {
        let inputs = template
            .inputs
            .into_iter()
            .map(ExperimentInput::resolved)
            .collect::<Result<Vec<_>>>()?;
        let output_dir = output_root.as_ref().join(&template.name);
        let snapshots = output_dir.join("snapshots");
        fs::create_dir_all(&snapshots)?;

        let mut seen = std::collections::BTreeSet::new();
        if let Some(duplicate) = template.nodes.iter().find(|n| !seen.insert(n.name())) {
            return Err(Error::Validation(format!(
                "duplicate node name '{}'",
                duplicate.name()
            )));
        }

        let mut nodes = Vec::with_capacity(template.nodes.len());
        for mut node in template.nodes {
            let target = snapshots.join(node.name());
            if target.exists() {
                fs::remove_dir_all(&target)?;
            }
            match node.source_dir() {
                Some(source) if source.is_dir() => copy_dir(source, &target)?,
                Some(source) if source.is_file() => {
                    fs::create_dir_all(&target)?;
                    if let Some(file_name) = source.file_name() {
                        fs::copy(source, target.join(file_name))?;
                    }
                }
                Some(source) => {
                    return Err(Error::Validation(format!(
                        "node '{}' source {} does not exist",
                        node.name(),
                        source.display()
                    )))
                }
                None => fs::create_dir_all(&target)?,
            }
            node.set_source_dir(target);
            nodes.push(node);
        }
        tracing::debug!(experiment = %template.name, nodes = nodes.len(), "materialized snapshots");

        Ok(Self {
            nodes,
            output_dir: Some(output_dir),
            ..Self::builder(template.name)
                .description_opt(template.description)
                .data_list(template.data)
                .input_list(inputs)
                .build()
        })
    }

    /// Get the experiment name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the description.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Get the nodes in declaration order.
    #[must_use]
    pub fn nodes(&self) -> &[ExperimentNode] {
        &self.nodes
    }

    /// Get a node by name.
    #[must_use]
    pub fn node(&self, name: &str) -> Option<&ExperimentNode> {
        self.nodes.iter().find(|n| n.name() == name)
    }

    /// Get the data files.
    #[must_use]
    pub fn data(&self) -> &[ExperimentData] {
        &self.data
    }

    /// Get the inputs.
    #[must_use]
    pub fn inputs(&self) -> &[ExperimentInput] {
        &self.inputs
    }

    /// Get the current status.
    #[must_use]
    pub const fn status(&self) -> ExperimentStatus {
        self.status
    }

    /// Get how the last run ended (`Completed`, `Failed` or `Canceled`).
    #[must_use]
    pub const fn last_run_status(&self) -> Option<ExperimentStatus> {
        self.last_run_status
    }

    /// Get the node run history, per node, oldest first.
    #[must_use]
    pub const fn node_runs(&self) -> &BTreeMap<String, Vec<NodeRun>> {
        &self.node_runs
    }

    /// Get the run history of one node.
    #[must_use]
    pub fn runs_of(&self, node: &str) -> &[NodeRun] {
        self.node_runs.get(node).map_or(&[], Vec::as_slice)
    }

    /// Get the output directory, once materialized.
    #[must_use]
    pub fn output_dir(&self) -> Option<&Path> {
        self.output_dir.as_deref()
    }

    /// Get the creation timestamp.
    #[must_use]
    pub const fn created_on(&self) -> DateTime<Utc> {
        self.created_on
    }

    /// Get the last start timestamp.
    #[must_use]
    pub const fn last_start_time(&self) -> Option<DateTime<Utc>> {
        self.last_start_time
    }

    /// Get the last end timestamp.
    #[must_use]
    pub const fn last_end_time(&self) -> Option<DateTime<Utc>> {
        self.last_end_time
    }

    /// Input defaults by name.
    #[must_use]
    pub fn input_values(&self) -> BTreeMap<String, Value> {
        self.inputs
            .iter()
            .map(|input| (input.name.clone(), input.default.clone()))
            .collect()
    }

    /// Data paths by name.
    #[must_use]
    pub fn data_paths(&self) -> BTreeMap<String, PathBuf> {
        self.data
            .iter()
            .map(|data| (data.name.clone(), data.path.clone()))
            .collect()
    }

    pub(crate) fn set_status(&mut self, status: ExperimentStatus) {
        self.status = status;
    }

    pub(crate) fn mark_started(&mut self) {
        self.status = ExperimentStatus::Queuing;
        self.last_start_time = Some(Utc::now());
        self.last_end_time = None;
    }

    pub(crate) fn mark_terminated(&mut self, outcome: ExperimentStatus) {
        self.last_run_status = Some(outcome);
        self.status = ExperimentStatus::Terminated;
        self.last_end_time = Some(Utc::now());
    }

    pub(crate) fn set_output_dir(&mut self, dir: PathBuf) {
        self.output_dir = Some(dir);
    }

    /// Keep status and history from an earlier version of this experiment.
    pub(crate) fn inherit_history(&mut self, previous: &Self) {
        self.status = previous.status;
        self.last_run_status = previous.last_run_status;
        self.node_runs.clone_from(&previous.node_runs);
        self.created_on = previous.created_on;
        self.last_start_time = previous.last_start_time;
        self.last_end_time = previous.last_end_time;
        if self.output_dir.is_none() {
            self.output_dir.clone_from(&previous.output_dir);
        }
    }

    /// Append a new node run, or replace the one with the same run name.
    pub(crate) fn upsert_node_run(&mut self, run: NodeRun) {
        let runs = self.node_runs.entry(run.node().to_string()).or_default();
        match runs.iter_mut().find(|existing| existing.name() == run.name()) {
            Some(existing) => *existing = run,
            None => runs.push(run),
        }
    }

    /// Node runs that have not reached a terminal status.
    pub(crate) fn unfinished_runs_mut(&mut self) -> impl Iterator<Item = &mut NodeRun> {
        self.node_runs
            .values_mut()
            .flatten()
            .filter(|run| !run.status().is_terminal())
    }
}

/// Builder for `Experiment`.
#[derive(Debug)]
pub struct ExperimentBuilder {
    name: String,
    description: Option<String>,
    nodes: Vec<ExperimentNode>,
    data: Vec<ExperimentData>,
    inputs: Vec<ExperimentInput>,
    output_dir: Option<PathBuf>,
}

impl ExperimentBuilder {
    /// Create a new builder with the required name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            nodes: Vec::new(),
            data: Vec::new(),
            inputs: Vec::new(),
            output_dir: None,
        }
    }

    /// Set the description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    fn description_opt(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }

    /// Append a node.
    #[must_use]
    pub fn node(mut self, node: impl Into<ExperimentNode>) -> Self {
        self.nodes.push(node.into());
        self
    }

    /// Add a data file.
    #[must_use]
    pub fn data(mut self, data: ExperimentData) -> Self {
        self.data.push(data);
        self
    }

    fn data_list(mut self, data: Vec<ExperimentData>) -> Self {
        self.data = data;
        self
    }

    /// Add an input.
    #[must_use]
    pub fn input(mut self, input: ExperimentInput) -> Self {
        self.inputs.push(input);
        self
    }

    fn input_list(mut self, inputs: Vec<ExperimentInput>) -> Self {
        self.inputs = inputs;
        self
    }

    /// Set the output directory (otherwise allocated by the controller).
    #[must_use]
    pub fn output_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.output_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Build the `Experiment` in `NotStarted` status.
    #[must_use]
    pub fn build(self) -> Experiment {
        Experiment {
            name: self.name,
            description: self.description,
            nodes: self.nodes,
            data: self.data,
            inputs: self.inputs,
            status: ExperimentStatus::NotStarted,
            last_run_status: None,
            node_runs: BTreeMap::new(),
            output_dir: self.output_dir,
            created_on: Utc::now(),
            last_start_time: None,
            last_end_time: None,
        }
    }
}

fn copy_dir(source: &Path, target: &Path) -> Result<()> {
    fs::create_dir_all(target)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let destination = target.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &destination)?;
        } else {
            fs::copy(entry.path(), destination)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::{CommandNode, FlowNode, NodeRunStatus};
    use serde_json::json;

    #[test]
    fn test_input_type_resolution() {
        assert_eq!(InputType::Int.coerce(&json!("1")).unwrap(), json!(1));
        assert_eq!(InputType::Float.coerce(&json!("0.5")).unwrap(), json!(0.5));
        assert_eq!(InputType::Bool.coerce(&json!("TRUE")).unwrap(), json!(true));
        assert_eq!(InputType::List.coerce(&json!("[1,2]")).unwrap(), json!([1, 2]));
        assert_eq!(InputType::String.coerce(&json!(7)).unwrap(), json!("7"));
        assert!(InputType::Int.coerce(&json!("one")).is_err());
        assert!(InputType::Int.coerce(&json!(1.5)).is_err());
        assert!(InputType::Object.coerce(&json!("[1]")).is_err());
    }

    #[test]
    fn test_input_default_is_resolved() {
        let input = ExperimentInput::new("count", InputType::Int, json!("1")).unwrap();
        assert_eq!(input.default, json!(1));
        assert!(ExperimentInput::new("count", InputType::Int, json!("x")).is_err());
    }

    #[test]
    fn test_status_display_and_activity() {
        assert_eq!(ExperimentStatus::InProgress.to_string(), "InProgress");
        assert!(ExperimentStatus::Queuing.is_active());
        assert!(!ExperimentStatus::Terminated.is_active());
        assert_eq!(Experiment::new("e").status(), ExperimentStatus::NotStarted);
    }

    #[test]
    fn test_upsert_node_run_appends_then_replaces() {
        let mut exp = Experiment::new("e");
        let mut run = NodeRun::new("e", "main");
        exp.upsert_node_run(run.clone());
        run.start();
        exp.upsert_node_run(run.clone());
        assert_eq!(exp.runs_of("main").len(), 1);
        assert_eq!(exp.runs_of("main")[0].status(), NodeRunStatus::Running);

        exp.upsert_node_run(NodeRun::new("e", "main"));
        assert_eq!(exp.runs_of("main").len(), 2);
        assert_eq!(exp.unfinished_runs_mut().count(), 2);
    }

    #[test]
    fn test_from_template_snapshots_sources() {
        let src = tempfile::tempdir().unwrap();
        let flow_dir = src.path().join("flow");
        fs::create_dir_all(flow_dir.join("nested")).unwrap();
        fs::write(flow_dir.join("flow.json"), "{}").unwrap();
        fs::write(flow_dir.join("nested").join("tool.py"), "").unwrap();
        let out = tempfile::tempdir().unwrap();

        let template = ExperimentTemplate {
            name: "basic".to_string(),
            description: None,
            nodes: vec![
                FlowNode::new("main", &flow_dir).into(),
                CommandNode::new("echo", "echo hi").into(),
            ],
            data: vec![],
            inputs: vec![],
        };
        let exp = Experiment::from_template(template, out.path()).unwrap();
        let snapshots = out.path().join("basic").join("snapshots");

        assert_eq!(exp.output_dir(), Some(out.path().join("basic").as_path()));
        assert_eq!(exp.node("main").unwrap().source_dir(), Some(snapshots.join("main").as_path()));
        assert!(snapshots.join("main").join("nested").join("tool.py").exists());
        assert!(snapshots.join("echo").is_dir());
        assert_eq!(fs::read_dir(snapshots.join("echo")).unwrap().count(), 0);

        // later changes to the source do not leak into the snapshot
        fs::write(flow_dir.join("flow.json"), "{\"changed\":true}").unwrap();
        assert_eq!(fs::read_to_string(snapshots.join("main").join("flow.json")).unwrap(), "{}");
    }

    #[test]
    fn test_from_template_rejects_missing_source() {
        let out = tempfile::tempdir().unwrap();
        let template = ExperimentTemplate {
            name: "broken".to_string(),
            description: None,
            nodes: vec![FlowNode::new("main", out.path().join("nope")).into()],
            data: vec![],
            inputs: vec![],
        };
        let err = Experiment::from_template(template, out.path()).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Validation);
    }
}
