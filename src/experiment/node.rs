//! Experiment nodes: flow runs and command runs.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::reference::{references_in, Reference};
use crate::Result;

/// Guard deciding whether a node runs.
///
/// The node runs when the value referenced by `when` equals `is`. Node
/// statuses compare as their names (`"Completed"`, `"Failed"`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivateCondition {
    /// Reference to evaluate, e.g. `${main.status}`
    pub when: String,
    /// Value that activates the node
    pub is: Value,
}

impl ActivateCondition {
    /// Run when `when` resolves to `is`.
    #[must_use]
    pub fn new(when: impl Into<String>, is: Value) -> Self {
        Self {
            when: when.into(),
            is,
        }
    }

    /// Parsed `when` reference.
    ///
    /// # Errors
    /// Returns [`crate::Error::Validation`] if `when` is not a reference
    pub fn reference(&self) -> Result<Reference> {
        Reference::parse(&self.when)?.ok_or_else(|| {
            crate::Error::Validation(format!(
                "activate.when '{}' must be a ${{...}} reference",
                self.when
            ))
        })
    }
}

/// One line-oriented flow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowNode {
    name: String,
    path: PathBuf,
    #[serde(default)]
    inputs: BTreeMap<String, Value>,
    #[serde(default)]
    environment_variables: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    activate: Option<ActivateCondition>,
    #[serde(default)]
    evaluation: bool,
}

impl FlowNode {
    /// Flow node running the flow at `path`.
    #[must_use]
    pub fn new(name: impl Into<String>, path: impl AsRef<Path>) -> Self {
        Self {
            name: name.into(),
            path: path.as_ref().to_path_buf(),
            inputs: BTreeMap::new(),
            environment_variables: BTreeMap::new(),
            activate: None,
            evaluation: false,
        }
    }

    /// Bind a flow input to a literal or `${...}` reference.
    #[must_use]
    pub fn input(mut self, name: impl Into<String>, binding: Value) -> Self {
        self.inputs.insert(name.into(), binding);
        self
    }

    /// Set an environment variable for the workers.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment_variables.insert(key.into(), value.into());
        self
    }

    /// Guard the node.
    #[must_use]
    pub fn activate(mut self, condition: ActivateCondition) -> Self {
        self.activate = Some(condition);
        self
    }

    /// Mark as an evaluation step whose outputs are aggregated into metrics.
    #[must_use]
    pub const fn evaluation(mut self, evaluation: bool) -> Self {
        self.evaluation = evaluation;
        self
    }

    /// Get the flow path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this is an evaluation step.
    #[must_use]
    pub const fn is_evaluation(&self) -> bool {
        self.evaluation
    }
}

/// One shell command run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandNode {
    name: String,
    command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    code: Option<PathBuf>,
    #[serde(default)]
    inputs: BTreeMap<String, Value>,
    #[serde(default)]
    outputs: BTreeSet<String>,
    #[serde(default)]
    environment_variables: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    activate: Option<ActivateCondition>,
}

impl CommandNode {
    /// Command node running `command` through the shell.
    #[must_use]
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            code: None,
            inputs: BTreeMap::new(),
            outputs: BTreeSet::new(),
            environment_variables: BTreeMap::new(),
            activate: None,
        }
    }

    /// Directory snapshotted as the command's working directory.
    #[must_use]
    pub fn code(mut self, code: impl AsRef<Path>) -> Self {
        self.code = Some(code.as_ref().to_path_buf());
        self
    }

    /// Bind a node input, usable as `${inputs.<name>}` in the command.
    #[must_use]
    pub fn input(mut self, name: impl Into<String>, binding: Value) -> Self {
        self.inputs.insert(name.into(), binding);
        self
    }

    /// Declare a named output, usable as `${outputs.<name>}` in the command
    /// and as `${<node>.outputs.<name>}` downstream.
    #[must_use]
    pub fn output(mut self, name: impl Into<String>) -> Self {
        self.outputs.insert(name.into());
        self
    }

    /// Set an environment variable for the command.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment_variables.insert(key.into(), value.into());
        self
    }

    /// Guard the node.
    #[must_use]
    pub fn activate(mut self, condition: ActivateCondition) -> Self {
        self.activate = Some(condition);
        self
    }

    /// Get the command template.
    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Get the code directory.
    #[must_use]
    pub fn code_dir(&self) -> Option<&Path> {
        self.code.as_deref()
    }

    /// Get the declared output names.
    #[must_use]
    pub const fn outputs(&self) -> &BTreeSet<String> {
        &self.outputs
    }
}

/// A step of the experiment DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExperimentNode {
    /// Runs a flow over lines in the worker pool
    Flow(FlowNode),
    /// Runs a shell command
    Command(CommandNode),
}

impl ExperimentNode {
    /// Node name, unique within its experiment.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Flow(node) => &node.name,
            Self::Command(node) => &node.name,
        }
    }

    /// Input bindings.
    #[must_use]
    pub const fn inputs(&self) -> &BTreeMap<String, Value> {
        match self {
            Self::Flow(node) => &node.inputs,
            Self::Command(node) => &node.inputs,
        }
    }

    /// Environment variables.
    #[must_use]
    pub const fn environment_variables(&self) -> &BTreeMap<String, String> {
        match self {
            Self::Flow(node) => &node.environment_variables,
            Self::Command(node) => &node.environment_variables,
        }
    }

    /// Activate guard, if any.
    #[must_use]
    pub const fn activate_condition(&self) -> Option<&ActivateCondition> {
        match self {
            Self::Flow(node) => node.activate.as_ref(),
            Self::Command(node) => node.activate.as_ref(),
        }
    }

    /// Source directory snapshotted when the experiment is materialized.
    #[must_use]
    pub fn source_dir(&self) -> Option<&Path> {
        match self {
            Self::Flow(node) => Some(&node.path),
            Self::Command(node) => node.code.as_deref(),
        }
    }

    /// Point the node at its snapshot directory.
    pub fn set_source_dir(&mut self, dir: PathBuf) {
        match self {
            Self::Flow(node) => node.path = dir,
            Self::Command(node) => node.code = Some(dir),
        }
    }

    /// Whether this is a flow node.
    #[must_use]
    pub const fn is_flow(&self) -> bool {
        matches!(self, Self::Flow(_))
    }

    /// Every reference the node makes, from inputs, the activate guard and
    /// (for commands) the command string.
    ///
    /// # Errors
    /// Returns [`crate::Error::Validation`] for malformed references
    pub fn references(&self) -> Result<Vec<Reference>> {
        let mut found = Vec::new();
        for binding in self.inputs().values() {
            if let Some(reference) = Reference::from_value(binding)? {
                found.push(reference);
            }
        }
        if let Some(condition) = self.activate_condition() {
            found.push(condition.reference()?);
        }
        if let Self::Command(node) = self {
            found.extend(references_in(&node.command)?);
        }
        Ok(found)
    }

    /// Names of the nodes this node depends on.
    ///
    /// # Errors
    /// Returns [`crate::Error::Validation`] for malformed references
    pub fn dependencies(&self) -> Result<BTreeSet<String>> {
        Ok(self
            .references()?
            .iter()
            .filter_map(Reference::node)
            .map(ToString::to_string)
            .collect())
    }
}

impl From<FlowNode> for ExperimentNode {
    fn from(node: FlowNode) -> Self {
        Self::Flow(node)
    }
}

impl From<CommandNode> for ExperimentNode {
    fn from(node: CommandNode) -> Self {
        Self::Command(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dependencies_collect_every_source() {
        let node: ExperimentNode = CommandNode::new("report", "python r.py ${eval.outputs} ${outputs.html}")
            .input("answers", json!("${main.outputs.answer}"))
            .input("limit", json!(5))
            .activate(ActivateCondition::new("${gate.status}", json!("Completed")))
            .output("html")
            .into();
        let deps = node.dependencies().unwrap();
        assert_eq!(
            deps.into_iter().collect::<Vec<_>>(),
            vec!["eval".to_string(), "gate".to_string(), "main".to_string()]
        );
    }

    #[test]
    fn test_activate_requires_reference() {
        let condition = ActivateCondition::new("always", json!(true));
        assert!(condition.reference().is_err());
    }

    #[test]
    fn test_node_serde_is_tagged() {
        let node: ExperimentNode = FlowNode::new("main", "flows/main")
            .input("q", json!("${data.d.question}"))
            .evaluation(true)
            .into();
        let text = serde_json::to_value(&node).unwrap();
        assert_eq!(text["type"], "flow");
        let back: ExperimentNode = serde_json::from_value(text).unwrap();
        assert_eq!(back, node);
    }

    #[test]
    fn test_snapshot_redirect() {
        let mut node: ExperimentNode = CommandNode::new("c", "ls").into();
        assert!(node.source_dir().is_none());
        node.set_source_dir(PathBuf::from("/snap/c"));
        assert_eq!(node.source_dir(), Some(Path::new("/snap/c")));
    }
}
