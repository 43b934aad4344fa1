//! Experiment dependency graph
//!
//! Built once per experiment from the references every node makes. All
//! reference and cycle errors surface here, before anything runs.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::experiment::{Experiment, ExperimentNode, Reference, RESERVED_NAMES};
use crate::{Error, Result};

/// Validated DAG of an experiment's nodes.
///
/// Indexes follow declaration order. [`order`](Self::order) is a
/// topological order that keeps declaration order among independent nodes.
#[derive(Debug, Clone)]
pub struct ExperimentGraph {
    names: Vec<String>,
    index: HashMap<String, usize>,
    dependencies: Vec<BTreeSet<usize>>,
    dependents: Vec<BTreeSet<usize>>,
    order: Vec<usize>,
}

impl ExperimentGraph {
    /// Validate `experiment` and build its graph.
    ///
    /// # Errors
    /// Returns [`Error::Validation`] for duplicate or reserved names, a
    /// reference to unknown data, inputs or nodes, a self reference, a
    /// misplaced or undeclared `${outputs.<name>}`, or a cycle
    pub fn build(experiment: &Experiment) -> Result<Self> {
        let nodes = experiment.nodes();
        let mut index = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            let name = node.name();
            if name.trim().is_empty() || name.contains('.') {
                return Err(Error::Validation(format!("invalid node name '{name}'")));
            }
            if RESERVED_NAMES.contains(&name) {
                return Err(Error::Validation(format!(
                    "node name '{name}' is reserved"
                )));
            }
            if index.insert(name.to_string(), i).is_some() {
                return Err(Error::Validation(format!("duplicate node name '{name}'")));
            }
        }

        let data: HashSet<&str> = unique(experiment.data().iter().map(|d| d.name.as_str()), "data")?;
        let inputs: HashSet<&str> =
            unique(experiment.inputs().iter().map(|i| i.name.as_str()), "input")?;

        let mut dependencies = vec![BTreeSet::new(); nodes.len()];
        for (i, node) in nodes.iter().enumerate() {
            let check = Check {
                node,
                nodes,
                index: &index,
                data: &data,
                inputs: &inputs,
            };
            for reference in binding_references(node)? {
                check.reference(&reference, false)?;
            }
            if let ExperimentNode::Command(command) = node {
                for reference in crate::experiment::references_in(command.command())? {
                    check.reference(&reference, true)?;
                }
            }
            for dependency in node.dependencies()? {
                dependencies[i].insert(index[&dependency]);
            }
        }

        let mut dependents = vec![BTreeSet::new(); nodes.len()];
        for (i, deps) in dependencies.iter().enumerate() {
            for &d in deps {
                dependents[d].insert(i);
            }
        }

        let order = topological_order(&dependencies, &dependents).map_err(|stuck| {
            let stuck: Vec<&str> = stuck.iter().map(|&i| nodes[i].name()).collect();
            Error::Validation(format!(
                "experiment '{}' has a dependency cycle among nodes {stuck:?}",
                experiment.name()
            ))
        })?;

        Ok(Self {
            names: nodes.iter().map(|n| n.name().to_string()).collect(),
            index,
            dependencies,
            dependents,
            order,
        })
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether the experiment has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Node indexes in execution order.
    #[must_use]
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Node names in execution order.
    #[must_use]
    pub fn ordered_names(&self) -> Vec<&str> {
        self.order.iter().map(|&i| self.names[i].as_str()).collect()
    }

    /// Index of a node by name.
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Name of the node at `index`.
    #[must_use]
    pub fn name_of(&self, index: usize) -> &str {
        &self.names[index]
    }

    /// Nodes that `index` references.
    #[must_use]
    pub fn dependencies(&self, index: usize) -> &BTreeSet<usize> {
        &self.dependencies[index]
    }

    /// Nodes that reference `index`.
    #[must_use]
    pub fn dependents(&self, index: usize) -> &BTreeSet<usize> {
        &self.dependents[index]
    }
}

fn unique<'a>(names: impl Iterator<Item = &'a str>, what: &str) -> Result<HashSet<&'a str>> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(Error::Validation(format!("duplicate {what} name '{name}'")));
        }
    }
    Ok(seen)
}

fn binding_references(node: &ExperimentNode) -> Result<Vec<Reference>> {
    let mut found = Vec::new();
    for binding in node.inputs().values() {
        if let Some(reference) = Reference::from_value(binding)? {
            found.push(reference);
        }
    }
    if let Some(condition) = node.activate_condition() {
        found.push(condition.reference()?);
    }
    Ok(found)
}

struct Check<'a> {
    node: &'a ExperimentNode,
    nodes: &'a [ExperimentNode],
    index: &'a HashMap<String, usize>,
    data: &'a HashSet<&'a str>,
    inputs: &'a HashSet<&'a str>,
}

impl Check<'_> {
    fn reference(&self, reference: &Reference, in_command: bool) -> Result<()> {
        let owner = self.node.name();
        let fail = |why: &str| Err(Error::Validation(format!("node '{owner}': {reference} {why}")));
        match reference {
            Reference::Data { name, .. } if !self.data.contains(name.as_str()) => {
                fail("refers to unknown data")
            }
            Reference::Input { name }
                if !self.inputs.contains(name.as_str())
                    && !(in_command && self.node.inputs().contains_key(name)) =>
            {
                fail("refers to an unknown input")
            }
            Reference::RunOutput { name } => match self.node {
                ExperimentNode::Command(command) if in_command => {
                    if command.outputs().contains(name) {
                        Ok(())
                    } else {
                        fail("is not a declared output")
                    }
                }
                _ => fail("is only allowed in a command string"),
            },
            Reference::NodeOutput { node, .. } | Reference::NodeStatus { node }
                if node == owner =>
            {
                fail("refers to the node itself")
            }
            Reference::NodeOutput { node, column } => {
                let Some(&target) = self.index.get(node) else {
                    return fail("refers to an unknown node");
                };
                match (&self.nodes[target], column) {
                    (ExperimentNode::Command(upstream), Some(column))
                        if !upstream.outputs().contains(column)
                            && column != "output_path"
                            && column != "exit_code" =>
                    {
                        fail("is not an output of that command")
                    }
                    _ => Ok(()),
                }
            }
            Reference::NodeStatus { node } if !self.index.contains_key(node) => {
                fail("refers to an unknown node")
            }
            _ => Ok(()),
        }
    }
}

/// Kahn's algorithm; among ready nodes the earliest declared goes first.
/// On a cycle, returns the nodes that never became ready.
fn topological_order(
    dependencies: &[BTreeSet<usize>],
    dependents: &[BTreeSet<usize>],
) -> std::result::Result<Vec<usize>, Vec<usize>> {
    let mut in_degree: Vec<usize> = dependencies.iter().map(BTreeSet::len).collect();
    let mut ready: BTreeSet<usize> = (0..in_degree.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(in_degree.len());

    while let Some(node) = ready.pop_first() {
        order.push(node);
        for &dependent in &dependents[node] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() == in_degree.len() {
        Ok(order)
    } else {
        Err((0..in_degree.len()).filter(|&i| in_degree[i] > 0).collect())
    }
}
