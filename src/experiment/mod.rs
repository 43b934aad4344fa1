//! Experiment data model
//!
//! An experiment is a DAG of flow and command nodes plus the data and
//! inputs they read. Every start appends one node run per dispatched node.
//!
//! ## Schema Overview
//!
//! ```text
//! Experiment (1) ──< ExperimentNode (N)   [Flow | Command]
//!      │
//!      ├──< ExperimentData / ExperimentInput (N)
//!      └──< NodeRun (N per node)  ──< MetricRecord (N) [evaluation nodes]
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use flowrun::experiment::{CommandNode, Experiment, ExperimentStatus, FlowNode};
//! use serde_json::json;
//!
//! let experiment = Experiment::builder("qa-eval")
//!     .node(FlowNode::new("main", "flows/qa").input("question", json!("${data.qa.question}")))
//!     .node(CommandNode::new("report", "cat ${main.outputs}"))
//!     .build();
//!
//! assert_eq!(experiment.status(), ExperimentStatus::NotStarted);
//! assert!(experiment.node_runs().is_empty());
//! ```

mod experiment_record;
mod metric_record;
mod node;
mod reference;
mod run_record;
mod store;

pub use experiment_record::{
    Experiment, ExperimentBuilder, ExperimentData, ExperimentInput, ExperimentStatus,
    ExperimentTemplate, InputType,
};
pub use metric_record::MetricRecord;
pub use node::{ActivateCondition, CommandNode, ExperimentNode, FlowNode};
pub use reference::{interpolate, references_in, Reference, RESERVED_NAMES};
pub use run_record::{NodeRun, NodeRunBuilder, NodeRunStatus};
pub use store::ExperimentStore;
