//! Metrics of evaluation node runs.
//!
//! An evaluation node reduces its lines to named numbers (the mean of every
//! numeric output field). They are stored on the [`NodeRun`] itself and
//! flattened into one [`MetricRecord`] per name, so they stay retrievable by
//! run name after the experiment terminates or the store is reloaded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::NodeRun;

/// One named metric of a finished node run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricRecord {
    run_name: String,
    experiment: String,
    node: String,
    key: String,
    value: f64,
    recorded_at: DateTime<Utc>,
}

impl MetricRecord {
    /// Flatten the metrics of `run`, ordered by key.
    ///
    /// Records are stamped with the run's end time, or now if it has not
    /// ended yet.
    #[must_use]
    pub fn from_run(run: &NodeRun) -> Vec<Self> {
        let recorded_at = run.ended_at().unwrap_or_else(Utc::now);
        run.metrics()
            .iter()
            .map(|(key, value)| Self {
                run_name: run.name().to_string(),
                experiment: run.experiment().to_string(),
                node: run.node().to_string(),
                key: key.clone(),
                value: *value,
                recorded_at,
            })
            .collect()
    }

    /// Name of the node run that produced the metric.
    #[must_use]
    pub fn run_name(&self) -> &str {
        &self.run_name
    }

    /// Experiment of that run.
    #[must_use]
    pub fn experiment(&self) -> &str {
        &self.experiment
    }

    /// Evaluation node of that run.
    #[must_use]
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Metric name, e.g. `accuracy`.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Metric value.
    #[must_use]
    pub const fn value(&self) -> f64 {
        self.value
    }

    /// When the run finished.
    #[must_use]
    pub const fn recorded_at(&self) -> DateTime<Utc> {
        self.recorded_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::NodeRunStatus;
    use std::collections::BTreeMap;

    #[test]
    fn test_from_run_flattens_metrics() {
        let mut run = NodeRun::new("exp", "eval");
        run.start();
        run.set_metrics(BTreeMap::from([
            ("recall".to_string(), 0.5),
            ("accuracy".to_string(), 0.75),
        ]));
        run.complete(NodeRunStatus::Completed);

        let records = MetricRecord::from_run(&run);
        let keys: Vec<&str> = records.iter().map(MetricRecord::key).collect();
        assert_eq!(keys, vec!["accuracy", "recall"]);
        assert!(records.iter().all(|r| r.run_name() == run.name()));
        assert_eq!(records[0].experiment(), "exp");
        assert_eq!(records[0].node(), "eval");
        assert_eq!(Some(records[0].recorded_at()), run.ended_at());
    }

    #[test]
    fn test_run_without_metrics_yields_nothing() {
        assert!(MetricRecord::from_run(&NodeRun::new("exp", "main")).is_empty());
    }
}
