//! Experiment Store - experiments, node runs and metrics
//!
//! In memory by default; with a persist directory every update is written
//! through as `<dir>/<name>.json` and existing files are loaded on open.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::{Experiment, MetricRecord};
use crate::{Error, Result};

/// Store for experiments and the metrics of their node runs.
///
/// ## Design
///
/// Experiments are keyed by name for O(1) lookups. Metrics live in a flat
/// vector filtered by run name, since evaluation runs yield only a few each.
#[derive(Debug, Default)]
pub struct ExperimentStore {
    experiments: HashMap<String, Experiment>,
    metrics: Vec<MetricRecord>,
    persist_dir: Option<PathBuf>,
}

impl ExperimentStore {
    /// Create a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a store persisted under `dir`, loading every `*.json` file.
    ///
    /// Metrics are rebuilt from the node runs of the loaded experiments.
    ///
    /// # Errors
    /// Returns an IO or JSON error if the directory or a file cannot be read
    pub fn with_persist_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut store = Self {
            persist_dir: Some(dir.clone()),
            ..Self::default()
        };
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let experiment: Experiment = serde_json::from_slice(&fs::read(&path)?)?;
            for run in experiment.node_runs().values().flatten() {
                store.metrics.extend(MetricRecord::from_run(run));
            }
            store
                .experiments
                .insert(experiment.name().to_string(), experiment);
        }
        tracing::debug!(dir = %dir.display(), experiments = store.experiments.len(), "loaded experiment store");
        Ok(store)
    }

    /// Get the persist directory, if any.
    #[must_use]
    pub fn persist_dir(&self) -> Option<&Path> {
        self.persist_dir.as_deref()
    }

    /// Check if the store is empty (no experiments or metrics).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.experiments.is_empty() && self.metrics.is_empty()
    }

    /// Get the number of experiments in the store.
    #[must_use]
    pub fn experiment_count(&self) -> usize {
        self.experiments.len()
    }

    /// Get the number of metrics in the store.
    #[must_use]
    pub fn metric_count(&self) -> usize {
        self.metrics.len()
    }

    /// Insert or replace an experiment, writing it through when persisted.
    ///
    /// # Errors
    /// Returns an IO or JSON error if the write-through fails
    pub fn upsert(&mut self, experiment: Experiment) -> Result<()> {
        self.persist(&experiment)?;
        self.experiments
            .insert(experiment.name().to_string(), experiment);
        Ok(())
    }

    /// Mutate an experiment in place, then write it through.
    ///
    /// # Errors
    /// Returns [`Error::NotFound`] if no experiment has that name, or an IO
    /// or JSON error if the write-through fails
    pub fn update<T>(&mut self, name: &str, f: impl FnOnce(&mut Experiment) -> T) -> Result<T> {
        let experiment = self
            .experiments
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("experiment '{name}'")))?;
        let out = f(experiment);
        let experiment = &self.experiments[name];
        self.persist(experiment)?;
        Ok(out)
    }

    fn persist(&self, experiment: &Experiment) -> Result<()> {
        let Some(dir) = &self.persist_dir else {
            return Ok(());
        };
        let path = dir.join(format!("{}.json", experiment.name()));
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(experiment)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Get an experiment by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Experiment> {
        self.experiments.get(name)
    }

    /// Get an experiment by name or fail with [`Error::NotFound`].
    ///
    /// # Errors
    /// Returns [`Error::NotFound`] if no experiment has that name
    pub fn require(&self, name: &str) -> Result<&Experiment> {
        self.get(name)
            .ok_or_else(|| Error::NotFound(format!("experiment '{name}'")))
    }

    /// All experiments, sorted by name.
    #[must_use]
    pub fn list(&self) -> Vec<&Experiment> {
        let mut experiments: Vec<&Experiment> = self.experiments.values().collect();
        experiments.sort_by(|a, b| a.name().cmp(b.name()));
        experiments
    }

    /// Add a metric to the store.
    pub fn add_metric(&mut self, metric: MetricRecord) {
        self.metrics.push(metric);
    }

    /// Get the metrics of a node run, ordered by key.
    ///
    /// ## Example
    ///
    /// ```rust
    /// use std::collections::BTreeMap;
    /// use flowrun::experiment::{ExperimentStore, MetricRecord, NodeRun, NodeRunStatus};
    ///
    /// let mut run = NodeRun::new("exp", "eval");
    /// run.set_metrics(BTreeMap::from([("recall".to_string(), 0.5), ("accuracy".to_string(), 0.75)]));
    /// run.complete(NodeRunStatus::Completed);
    ///
    /// let mut store = ExperimentStore::new();
    /// for metric in MetricRecord::from_run(&run) {
    ///     store.add_metric(metric);
    /// }
    ///
    /// let metrics = store.get_metrics_for_run(run.name());
    /// assert_eq!(metrics.len(), 2);
    /// assert_eq!(metrics[0].key(), "accuracy");
    /// ```
    #[must_use]
    pub fn get_metrics_for_run(&self, run_name: &str) -> Vec<MetricRecord> {
        let mut metrics: Vec<MetricRecord> = self
            .metrics
            .iter()
            .filter(|m| m.run_name() == run_name)
            .cloned()
            .collect();
        metrics.sort_by(|a, b| a.key().cmp(b.key()));
        metrics
    }
}
