//! Experiment Controller - lifecycle state machine over the DAG Scheduler
//!
//! ```text
//! NotStarted ─start─► Queuing ─► InProgress ─► Completed | Failed | Canceled ─► Terminated
//!                        └────────── stop ──────────────────────────────────────────┘
//! ```
//!
//! `start` and `stop` are triggers: the run itself happens on a background
//! task that folds scheduler events into the stored experiment, so `get`
//! and `list` always see the latest node runs.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::experiment::{
    Experiment, ExperimentStatus, ExperimentStore, MetricRecord, NodeRunStatus,
};
use crate::graph::ExperimentGraph;
use crate::scheduler::{DagScheduler, SchedulerEvent};
use crate::{Error, Result};

/// Default time `stop` waits for in-flight nodes before aborting the run.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Controller configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    output_root: PathBuf,
    persist_dir: Option<PathBuf>,
    stop_grace: Duration,
}

impl ControllerConfig {
    /// Create a builder.
    #[must_use]
    pub fn builder() -> ControllerConfigBuilder {
        ControllerConfigBuilder::default()
    }

    /// Get the directory experiment output directories are allocated under.
    #[must_use]
    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    /// Get the persist directory, if experiments are written through.
    #[must_use]
    pub fn persist_dir(&self) -> Option<&Path> {
        self.persist_dir.as_deref()
    }

    /// Get the stop grace period.
    #[must_use]
    pub const fn stop_grace(&self) -> Duration {
        self.stop_grace
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            output_root: std::env::temp_dir().join("flowrun"),
            persist_dir: None,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

/// Builder for `ControllerConfig`.
#[derive(Debug, Default)]
pub struct ControllerConfigBuilder {
    config: ControllerConfig,
}

impl ControllerConfigBuilder {
    /// Set the output root.
    #[must_use]
    pub fn output_root(mut self, dir: impl AsRef<Path>) -> Self {
        self.config.output_root = dir.as_ref().to_path_buf();
        self
    }

    /// Persist experiments as JSON files under `dir`.
    #[must_use]
    pub fn persist_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.config.persist_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Set the stop grace period.
    #[must_use]
    pub const fn stop_grace(mut self, grace: Duration) -> Self {
        self.config.stop_grace = grace;
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> ControllerConfig {
        self.config
    }
}

struct ActiveRun {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    config: ControllerConfig,
    store: RwLock<ExperimentStore>,
    scheduler: Arc<DagScheduler>,
    active: DashMap<String, ActiveRun>,
}

/// Owns experiments and their runs.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ExperimentController {
    inner: Arc<Inner>,
}

impl ExperimentController {
    /// Create a controller running experiments through `scheduler`.
    ///
    /// With a persist directory, stored experiments are loaded; any left
    /// `Queuing` or `InProgress` by a previous process are terminated as
    /// `Canceled`.
    ///
    /// # Errors
    /// Returns an IO or JSON error if the persist directory cannot be loaded
    pub fn new(config: ControllerConfig, scheduler: DagScheduler) -> Result<Self> {
        let mut store = match config.persist_dir() {
            Some(dir) => ExperimentStore::with_persist_dir(dir)?,
            None => ExperimentStore::new(),
        };
        let interrupted: Vec<String> = store
            .list()
            .iter()
            .filter(|e| e.status().is_active())
            .map(|e| e.name().to_string())
            .collect();
        for name in interrupted {
            tracing::warn!(experiment = %name, "terminating run interrupted by a previous process");
            store.update(&name, |experiment| {
                cancel_unfinished(experiment, "interrupted");
                experiment.mark_terminated(ExperimentStatus::Canceled);
            })?;
        }

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                store: RwLock::new(store),
                scheduler: Arc::new(scheduler),
                active: DashMap::new(),
            }),
        })
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }

    /// Get the scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &DagScheduler {
        &self.inner.scheduler
    }

    /// Store a new experiment or replace the definition of an existing one.
    ///
    /// Run history and status carry over from the stored version.
    ///
    /// # Errors
    /// Returns [`Error::Validation`] for an inconsistent definition, or
    /// [`Error::InvalidState`] if the experiment is running
    pub async fn create_or_update(&self, mut experiment: Experiment) -> Result<Experiment> {
        ExperimentGraph::build(&experiment)?;
        let mut store = self.inner.store.write().await;
        if let Some(previous) = store.get(experiment.name()) {
            if previous.status().is_active() {
                return Err(invalid_state(previous));
            }
            experiment.inherit_history(previous);
        }
        if experiment.output_dir().is_none() {
            experiment.set_output_dir(self.inner.config.output_root.join(experiment.name()));
        }
        store.upsert(experiment.clone())?;
        tracing::info!(experiment = %experiment.name(), nodes = experiment.nodes().len(), "experiment saved");
        Ok(experiment)
    }

    /// Snapshot of an experiment.
    ///
    /// # Errors
    /// Returns [`Error::NotFound`] if no experiment has that name
    pub async fn get(&self, name: &str) -> Result<Experiment> {
        self.inner.store.read().await.require(name).cloned()
    }

    /// Snapshots of every experiment, sorted by name.
    pub async fn list(&self) -> Vec<Experiment> {
        self.inner
            .store
            .read()
            .await
            .list()
            .into_iter()
            .cloned()
            .collect()
    }

    /// Metrics produced by an evaluation node run.
    pub async fn get_metrics(&self, run_name: &str) -> Vec<MetricRecord> {
        self.inner.store.read().await.get_metrics_for_run(run_name)
    }

    /// Whether a run of the experiment is in flight.
    #[must_use]
    pub fn is_running(&self, name: &str) -> bool {
        self.inner.active.contains_key(name)
    }

    /// Start a run and return immediately with the `Queuing` snapshot.
    ///
    /// # Errors
    /// Returns [`Error::NotFound`] for an unknown experiment,
    /// [`Error::InvalidState`] (`Experiment <name> is <status>`) if it is
    /// already `Queuing` or `InProgress`, or [`Error::Validation`] if its
    /// graph is invalid
    pub async fn start(&self, name: &str) -> Result<Experiment> {
        let mut store = self.inner.store.write().await;
        let current = store.require(name)?;
        if current.status().is_active() || self.inner.active.contains_key(name) {
            return Err(invalid_state(current));
        }
        ExperimentGraph::build(current)?;

        let snapshot = store.update(name, |experiment| {
            experiment.mark_started();
            experiment.clone()
        })?;
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(drive(
            Arc::clone(&self.inner),
            snapshot.clone(),
            cancel.clone(),
        ));
        // inserted under the store lock so the run cannot finish first
        self.inner
            .active
            .insert(name.to_string(), ActiveRun { cancel, handle });
        drop(store);

        tracing::info!(experiment = %name, "experiment queued");
        Ok(snapshot)
    }

    /// Cancel the in-flight run, if any, and wait for it to terminate.
    ///
    /// In-flight nodes end `Canceled`. If the run does not wind down within
    /// the stop grace period it is aborted and terminated in place. Stopping
    /// an experiment that is not running changes nothing.
    ///
    /// # Errors
    /// Returns [`Error::NotFound`] for an unknown experiment
    pub async fn stop(&self, name: &str) -> Result<Experiment> {
        let Some((_, mut run)) = self.inner.active.remove(name) else {
            return self.get(name).await;
        };
        tracing::info!(experiment = %name, "stop requested");
        run.cancel.cancel();

        if tokio::time::timeout(self.inner.config.stop_grace, &mut run.handle)
            .await
            .is_err()
        {
            tracing::warn!(experiment = %name, grace = ?self.inner.config.stop_grace, "run did not stop in time, aborting");
            run.handle.abort();
            let mut store = self.inner.store.write().await;
            store.update(name, |experiment| {
                if experiment.status() != ExperimentStatus::Terminated {
                    cancel_unfinished(experiment, "stopped");
                    experiment.mark_terminated(ExperimentStatus::Canceled);
                }
            })?;
        }
        self.get(name).await
    }

    /// Wait until the experiment has no run in flight.
    ///
    /// # Errors
    /// Returns [`Error::NotFound`] for an unknown experiment
    pub async fn wait(&self, name: &str) -> Result<Experiment> {
        loop {
            let snapshot = self.get(name).await?;
            if !snapshot.status().is_active() && !self.is_running(name) {
                return Ok(snapshot);
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// Stop every running experiment.
    pub async fn stop_all(&self) {
        let names: Vec<String> = self
            .inner
            .active
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for name in names {
            if let Err(e) = self.stop(&name).await {
                tracing::warn!(experiment = %name, error = %e, "failed to stop experiment");
            }
        }
    }
}

impl std::fmt::Debug for ExperimentController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExperimentController")
            .field("config", &self.inner.config)
            .field("active", &self.inner.active.len())
            .finish_non_exhaustive()
    }
}

fn invalid_state(experiment: &Experiment) -> Error {
    Error::InvalidState {
        name: experiment.name().to_string(),
        status: experiment.status().to_string(),
    }
}

fn cancel_unfinished(experiment: &mut Experiment, reason: &str) {
    for run in experiment.unfinished_runs_mut() {
        run.set_error(reason);
        run.complete(NodeRunStatus::Canceled);
    }
}

/// Background task of one run: scheduler plus event fold, then termination.
async fn drive(inner: Arc<Inner>, experiment: Experiment, cancel: CancellationToken) {
    let name = experiment.name().to_string();
    let output_dir = experiment
        .output_dir()
        .map_or_else(|| inner.config.output_root.join(&name), Path::to_path_buf);

    if let Err(e) = inner
        .store
        .write()
        .await
        .update(&name, |e| e.set_status(ExperimentStatus::InProgress))
    {
        tracing::warn!(experiment = %name, error = %e, "failed to persist status");
    }
    tracing::info!(experiment = %name, output_dir = %output_dir.display(), "experiment in progress");

    let (events, mut received) = mpsc::unbounded_channel();
    let run = {
        let scheduler = Arc::clone(&inner.scheduler);
        let cancel = cancel.clone();
        async move { scheduler.run(&experiment, &output_dir, &events, &cancel).await }
    };
    let fold = async {
        while let Some(event) = received.recv().await {
            apply_event(&inner, &name, event).await;
        }
    };
    let (report, ()) = tokio::join!(run, fold);

    let outcome = match report {
        Ok(report) => report.status(),
        Err(e) => {
            tracing::error!(experiment = %name, error = %e, "experiment run failed");
            ExperimentStatus::Failed
        }
    };

    let mut store = inner.store.write().await;
    if let Err(e) = store.update(&name, |experiment| {
        cancel_unfinished(experiment, "run ended before the node finished");
        experiment.mark_terminated(outcome);
    }) {
        tracing::warn!(experiment = %name, error = %e, "failed to persist final status");
    }
    inner.active.remove(&name);
    drop(store);
    tracing::info!(experiment = %name, outcome = %outcome, "experiment terminated");
}

async fn apply_event(inner: &Inner, name: &str, event: SchedulerEvent) {
    let mut store = inner.store.write().await;
    let result = match event {
        SchedulerEvent::NodeRunStarted(run) => {
            store.update(name, |experiment| experiment.upsert_node_run(run))
        }
        SchedulerEvent::NodeRunFinished { run, metrics } => {
            for metric in metrics {
                store.add_metric(metric);
            }
            store.update(name, |experiment| experiment.upsert_node_run(run))
        }
    };
    if let Err(e) = result {
        tracing::warn!(experiment = %name, error = %e, "failed to persist node run");
    }
}
