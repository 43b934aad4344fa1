//! Worker Pool - isolated execution of flow lines
//!
//! Toyota Way: Jidoka. A line that crashes or hangs stops its own worker,
//! never the batch and never the orchestrator.
//!
//! ## Architecture
//!
//! ```text
//!              bounded task queue                    result queue
//! producer ──► [LineTask; capacity] ──► slot 0 ─┐
//!                                  ├──► slot 1 ─┼──► [LineResult] ──► sort by line_number
//!                                  └──► slot N ─┘
//!                                         │
//!                                 Box<dyn Worker> (process or task)
//! ```
//!
//! Each slot supervises one worker at a time. A timeout or crash kills that
//! worker, records the line as failed, and the slot launches a replacement
//! before its next task.

mod executor;
mod launcher;
mod process;
mod protocol;

pub use executor::{LineContext, LineExecutor, LineRunner};
pub use launcher::{InProcessLauncher, Worker, WorkerLauncher};
pub use process::{ProcessLauncher, StartMethod, ENV_FLOW_PATH};
pub use protocol::{serve, WorkerRequest, WorkerResponse};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::ErrorKind;
use crate::trace::{Span, SpanContext};
use crate::Error;

/// Default number of worker slots.
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Default per-line execution budget.
pub const DEFAULT_LINE_TIMEOUT: Duration = Duration::from_secs(600);

/// Default task queue capacity.
pub const DEFAULT_TASK_QUEUE_CAPACITY: usize = 16;

/// Default time a worker gets to exit after a shutdown request.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Input record of one line.
pub type LineInputs = Map<String, Value>;

/// Pool configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    worker_count: usize,
    line_timeout: Duration,
    task_queue_capacity: usize,
    shutdown_grace: Duration,
}

impl PoolConfig {
    /// Create a configuration builder.
    #[must_use]
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::default()
    }

    /// Get the maximum number of concurrent workers.
    #[must_use]
    pub const fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Get the per-line timeout.
    #[must_use]
    pub const fn line_timeout(&self) -> Duration {
        self.line_timeout
    }

    /// Get the task queue capacity.
    #[must_use]
    pub const fn task_queue_capacity(&self) -> usize {
        self.task_queue_capacity
    }

    /// Get the shutdown grace period.
    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        self.shutdown_grace
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            line_timeout: DEFAULT_LINE_TIMEOUT,
            task_queue_capacity: DEFAULT_TASK_QUEUE_CAPACITY,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

/// Builder for [`PoolConfig`].
#[derive(Debug, Default)]
pub struct PoolConfigBuilder {
    config: PoolConfig,
}

impl PoolConfigBuilder {
    /// Set the number of worker slots (at least 1).
    #[must_use]
    pub fn worker_count(mut self, count: usize) -> Self {
        self.config.worker_count = count.max(1);
        self
    }

    /// Set the per-line timeout.
    #[must_use]
    pub const fn line_timeout(mut self, timeout: Duration) -> Self {
        self.config.line_timeout = timeout;
        self
    }

    /// Set the task queue capacity (at least 1).
    #[must_use]
    pub fn task_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.task_queue_capacity = capacity.max(1);
        self
    }

    /// Set the shutdown grace period.
    #[must_use]
    pub const fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace = grace;
        self
    }

    /// Build the configuration.
    #[must_use]
    pub const fn build(self) -> PoolConfig {
        self.config
    }
}

/// What a worker executes: a flow snapshot plus its environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowTarget {
    flow_path: PathBuf,
    env: BTreeMap<String, String>,
}

impl FlowTarget {
    /// Target the flow at `flow_path`.
    #[must_use]
    pub fn new(flow_path: impl AsRef<Path>) -> Self {
        Self {
            flow_path: flow_path.as_ref().to_path_buf(),
            env: BTreeMap::new(),
        }
    }

    /// Add an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Replace all environment variables.
    #[must_use]
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Get the flow path.
    #[must_use]
    pub fn flow_path(&self) -> &Path {
        &self.flow_path
    }

    /// Get the environment.
    #[must_use]
    pub const fn env_vars(&self) -> &BTreeMap<String, String> {
        &self.env
    }
}

/// One unit of work on the task queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineTask {
    /// Run the line belongs to
    pub run_id: String,
    /// Index of the line in its batch
    pub line_number: usize,
    /// Input record
    pub inputs: LineInputs,
    /// Span the line's spans hang under
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<SpanContext>,
}

/// Terminal state of a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LineStatus {
    /// Produced an output
    Completed,
    /// Executor error, timeout or crash
    Failed,
    /// Never finished because the batch was canceled
    Canceled,
}

/// Error detail of a failed line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineError {
    /// Classification
    pub kind: ErrorKind,
    /// Rendered message
    pub message: String,
}

impl From<&Error> for LineError {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Outcome of one line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineResult {
    line_number: usize,
    status: LineStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<LineError>,
    #[serde(default)]
    spans: Vec<Span>,
}

impl LineResult {
    /// Successful line.
    #[must_use]
    pub const fn completed(line_number: usize, output: Value, spans: Vec<Span>) -> Self {
        Self {
            line_number,
            status: LineStatus::Completed,
            output: Some(output),
            error: None,
            spans,
        }
    }

    /// Failed line.
    #[must_use]
    pub fn failed(line_number: usize, error: &Error, spans: Vec<Span>) -> Self {
        Self {
            line_number,
            status: LineStatus::Failed,
            output: None,
            error: Some(error.into()),
            spans,
        }
    }

    /// Canceled line.
    #[must_use]
    pub fn canceled(line_number: usize) -> Self {
        Self {
            line_number,
            status: LineStatus::Canceled,
            output: None,
            error: Some((&Error::Canceled).into()),
            spans: Vec::new(),
        }
    }

    /// Get the line number.
    #[must_use]
    pub const fn line_number(&self) -> usize {
        self.line_number
    }

    /// Get the status.
    #[must_use]
    pub const fn status(&self) -> LineStatus {
        self.status
    }

    /// Whether the line completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status == LineStatus::Completed
    }

    /// Get the output, present only for completed lines.
    #[must_use]
    pub const fn output(&self) -> Option<&Value> {
        self.output.as_ref()
    }

    /// Get the error, present for failed and canceled lines.
    #[must_use]
    pub const fn error(&self) -> Option<&LineError> {
        self.error.as_ref()
    }

    /// Get the spans shipped back with the line.
    #[must_use]
    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    /// Move the spans out, leaving none behind.
    pub fn take_spans(&mut self) -> Vec<Span> {
        std::mem::take(&mut self.spans)
    }
}

/// A batch of lines for one flow run.
#[derive(Debug, Clone)]
pub struct LineBatch {
    run_id: String,
    target: FlowTarget,
    lines: Vec<LineInputs>,
    parent: Option<SpanContext>,
}

impl LineBatch {
    /// Batch of `lines` for `target` under `run_id`.
    #[must_use]
    pub fn new(run_id: impl Into<String>, target: FlowTarget, lines: Vec<LineInputs>) -> Self {
        Self {
            run_id: run_id.into(),
            target,
            lines,
            parent: None,
        }
    }

    /// Hang every line span under `parent`.
    #[must_use]
    pub fn parent(mut self, parent: SpanContext) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Get the run id.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Number of lines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether the batch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Pool of isolated workers.
#[derive(Clone)]
pub struct WorkerPool {
    config: PoolConfig,
    launcher: Arc<dyn WorkerLauncher>,
}

impl WorkerPool {
    /// Create a pool launching workers through `launcher`.
    #[must_use]
    pub fn new(config: PoolConfig, launcher: Arc<dyn WorkerLauncher>) -> Self {
        Self { config, launcher }
    }

    /// Get the configuration.
    #[must_use]
    pub const fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Execute every line of `batch`.
    ///
    /// Always returns exactly one result per line, sorted by line number.
    /// When `cancel` fires, in-flight workers are killed and every line that
    /// did not finish is reported [`LineStatus::Canceled`].
    pub async fn run(&self, batch: LineBatch, cancel: &CancellationToken) -> Vec<LineResult> {
        let total = batch.lines.len();
        if total == 0 {
            return Vec::new();
        }
        let slots = self.config.worker_count.min(total);
        tracing::debug!(run = %batch.run_id, lines = total, workers = slots, "worker pool starting");

        let (task_tx, task_rx) = mpsc::channel::<LineTask>(self.config.task_queue_capacity);
        let (result_tx, mut result_rx) = mpsc::channel::<LineResult>(total);
        let task_rx = Arc::new(Mutex::new(task_rx));
        let target = Arc::new(batch.target);

        let producer = {
            let cancel = cancel.clone();
            let run_id = batch.run_id.clone();
            let parent = batch.parent;
            let lines = batch.lines;
            tokio::spawn(async move {
                for (line_number, inputs) in lines.into_iter().enumerate() {
                    let task = LineTask {
                        run_id: run_id.clone(),
                        line_number,
                        inputs,
                        parent: parent.clone(),
                    };
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        sent = task_tx.send(task) => if sent.is_err() { break },
                    }
                }
            })
        };

        let mut supervisors = JoinSet::new();
        for slot in 0..slots {
            supervisors.spawn(supervise(Slot {
                id: slot,
                launcher: Arc::clone(&self.launcher),
                target: Arc::clone(&target),
                tasks: Arc::clone(&task_rx),
                results: result_tx.clone(),
                cancel: cancel.clone(),
                config: self.config,
            }));
        }
        drop(result_tx);

        let mut results: Vec<Option<LineResult>> = vec![None; total];
        while let Some(result) = result_rx.recv().await {
            let line = result.line_number;
            if line < total {
                results[line] = Some(result);
            }
        }
        while supervisors.join_next().await.is_some() {}
        producer.abort();

        let canceled = cancel.is_cancelled();
        results
            .into_iter()
            .enumerate()
            .map(|(line, result)| {
                result.unwrap_or_else(|| {
                    if canceled {
                        LineResult::canceled(line)
                    } else {
                        LineResult::failed(
                            line,
                            &Error::WorkerCrash("line was never picked up by a worker".to_string()),
                            Vec::new(),
                        )
                    }
                })
            })
            .collect()
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

struct Slot {
    id: usize,
    launcher: Arc<dyn WorkerLauncher>,
    target: Arc<FlowTarget>,
    tasks: Arc<Mutex<mpsc::Receiver<LineTask>>>,
    results: mpsc::Sender<LineResult>,
    cancel: CancellationToken,
    config: PoolConfig,
}

enum Outcome {
    Done(LineResult),
    Crashed(Error),
    TimedOut,
    Canceled,
}

async fn supervise(slot: Slot) {
    let mut worker: Option<Box<dyn Worker>> = None;
    loop {
        let task = {
            let mut rx = slot.tasks.lock().await;
            tokio::select! {
                biased;
                () = slot.cancel.cancelled() => None,
                task = rx.recv() => task,
            }
        };
        let Some(task) = task else { break };
        let line_number = task.line_number;

        if worker.is_none() {
            match slot.launcher.launch(slot.id, &slot.target).await {
                Ok(launched) => worker = Some(launched),
                Err(e) => {
                    tracing::warn!(worker_id = slot.id, line_number, error = %e, "worker launch failed");
                    let err = Error::WorkerCrash(format!("failed to launch worker {}: {e}", slot.id));
                    let _ = slot.results.send(LineResult::failed(line_number, &err, Vec::new())).await;
                    continue;
                }
            }
        }
        let Some(active) = worker.as_mut() else {
            continue;
        };

        let outcome = tokio::select! {
            biased;
            () = slot.cancel.cancelled() => Outcome::Canceled,
            finished = tokio::time::timeout(slot.config.line_timeout, active.execute(&task)) => match finished {
                Ok(Ok(result)) => Outcome::Done(result),
                Ok(Err(e)) => Outcome::Crashed(e),
                Err(_) => Outcome::TimedOut,
            },
        };

        let result = match outcome {
            Outcome::Done(result) => result,
            Outcome::Crashed(e) => {
                tracing::warn!(worker_id = slot.id, line_number, error = %e, "worker crashed; replacing");
                if let Some(dead) = worker.take() {
                    dead.kill().await;
                }
                LineResult::failed(line_number, &e, Vec::new())
            }
            Outcome::TimedOut => {
                tracing::warn!(worker_id = slot.id, line_number, timeout = ?slot.config.line_timeout, "line timed out; killing worker");
                if let Some(hung) = worker.take() {
                    hung.kill().await;
                }
                let err = Error::WorkerTimeout {
                    line_number,
                    timeout: slot.config.line_timeout,
                };
                LineResult::failed(line_number, &err, Vec::new())
            }
            Outcome::Canceled => {
                if let Some(busy) = worker.take() {
                    busy.kill().await;
                }
                let _ = slot.results.send(LineResult::canceled(line_number)).await;
                break;
            }
        };
        tracing::debug!(worker_id = slot.id, line_number, status = ?result.status(), "line finished");
        if slot.results.send(result).await.is_err() {
            break;
        }
    }

    if let Some(idle) = worker {
        if slot.cancel.is_cancelled() {
            idle.kill().await;
        } else if tokio::time::timeout(slot.config.shutdown_grace, idle.shutdown())
            .await
            .is_err()
        {
            tracing::warn!(worker_id = slot.id, "worker ignored shutdown; killed");
        }
    }
}
