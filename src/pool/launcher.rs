//! Worker lifecycle seam and the in-process (tokio task) worker.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::AbortHandle;

use super::{FlowTarget, LineExecutor, LineResult, LineRunner, LineTask};
use crate::recorder::CallRecorder;
use crate::{Error, Result};

/// One isolated worker executing lines sequentially.
#[async_trait]
pub trait Worker: Send {
    /// Slot the worker serves.
    fn id(&self) -> usize;

    /// Execute a line.
    ///
    /// `Ok` carries the line's own outcome, including executor failures.
    ///
    /// # Errors
    /// `Err` means the worker itself is unusable (crashed, broke protocol)
    /// and must be replaced.
    async fn execute(&mut self, task: &LineTask) -> Result<LineResult>;

    /// Ask the worker to exit after its current line.
    ///
    /// # Errors
    /// Returns error if the worker could not be told to stop
    async fn shutdown(self: Box<Self>) -> Result<()>;

    /// Terminate immediately.
    async fn kill(self: Box<Self>);
}

/// Creates workers for a flow target.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Launch a ready-to-use worker for slot `worker_id`.
    ///
    /// # Errors
    /// Returns error if the worker cannot be started
    async fn launch(&self, worker_id: usize, target: &FlowTarget) -> Result<Box<dyn Worker>>;
}

/// Runs each line on its own tokio task.
///
/// The task is aborted on timeout or cancellation and a panic in the
/// executor is contained as a [`Error::WorkerCrash`]. Cheap, but shares the
/// orchestrator's address space, so only for trusted executors.
#[derive(Clone)]
pub struct InProcessLauncher {
    executor: Arc<dyn LineExecutor>,
    recorder: Option<Arc<CallRecorder>>,
}

impl InProcessLauncher {
    /// Launcher running `executor`.
    #[must_use]
    pub fn new(executor: Arc<dyn LineExecutor>) -> Self {
        Self {
            executor,
            recorder: None,
        }
    }

    /// Route tool calls through `recorder`.
    #[must_use]
    pub fn recorder(mut self, recorder: Arc<CallRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }
}

impl std::fmt::Debug for InProcessLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessLauncher").finish_non_exhaustive()
    }
}

#[async_trait]
impl WorkerLauncher for InProcessLauncher {
    async fn launch(&self, worker_id: usize, target: &FlowTarget) -> Result<Box<dyn Worker>> {
        let runner = LineRunner::new(Arc::clone(&self.executor), target.clone())
            .recorder(self.recorder.clone());
        Ok(Box::new(TaskWorker {
            id: worker_id,
            runner,
            inflight: None,
        }))
    }
}

struct TaskWorker {
    id: usize,
    runner: LineRunner,
    inflight: Option<AbortHandle>,
}

#[async_trait]
impl Worker for TaskWorker {
    fn id(&self) -> usize {
        self.id
    }

    async fn execute(&mut self, task: &LineTask) -> Result<LineResult> {
        let runner = self.runner.clone();
        let owned = task.clone();
        let handle = tokio::spawn(async move { runner.run(&owned).await });
        self.inflight = Some(handle.abort_handle());
        let joined = handle.await;
        self.inflight = None;
        joined.map_err(|e| {
            if e.is_panic() {
                Error::WorkerCrash(format!("line {} panicked: {}", task.line_number, panic_message(e.into_panic())))
            } else {
                Error::WorkerCrash(format!("line {} task was aborted", task.line_number))
            }
        })
    }

    async fn shutdown(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    async fn kill(self: Box<Self>) {
        if let Some(inflight) = &self.inflight {
            inflight.abort();
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{LineContext, LineInputs, LineStatus};
    use serde_json::{json, Value};
    use std::time::Duration;

    struct Flaky;

    #[async_trait]
    impl LineExecutor for Flaky {
        async fn execute_line(&self, ctx: &LineContext, _inputs: &LineInputs) -> Result<Value> {
            match ctx.line_number() {
                0 => Ok(json!("fine")),
                1 => panic!("flow code exploded"),
                _ => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(Value::Null)
                }
            }
        }
    }

    fn task(line_number: usize) -> LineTask {
        LineTask {
            run_id: "r".to_string(),
            line_number,
            inputs: LineInputs::new(),
            parent: None,
        }
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let launcher = InProcessLauncher::new(Arc::new(Flaky));
        let mut worker = launcher.launch(0, &FlowTarget::new("/f")).await.unwrap();

        let ok = worker.execute(&task(0)).await.unwrap();
        assert_eq!(ok.status(), LineStatus::Completed);

        let err = worker.execute(&task(1)).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::WorkerCrash);
        assert!(err.to_string().contains("flow code exploded"));
    }

    #[tokio::test]
    async fn test_kill_aborts_inflight_line() {
        let launcher = InProcessLauncher::new(Arc::new(Flaky));
        let mut worker = launcher.launch(3, &FlowTarget::new("/f")).await.unwrap();
        assert_eq!(worker.id(), 3);

        let timed = tokio::time::timeout(Duration::from_millis(20), worker.execute(&task(2))).await;
        assert!(timed.is_err());
        worker.kill().await;
    }
}
