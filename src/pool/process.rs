//! Worker processes speaking the JSON-lines protocol over stdio.
//!
//! Each worker is a child process with `kill_on_drop(true)`, so a worker
//! handle dropped for any reason never leaks a process.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use super::protocol::{encode, WorkerRequest, WorkerResponse};
use super::{FlowTarget, LineResult, LineTask, Worker, WorkerLauncher};
use crate::recorder::RecorderConfig;
use crate::{Error, Result};

/// Environment variable carrying the flow snapshot path to a worker.
pub const ENV_FLOW_PATH: &str = "FLOWRUN_FLOW_PATH";

/// Default time a fresh worker gets to report ready.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// How worker processes are brought up.
///
/// Always chosen explicitly; nothing inspects the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StartMethod {
    /// Fresh process on demand for every slot and every replacement
    #[default]
    Spawn,
    /// Keep one initialised spare process so replacements are immediate
    Prewarm,
}

/// Launches worker processes.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<OsString>,
    env: BTreeMap<String, String>,
    recorder: Option<RecorderConfig>,
    start_method: StartMethod,
    ready_timeout: Duration,
    spare: Arc<Mutex<Option<(FlowTarget, ChildWorker)>>>,
    refilling: Arc<AtomicBool>,
}

impl ProcessLauncher {
    /// Launcher for the worker binary at `program`.
    #[must_use]
    pub fn new(program: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            args: Vec::new(),
            env: BTreeMap::new(),
            recorder: None,
            start_method: StartMethod::default(),
            ready_timeout: DEFAULT_READY_TIMEOUT,
            spare: Arc::new(Mutex::new(None)),
            refilling: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Add a command-line argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add an environment variable for every worker.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Run workers in the given recording mode.
    #[must_use]
    pub fn recorder(mut self, config: RecorderConfig) -> Self {
        self.recorder = Some(config);
        self
    }

    /// Choose the start strategy.
    #[must_use]
    pub const fn start_method(mut self, method: StartMethod) -> Self {
        self.start_method = method;
        self
    }

    /// Set how long a fresh worker has to report ready.
    #[must_use]
    pub const fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Get the start strategy.
    #[must_use]
    pub const fn method(&self) -> StartMethod {
        self.start_method
    }

    /// Start the spare process for `target` ahead of the first launch.
    ///
    /// No-op for [`StartMethod::Spawn`].
    ///
    /// # Errors
    /// Returns error if the spare fails to start
    pub async fn prewarm(&self, target: &FlowTarget) -> Result<()> {
        if self.start_method != StartMethod::Prewarm {
            return Ok(());
        }
        let worker = self.spawn_worker(usize::MAX, target).await?;
        *self.spare.lock().await = Some((target.clone(), worker));
        Ok(())
    }

    /// Whether an initialised spare is waiting.
    pub async fn has_spare(&self) -> bool {
        self.spare.lock().await.is_some()
    }

    async fn spawn_worker(&self, worker_id: usize, target: &FlowTarget) -> Result<ChildWorker> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env(ENV_FLOW_PATH, target.flow_path())
            .envs(&self.env)
            .envs(target.env_vars())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(recorder) = &self.recorder {
            command.envs(recorder.to_env());
        }

        let mut child = command.spawn().map_err(|e| {
            Error::WorkerCrash(format!(
                "failed to spawn worker '{}': {e}",
                self.program.display()
            ))
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::WorkerCrash("worker has no stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::WorkerCrash("worker has no stdout".to_string()))?;

        let mut worker = ChildWorker {
            id: worker_id,
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        };
        match tokio::time::timeout(self.ready_timeout, worker.read_response()).await {
            Ok(Ok(WorkerResponse::Ready { pid })) => {
                tracing::debug!(worker_id, pid, "worker process ready");
                Ok(worker)
            }
            Ok(Ok(WorkerResponse::Result(_))) => Err(Error::WorkerCrash(
                "worker sent a result before ready".to_string(),
            )),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::WorkerCrash(format!(
                "worker not ready after {:?}",
                self.ready_timeout
            ))),
        }
    }

    fn refill_spare(&self, target: &FlowTarget) {
        if self.refilling.swap(true, Ordering::AcqRel) {
            return;
        }
        let launcher = self.clone();
        let target = target.clone();
        tokio::spawn(async move {
            match launcher.spawn_worker(usize::MAX, &target).await {
                Ok(worker) => *launcher.spare.lock().await = Some((target, worker)),
                Err(e) => tracing::warn!(error = %e, "failed to prewarm spare worker"),
            }
            launcher.refilling.store(false, Ordering::Release);
        });
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, worker_id: usize, target: &FlowTarget) -> Result<Box<dyn Worker>> {
        if self.start_method == StartMethod::Prewarm {
            let spare = self.spare.lock().await.take();
            self.refill_spare(target);
            if let Some((spare_target, mut worker)) = spare {
                if spare_target == *target && worker.is_alive() {
                    worker.id = worker_id;
                    return Ok(Box::new(worker));
                }
                worker.terminate().await;
            }
        }
        Ok(Box::new(self.spawn_worker(worker_id, target).await?))
    }
}

#[derive(Debug)]
struct ChildWorker {
    id: usize,
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl ChildWorker {
    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn send(&mut self, request: &WorkerRequest) -> Result<()> {
        let line = encode(request)?;
        self.stdin.write_all(&line).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn read_response(&mut self) -> Result<WorkerResponse> {
        loop {
            let Some(line) = self.stdout.next_line().await? else {
                let status = self.child.wait().await?;
                return Err(Error::WorkerCrash(format!("worker exited ({status})")));
            };
            if line.trim().is_empty() {
                continue;
            }
            return serde_json::from_str(&line).map_err(|e| {
                Error::WorkerCrash(format!("worker broke protocol: {e}"))
            });
        }
    }

    async fn terminate(&mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::debug!(worker_id = self.id, error = %e, "worker already gone");
        }
    }
}

#[async_trait]
impl Worker for ChildWorker {
    fn id(&self) -> usize {
        self.id
    }

    async fn execute(&mut self, task: &LineTask) -> Result<LineResult> {
        self.send(&WorkerRequest::Line(task.clone()))
            .await
            .map_err(|e| Error::WorkerCrash(format!("cannot reach worker {}: {e}", self.id)))?;
        match self.read_response().await? {
            WorkerResponse::Result(result) if result.line_number() == task.line_number => Ok(result),
            WorkerResponse::Result(result) => Err(Error::WorkerCrash(format!(
                "worker answered line {} while line {} was pending",
                result.line_number(),
                task.line_number
            ))),
            WorkerResponse::Ready { .. } => Err(Error::WorkerCrash(
                "worker restarted mid-line".to_string(),
            )),
        }
    }

    async fn shutdown(self: Box<Self>) -> Result<()> {
        let mut this = self;
        this.send(&WorkerRequest::Shutdown).await?;
        let status = this.child.wait().await?;
        tracing::debug!(worker_id = this.id, %status, "worker exited");
        Ok(())
    }

    async fn kill(self: Box<Self>) {
        let mut this = self;
        this.terminate().await;
    }
}
