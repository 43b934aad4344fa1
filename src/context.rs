//! Engine context - the trace collector and call recorder, opened once and
//! handed to everything that needs them.
//!
//! ## Lifecycle
//!
//! ```text
//! EngineContext::builder()...build()   open recorder, install exporters
//!        │
//!        ├──► launchers / scheduler    share the same collector + recorder
//!        │
//! EngineContext::shutdown()            flush exporters, close the call store
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::pool::{InProcessLauncher, LineExecutor, ProcessLauncher, WorkerPool};
use crate::recorder::{CallRecorder, RecorderConfig, RecordingMode};
use crate::scheduler::{DagScheduler, SchedulerConfig};
use crate::trace::{JsonlSpanExporter, TraceCollector, TreeConsoleExporter};
use crate::Result;

/// Shared tracing and recording state of one orchestrator process.
#[derive(Debug, Clone)]
pub struct EngineContext {
    collector: Arc<TraceCollector>,
    recorder: Arc<CallRecorder>,
}

impl EngineContext {
    /// Create a builder.
    #[must_use]
    pub fn builder() -> EngineContextBuilder {
        EngineContextBuilder::default()
    }

    /// Get the trace collector.
    #[must_use]
    pub const fn collector(&self) -> &Arc<TraceCollector> {
        &self.collector
    }

    /// Get the call recorder.
    #[must_use]
    pub const fn recorder(&self) -> &Arc<CallRecorder> {
        &self.recorder
    }

    /// In-process launcher for `executor`, recording through this context.
    #[must_use]
    pub fn in_process_launcher(&self, executor: Arc<dyn LineExecutor>) -> InProcessLauncher {
        InProcessLauncher::new(executor).recorder(Arc::clone(&self.recorder))
    }

    /// Process launcher for the worker binary at `program`; workers open the
    /// same call store in the same mode.
    #[must_use]
    pub fn process_launcher(&self, program: impl AsRef<Path>) -> ProcessLauncher {
        ProcessLauncher::new(program).recorder(self.recorder.config().clone())
    }

    /// Scheduler over `pool` reporting spans to this context's collector.
    #[must_use]
    pub fn scheduler(&self, config: SchedulerConfig, pool: WorkerPool) -> DagScheduler {
        DagScheduler::new(config, pool, Arc::clone(&self.collector))
    }

    /// Flush every exporter and close the call store.
    ///
    /// # Errors
    /// Returns error if a leaked lock file cannot be removed
    pub fn shutdown(&self) -> Result<()> {
        self.collector.shutdown();
        self.recorder.close()?;
        tracing::debug!("engine context shut down");
        Ok(())
    }
}

/// Builder for `EngineContext`.
#[derive(Debug, Default)]
pub struct EngineContextBuilder {
    collector: Option<Arc<TraceCollector>>,
    recorder: RecorderConfig,
    span_log: Option<PathBuf>,
    console_tree: bool,
}

impl EngineContextBuilder {
    /// Use an existing collector instead of a fresh one.
    #[must_use]
    pub fn collector(mut self, collector: Arc<TraceCollector>) -> Self {
        self.collector = Some(collector);
        self
    }

    /// Use the process-wide collector.
    #[must_use]
    pub fn global_collector(self) -> Self {
        self.collector(TraceCollector::global())
    }

    /// Set the recorder configuration (live by default).
    #[must_use]
    pub fn recorder(mut self, config: RecorderConfig) -> Self {
        self.recorder = config;
        self
    }

    /// Append every span batch to a JSON-lines file.
    #[must_use]
    pub fn span_log(mut self, path: impl AsRef<Path>) -> Self {
        self.span_log = Some(path.as_ref().to_path_buf());
        self
    }

    /// Print every span batch as a tree on stdout.
    #[must_use]
    pub const fn console_tree(mut self, enabled: bool) -> Self {
        self.console_tree = enabled;
        self
    }

    /// Open the recorder and install the exporters.
    ///
    /// # Errors
    /// Returns error if the span log or the call store cannot be opened
    pub fn build(self) -> Result<EngineContext> {
        let collector = self
            .collector
            .unwrap_or_else(|| Arc::new(TraceCollector::new()));
        if let Some(path) = &self.span_log {
            collector.add_exporter(Arc::new(JsonlSpanExporter::new(path)?));
        }
        if self.console_tree {
            collector.add_exporter(Arc::new(TreeConsoleExporter::new()));
        }
        let recorder = match self.recorder.mode() {
            RecordingMode::Live => CallRecorder::live(),
            _ => CallRecorder::open(self.recorder)?,
        };
        Ok(EngineContext {
            collector,
            recorder: Arc::new(recorder),
        })
    }
}
