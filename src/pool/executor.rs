//! The executor seam: "run one line of a flow".

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{FlowTarget, LineInputs, LineResult, LineTask};
use crate::recorder::{CallRecorder, RecordingSession, Tool, ToolArgs};
use crate::trace::{ActiveSpan, SpanContext, TraceCollector};
use crate::Result;

/// Runs one line of a flow. Supplied by the flow-execution collaborator.
#[async_trait]
pub trait LineExecutor: Send + Sync {
    /// Produce the output record for `inputs`.
    ///
    /// # Errors
    /// Any error fails this line only.
    async fn execute_line(&self, ctx: &LineContext, inputs: &LineInputs) -> Result<Value>;
}

/// Everything a line can reach while it runs.
pub struct LineContext {
    run_id: String,
    line_number: usize,
    flow_path: PathBuf,
    env: BTreeMap<String, String>,
    collector: Arc<TraceCollector>,
    span: SpanContext,
    session: Option<Arc<RecordingSession>>,
}

impl LineContext {
    /// Get the run id.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Get the line number.
    #[must_use]
    pub const fn line_number(&self) -> usize {
        self.line_number
    }

    /// Get the flow snapshot path.
    #[must_use]
    pub fn flow_path(&self) -> &Path {
        &self.flow_path
    }

    /// Node environment variable, falling back to the process environment.
    #[must_use]
    pub fn env_var(&self, name: &str) -> Option<String> {
        self.env
            .get(name)
            .cloned()
            .or_else(|| std::env::var(name).ok())
    }

    /// Open a span under this line's span.
    #[must_use]
    pub fn start_span(&self, name: impl Into<String>) -> ActiveSpan {
        self.collector
            .start_child_span(name, &self.span, self.run_id.clone())
    }

    /// Call a tool inside a `tool:<name>` span, through the recorder when
    /// one is active.
    ///
    /// # Errors
    /// Returns the tool's error or a replay miss
    pub async fn invoke_tool(&self, tool: &dyn Tool, args: &ToolArgs) -> Result<Value> {
        let mut span = self.start_span(format!("tool:{}", tool.name()));
        let result = match &self.session {
            Some(session) => session.invoke(tool, args).await,
            None => tool.invoke(args).await,
        };
        span.set_attribute("ok", json!(result.is_ok()));
        span.finish();
        result
    }
}

impl std::fmt::Debug for LineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineContext")
            .field("run_id", &self.run_id)
            .field("line_number", &self.line_number)
            .field("flow_path", &self.flow_path)
            .finish_non_exhaustive()
    }
}

/// Worker-side line execution shared by every worker kind.
///
/// Each line gets its own collector; its spans are popped after the line
/// and shipped back in the [`LineResult`].
#[derive(Clone)]
pub struct LineRunner {
    executor: Arc<dyn LineExecutor>,
    target: FlowTarget,
    recorder: Option<Arc<CallRecorder>>,
}

impl LineRunner {
    /// Runner for `target`.
    #[must_use]
    pub fn new(executor: Arc<dyn LineExecutor>, target: FlowTarget) -> Self {
        Self {
            executor,
            target,
            recorder: None,
        }
    }

    /// Route tool calls through `recorder`.
    #[must_use]
    pub fn recorder(mut self, recorder: Option<Arc<CallRecorder>>) -> Self {
        self.recorder = recorder;
        self
    }

    /// Recording scope of a line: stable across runs of the same flow.
    fn session_scope(&self, line_number: usize) -> String {
        let flow = self
            .target
            .flow_path()
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        format!("{flow}:line-{line_number}")
    }

    /// Execute one task. Executor errors become a failed result.
    pub async fn run(&self, task: &LineTask) -> LineResult {
        let line_number = task.line_number;
        let collector = Arc::new(TraceCollector::new());
        let name = format!("line {line_number}");
        let mut line_span = match &task.parent {
            Some(parent) => collector.start_child_span(name, parent, task.run_id.clone()),
            None => collector.start_span(name, task.run_id.clone()),
        };
        line_span.set_attribute("line_number", json!(line_number));

        let ctx = LineContext {
            run_id: task.run_id.clone(),
            line_number,
            flow_path: self.target.flow_path().to_path_buf(),
            env: self.target.env_vars().clone(),
            collector: Arc::clone(&collector),
            span: line_span.context(),
            session: self
                .recorder
                .as_ref()
                .map(|recorder| Arc::new(recorder.session(self.session_scope(line_number)))),
        };
        let outcome = self.executor.execute_line(&ctx, &task.inputs).await;

        line_span.set_attribute("ok", json!(outcome.is_ok()));
        line_span.finish();
        let spans = collector.pop_spans_from_run_id(&task.run_id);
        match outcome {
            Ok(output) => LineResult::completed(line_number, output, spans),
            Err(e) => {
                tracing::debug!(run = %task.run_id, line_number, error = %e, "line failed");
                LineResult::failed(line_number, &e, spans)
            }
        }
    }
}

impl std::fmt::Debug for LineRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineRunner")
            .field("target", &self.target)
            .field("recording", &self.recorder.as_ref().map(|r| r.mode()))
            .finish_non_exhaustive()
    }
}
