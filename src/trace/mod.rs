//! Trace Collector - hierarchical execution spans across process boundaries
//!
//! Spans are emitted by the orchestrator and by every worker. Workers ship
//! their spans back inside line results, and the orchestrator ingests them
//! with [`TraceCollector::add_spans`], so one logical trace per run survives
//! the process hop without any shared memory.
//!
//! ## Pipeline
//!
//! ```text
//! ActiveSpan::finish ──┐
//!                      ├──► TraceCollector::add_spans(batch)
//! LineResult.spans ────┘            │
//!                                   ├──► MemoryExporter   (MemoryTraceStore, by root_run_id)
//!                                   ├──► JsonlSpanExporter (append-only durable sink)
//!                                   └──► TreeConsoleExporter (indented tree per batch)
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use flowrun::trace::TraceCollector;
//!
//! let collector = Arc::new(TraceCollector::new());
//! let root = collector.start_span("experiment", "run-001");
//! let child = root.child("node:main");
//! child.finish();
//! root.finish();
//!
//! let spans = collector.pop_spans_from_run_id("run-001");
//! assert_eq!(spans.len(), 2);
//! assert!(collector.get_spans_from_run_id("run-001").is_empty());
//! ```

mod export;
mod store;

pub use export::{
    read_jsonl_spans, JsonlSpanExporter, MemoryExporter, SpanExporter, SpanTree,
    TreeConsoleExporter,
};
pub use store::MemoryTraceStore;

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Attribute key that ties every span to the run that produced it.
pub const ROOT_RUN_ID: &str = "root_run_id";

/// A single timed unit of execution.
///
/// Immutable after emission. `parent_span_id == None` marks a root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Span {
    trace_id: String,
    span_id: String,
    parent_span_id: Option<String>,
    name: String,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    #[serde(default)]
    attributes: BTreeMap<String, Value>,
}

impl Span {
    /// Create a builder for a span with the given name.
    ///
    /// The builder starts a fresh trace; call [`SpanBuilder::parent`] to
    /// attach it to an existing one.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> SpanBuilder {
        SpanBuilder::new(name)
    }

    /// Get the trace ID.
    #[must_use]
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Get the span ID.
    #[must_use]
    pub fn span_id(&self) -> &str {
        &self.span_id
    }

    /// Get the parent span ID, `None` for roots.
    #[must_use]
    pub fn parent_span_id(&self) -> Option<&str> {
        self.parent_span_id.as_deref()
    }

    /// Get the span name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the start timestamp.
    #[must_use]
    pub const fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// Get the end timestamp.
    #[must_use]
    pub const fn end_time(&self) -> DateTime<Utc> {
        self.end_time
    }

    /// Get all attributes.
    #[must_use]
    pub const fn attributes(&self) -> &BTreeMap<String, Value> {
        &self.attributes
    }

    /// Get the run this span belongs to, if tagged.
    #[must_use]
    pub fn root_run_id(&self) -> Option<&str> {
        self.attributes.get(ROOT_RUN_ID).and_then(Value::as_str)
    }

    /// Whether this span has no parent.
    #[must_use]
    pub const fn is_root(&self) -> bool {
        self.parent_span_id.is_none()
    }

    /// Context to hand to children of this span.
    #[must_use]
    pub fn context(&self) -> SpanContext {
        SpanContext {
            trace_id: self.trace_id.clone(),
            span_id: self.span_id.clone(),
        }
    }
}

/// Identity of a span, used as the parent pointer for its children.
///
/// Serializable so it can cross into a worker process with a line task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpanContext {
    /// Trace the span belongs to
    pub trace_id: String,
    /// The span itself
    pub span_id: String,
}

/// Builder for [`Span`].
#[derive(Debug, Clone)]
pub struct SpanBuilder {
    trace_id: String,
    span_id: String,
    parent_span_id: Option<String>,
    name: String,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    attributes: BTreeMap<String, Value>,
}

impl SpanBuilder {
    /// Create a new root builder with generated IDs, started now.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            trace_id: new_trace_id(),
            span_id: new_span_id(),
            parent_span_id: None,
            name: name.into(),
            start_time: Utc::now(),
            end_time: None,
            attributes: BTreeMap::new(),
        }
    }

    /// Attach to a parent: adopts its trace and points at its span.
    #[must_use]
    pub fn parent(mut self, parent: &SpanContext) -> Self {
        self.trace_id.clone_from(&parent.trace_id);
        self.parent_span_id = Some(parent.span_id.clone());
        self
    }

    /// Override the generated trace ID.
    #[must_use]
    pub fn trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    /// Override the generated span ID.
    #[must_use]
    pub fn span_id(mut self, span_id: impl Into<String>) -> Self {
        self.span_id = span_id.into();
        self
    }

    /// Set the parent span ID directly (for replayed or imported spans).
    #[must_use]
    pub fn parent_span_id(mut self, parent_span_id: impl Into<String>) -> Self {
        self.parent_span_id = Some(parent_span_id.into());
        self
    }

    /// Tag the span with the run it belongs to.
    #[must_use]
    pub fn root_run_id(self, run_id: impl Into<String>) -> Self {
        self.attribute(ROOT_RUN_ID, Value::String(run_id.into()))
    }

    /// Set an attribute.
    #[must_use]
    pub fn attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Set a custom start timestamp.
    #[must_use]
    pub const fn start_time(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = start_time;
        self
    }

    /// Set a custom end timestamp.
    #[must_use]
    pub const fn end_time(mut self, end_time: DateTime<Utc>) -> Self {
        self.end_time = Some(end_time);
        self
    }

    /// Context of the span being built.
    #[must_use]
    pub fn context(&self) -> SpanContext {
        SpanContext {
            trace_id: self.trace_id.clone(),
            span_id: self.span_id.clone(),
        }
    }

    /// Build the span. An unset end time means "ends now".
    #[must_use]
    pub fn build(self) -> Span {
        Span {
            trace_id: self.trace_id,
            span_id: self.span_id,
            parent_span_id: self.parent_span_id,
            name: self.name,
            start_time: self.start_time,
            end_time: self.end_time.unwrap_or_else(Utc::now),
            attributes: self.attributes,
        }
    }
}

/// A span that is still open. Emitted to its collector on [`finish`](Self::finish).
pub struct ActiveSpan {
    collector: Arc<TraceCollector>,
    builder: SpanBuilder,
    run_id: Option<String>,
}

impl ActiveSpan {
    /// Context for children of this span.
    #[must_use]
    pub fn context(&self) -> SpanContext {
        self.builder.context()
    }

    /// Set an attribute on the open span.
    pub fn set_attribute(&mut self, key: impl Into<String>, value: Value) {
        self.builder.attributes.insert(key.into(), value);
    }

    /// Open a child span in the same trace and run.
    #[must_use]
    pub fn child(&self, name: impl Into<String>) -> Self {
        let mut builder = SpanBuilder::new(name).parent(&self.builder.context());
        if let Some(run_id) = &self.run_id {
            builder = builder.root_run_id(run_id.clone());
        }
        Self {
            collector: Arc::clone(&self.collector),
            builder,
            run_id: self.run_id.clone(),
        }
    }

    /// Close the span and emit it as a batch of one.
    pub fn finish(self) -> Span {
        let span = self.builder.build();
        self.collector.add_spans(vec![span.clone()]);
        span
    }
}

/// Process-local span collector with pluggable exporters.
///
/// Every batch handed to [`add_spans`](Self::add_spans) is offered to each
/// exporter independently; a failing exporter is logged and skipped, it never
/// blocks the others or the caller. An in-memory exporter is always installed
/// so spans can be queried by run id.
pub struct TraceCollector {
    store: Arc<MemoryTraceStore>,
    exporters: RwLock<Vec<Arc<dyn SpanExporter>>>,
}

static GLOBAL_COLLECTOR: OnceLock<Arc<TraceCollector>> = OnceLock::new();

impl TraceCollector {
    /// Create a collector with only the in-memory exporter installed.
    #[must_use]
    pub fn new() -> Self {
        let store = Arc::new(MemoryTraceStore::new());
        let memory: Arc<dyn SpanExporter> = Arc::new(MemoryExporter::new(Arc::clone(&store)));
        Self {
            store,
            exporters: RwLock::new(vec![memory]),
        }
    }

    /// Process-wide collector, created on first use.
    ///
    /// Repeated calls return the same instance.
    #[must_use]
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL_COLLECTOR.get_or_init(|| Arc::new(Self::new())))
    }

    /// Register an additional exporter.
    pub fn add_exporter(&self, exporter: Arc<dyn SpanExporter>) {
        self.exporters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(exporter);
    }

    /// Number of installed exporters, including the in-memory one.
    #[must_use]
    pub fn exporter_count(&self) -> usize {
        self.exporters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Ingest a batch of finished spans.
    pub fn add_spans(&self, spans: Vec<Span>) {
        if spans.is_empty() {
            return;
        }
        let exporters: Vec<Arc<dyn SpanExporter>> = self
            .exporters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for exporter in exporters {
            if let Err(e) = exporter.export(&spans) {
                tracing::warn!(error = %e, batch = spans.len(), "span exporter failed");
            }
        }
    }

    /// Open a root span for `run_id`.
    #[must_use]
    pub fn start_span(self: &Arc<Self>, name: impl Into<String>, run_id: impl Into<String>) -> ActiveSpan {
        let run_id = run_id.into();
        ActiveSpan {
            collector: Arc::clone(self),
            builder: SpanBuilder::new(name).root_run_id(run_id.clone()),
            run_id: Some(run_id),
        }
    }

    /// Open a span under an existing parent (possibly from another process).
    #[must_use]
    pub fn start_child_span(
        self: &Arc<Self>,
        name: impl Into<String>,
        parent: &SpanContext,
        run_id: impl Into<String>,
    ) -> ActiveSpan {
        let run_id = run_id.into();
        ActiveSpan {
            collector: Arc::clone(self),
            builder: SpanBuilder::new(name)
                .parent(parent)
                .root_run_id(run_id.clone()),
            run_id: Some(run_id),
        }
    }

    /// All spans collected so far for a run.
    #[must_use]
    pub fn get_spans_from_run_id(&self, run_id: &str) -> Vec<Span> {
        self.store.get_spans_from_run_id(run_id)
    }

    /// Atomically remove and return all spans for a run.
    #[must_use]
    pub fn pop_spans_from_run_id(&self, run_id: &str) -> Vec<Span> {
        self.store.pop_spans_from_run_id(run_id)
    }

    /// Drop every collected span.
    pub fn clear(&self) {
        self.store.clear();
    }

    /// The in-memory store backing run-id queries.
    #[must_use]
    pub const fn store(&self) -> &Arc<MemoryTraceStore> {
        &self.store
    }

    /// Flush and shut down every exporter.
    pub fn shutdown(&self) {
        let exporters = self
            .exporters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for exporter in exporters {
            if let Err(e) = exporter.force_flush() {
                tracing::warn!(error = %e, "span exporter flush failed");
            }
            exporter.shutdown();
        }
    }
}

impl Default for TraceCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TraceCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceCollector")
            .field("spans", &self.store.len())
            .field("exporters", &self.exporter_count())
            .finish()
    }
}

fn new_trace_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn new_span_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}
