//! Trace collector integration tests
//!
//! Spans cross a simulated process boundary as serialized contexts and
//! batches, then come back together as one tree per run.

use std::io::Write;
use std::sync::{Arc, Mutex};

use serde_json::json;

use flowrun::trace::{
    read_jsonl_spans, JsonlSpanExporter, Span, SpanContext, SpanExporter, SpanTree,
    TraceCollector, TreeConsoleExporter,
};
use flowrun::{Error, Result};

/// Exporter that always fails.
struct Broken;

impl SpanExporter for Broken {
    fn export(&self, _batch: &[Span]) -> Result<()> {
        Err(Error::Other("sink unavailable".to_string()))
    }
}

/// Writer appending into a shared buffer.
#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_root_and_child_pop_leaves_run_empty() {
    let collector = Arc::new(TraceCollector::new());
    let root = collector.start_span("experiment", "run-1");
    root.child("node main").finish();
    let root_span = root.finish();

    let spans = collector.pop_spans_from_run_id("run-1");
    assert_eq!(spans.len(), 2);
    let child = spans.iter().find(|s| !s.is_root()).unwrap();
    assert_eq!(child.parent_span_id(), Some(root_span.span_id()));
    assert_eq!(child.trace_id(), root_span.trace_id());
    assert!(collector.get_spans_from_run_id("run-1").is_empty());
}

#[test]
fn test_worker_spans_stitch_under_orchestrator_span() {
    let orchestrator = Arc::new(TraceCollector::new());
    let node = orchestrator.start_span("node main", "run-2");

    // The context travels to the worker as JSON.
    let wire = serde_json::to_string(&node.context()).unwrap();
    let parent: SpanContext = serde_json::from_str(&wire).unwrap();

    let worker = Arc::new(TraceCollector::new());
    let mut line = worker.start_child_span("line 0", &parent, "run-2");
    line.set_attribute("line_number", json!(0));
    line.child("tool chat").finish();
    line.finish();
    let shipped = worker.pop_spans_from_run_id("run-2");
    assert_eq!(shipped.len(), 2);

    orchestrator.add_spans(shipped);
    let node_span = node.finish();

    let spans = orchestrator.get_spans_from_run_id("run-2");
    assert_eq!(spans.len(), 3);
    assert!(spans.iter().all(|s| s.trace_id() == node_span.trace_id()));

    let rendered = TreeConsoleExporter::render(&spans);
    let lines: Vec<&str> = rendered.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("- node main"));
    assert!(lines[1].starts_with("  - line 0"));
    assert!(lines[2].starts_with("    - tool chat"));
}

#[test]
fn test_failing_exporter_does_not_block_others() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("spans/trace.jsonl");

    let collector = Arc::new(TraceCollector::new());
    collector.add_exporter(Arc::new(Broken));
    collector.add_exporter(Arc::new(JsonlSpanExporter::new(&path).unwrap()));
    assert_eq!(collector.exporter_count(), 3);

    collector.start_span("a", "run-3").finish();
    collector.start_span("b", "run-3").finish();
    collector.shutdown();

    assert_eq!(collector.get_spans_from_run_id("run-3").len(), 2);
    let persisted = read_jsonl_spans(&path).unwrap();
    let names: Vec<&str> = persisted.iter().map(Span::name).collect();
    assert_eq!(names, vec!["a", "b"]);
}

#[test]
fn test_console_exporter_prints_one_tree_per_batch() {
    let buf = SharedBuf::default();
    let collector = Arc::new(TraceCollector::new());
    collector.add_exporter(Arc::new(TreeConsoleExporter::with_writer(Box::new(buf.clone()))));

    let root = Span::builder("experiment").root_run_id("run-4").build();
    let child = Span::builder("node")
        .parent(&root.context())
        .root_run_id("run-4")
        .build();
    collector.add_spans(vec![child, root]);

    let text = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
    assert!(text.starts_with("- experiment"));
    assert!(text.contains("\n  - node"));
}

#[test]
fn test_orphans_become_roots_of_their_batch() {
    let missing_parent = Span::builder("ghost").build();
    let orphan = Span::builder("orphan").parent(&missing_parent.context()).build();
    let batch = vec![orphan];

    let tree = SpanTree::from_batch(&batch);
    assert_eq!(tree.roots().len(), 1);
    assert_eq!(tree.roots()[0].name(), "orphan");
}

#[test]
fn test_untagged_spans_are_kept_apart_from_runs() {
    let collector = TraceCollector::new();
    collector.add_spans(vec![Span::builder("loose").build()]);
    assert!(collector.get_spans_from_run_id("run-5").is_empty());
    assert_eq!(collector.store().len(), 1);
}
