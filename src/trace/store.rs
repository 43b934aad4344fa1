//! In-memory span store keyed by run, using `DashMap`.
//!
//! Safe to query while spans are still arriving: a run's spans from one
//! batch land together, so readers see every batch that finished ingesting
//! and never half a batch for one run.

use dashmap::DashMap;
use rustc_hash::FxHashMap;

use super::Span;

/// Run id used for spans that carry no `root_run_id` attribute.
const UNTAGGED_RUN: &str = "";

/// In-memory span store grouped by `root_run_id`.
///
/// Thread-safe and optimized for concurrent ingestion from many workers.
#[derive(Debug, Default)]
pub struct MemoryTraceStore {
    runs: DashMap<String, Vec<Span>>,
}

impl MemoryTraceStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            runs: DashMap::new(),
        }
    }

    /// Append spans, grouping them by run.
    ///
    /// Each run's share of the batch is appended under one entry lock.
    pub fn add_spans(&self, spans: &[Span]) {
        let mut grouped: FxHashMap<&str, Vec<Span>> = FxHashMap::default();
        for span in spans {
            grouped
                .entry(span.root_run_id().unwrap_or(UNTAGGED_RUN))
                .or_default()
                .push(span.clone());
        }
        for (run_id, batch) in grouped {
            self.runs.entry(run_id.to_string()).or_default().extend(batch);
        }
    }

    /// Spans for a run, in ingestion order.
    #[must_use]
    pub fn get_spans_from_run_id(&self, run_id: &str) -> Vec<Span> {
        self.runs
            .get(run_id)
            .map(|spans| spans.value().clone())
            .unwrap_or_default()
    }

    /// Remove and return all spans for a run in one step.
    #[must_use]
    pub fn pop_spans_from_run_id(&self, run_id: &str) -> Vec<Span> {
        self.runs
            .remove(run_id)
            .map(|(_, spans)| spans)
            .unwrap_or_default()
    }

    /// Runs that currently hold spans.
    #[must_use]
    pub fn run_ids(&self) -> Vec<String> {
        self.runs.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Total number of spans held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.runs.iter().map(|entry| entry.value().len()).sum()
    }

    /// Whether the store holds no spans.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every span.
    pub fn clear(&self) {
        self.runs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(name: &str, run: &str) -> Span {
        Span::builder(name).root_run_id(run).build()
    }

    #[test]
    fn test_groups_by_run() {
        let store = MemoryTraceStore::new();
        store.add_spans(&[span("a", "r1"), span("b", "r2"), span("c", "r1")]);

        let r1 = store.get_spans_from_run_id("r1");
        assert_eq!(r1.len(), 2);
        assert_eq!(r1[0].name(), "a");
        assert_eq!(r1[1].name(), "c");
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_readers_never_see_half_a_batch() {
        let store = MemoryTraceStore::new();
        let batch = [span("a", "r1"), span("x", "r2"), span("b", "r1"), span("c", "r1")];

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for _ in 0..500 {
                    store.add_spans(&batch);
                }
            });
            scope.spawn(|| {
                for _ in 0..500 {
                    let r1 = store.get_spans_from_run_id("r1");
                    assert_eq!(r1.len() % 3, 0);
                    let names: Vec<&str> = r1.iter().map(Span::name).collect();
                    for chunk in names.chunks(3) {
                        assert_eq!(chunk, ["a", "b", "c"]);
                    }
                }
            });
        });
        assert_eq!(store.get_spans_from_run_id("r1").len(), 1500);
        assert_eq!(store.get_spans_from_run_id("r2").len(), 500);
    }

    #[test]
    fn test_pop_leaves_other_runs() {
        let store = MemoryTraceStore::new();
        store.add_spans(&[span("a", "r1"), span("b", "r2")]);

        assert_eq!(store.pop_spans_from_run_id("r1").len(), 1);
        assert!(store.get_spans_from_run_id("r1").is_empty());
        assert_eq!(store.get_spans_from_run_id("r2").len(), 1);
    }

    #[test]
    fn test_untagged_spans_are_kept() {
        let store = MemoryTraceStore::new();
        store.add_spans(&[Span::builder("loose").build()]);
        assert_eq!(store.get_spans_from_run_id("").len(), 1);
    }

    #[test]
    fn test_pop_unknown_run_is_empty() {
        let store = MemoryTraceStore::new();
        assert!(store.pop_spans_from_run_id("missing").is_empty());
        assert!(store.is_empty());
    }
}
