//! Span exporters: in-memory, JSON-lines file, and indented console tree.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use rustc_hash::{FxHashMap, FxHashSet};

use super::{MemoryTraceStore, Span};
use crate::Result;

/// Receives finished spans in batches.
///
/// Exporters never see a partial batch, so per-batch structure (such as the
/// parent/child tree) is always consistent.
pub trait SpanExporter: Send + Sync {
    /// Export one batch.
    ///
    /// # Errors
    /// Returns error if the sink rejects the batch; the collector logs it and
    /// carries on with the remaining exporters.
    fn export(&self, batch: &[Span]) -> Result<()>;

    /// Push buffered data to the sink.
    ///
    /// # Errors
    /// Returns error if flushing fails
    fn force_flush(&self) -> Result<()> {
        Ok(())
    }

    /// Release resources. Called once at collector shutdown.
    fn shutdown(&self) {}
}

/// Exporter that feeds a [`MemoryTraceStore`] for programmatic inspection.
#[derive(Debug, Clone)]
pub struct MemoryExporter {
    store: Arc<MemoryTraceStore>,
}

impl MemoryExporter {
    /// Create an exporter writing into `store`.
    #[must_use]
    pub const fn new(store: Arc<MemoryTraceStore>) -> Self {
        Self { store }
    }

    /// The backing store.
    #[must_use]
    pub const fn store(&self) -> &Arc<MemoryTraceStore> {
        &self.store
    }
}

impl SpanExporter for MemoryExporter {
    fn export(&self, batch: &[Span]) -> Result<()> {
        self.store.add_spans(batch);
        Ok(())
    }
}

/// Append-only JSON-lines sink, one span object per line.
///
/// Several processes may append to the same file; each batch is written and
/// flushed as a unit.
#[derive(Debug)]
pub struct JsonlSpanExporter {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonlSpanExporter {
    /// Open (or create) the sink at `path`, creating parent directories.
    ///
    /// # Errors
    /// Returns error if the directory or file cannot be created
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Path of the sink file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SpanExporter for JsonlSpanExporter {
    fn export(&self, batch: &[Span]) -> Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        for span in batch {
            serde_json::to_writer(&mut *writer, span)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }

    fn force_flush(&self) -> Result<()> {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()?;
        Ok(())
    }
}

/// Read every span from a JSON-lines sink, skipping blank lines.
///
/// # Errors
/// Returns error if the file cannot be read or a line is not a span
pub fn read_jsonl_spans(path: impl AsRef<Path>) -> Result<Vec<Span>> {
    let reader = BufReader::new(File::open(path.as_ref())?);
    let mut spans = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        spans.push(serde_json::from_str(&line)?);
    }
    Ok(spans)
}

/// Parent-pointer tree over one export batch.
///
/// Spans live in an arena (the batch order); the children index maps a parent
/// id to arena positions. Spans whose parent is absent from the batch are
/// treated as roots of this batch.
#[derive(Debug)]
pub struct SpanTree<'a> {
    spans: &'a [Span],
    children: FxHashMap<Option<&'a str>, Vec<usize>>,
}

impl<'a> SpanTree<'a> {
    /// Index a batch.
    #[must_use]
    pub fn from_batch(spans: &'a [Span]) -> Self {
        let ids: FxHashSet<&str> = spans.iter().map(Span::span_id).collect();
        let mut children: FxHashMap<Option<&'a str>, Vec<usize>> = FxHashMap::default();
        for (idx, span) in spans.iter().enumerate() {
            let parent = span.parent_span_id().filter(|p| ids.contains(p));
            children.entry(parent).or_default().push(idx);
        }
        Self { spans, children }
    }

    /// Root spans of the batch, in ingestion order.
    #[must_use]
    pub fn roots(&self) -> Vec<&'a Span> {
        self.children_of(None)
    }

    /// Direct children of `parent` (`None` = roots), in ingestion order.
    #[must_use]
    pub fn children_of(&self, parent: Option<&str>) -> Vec<&'a Span> {
        self.children
            .get(&parent)
            .map(|idxs| idxs.iter().map(|&i| &self.spans[i]).collect())
            .unwrap_or_default()
    }

    /// Depth-first walk from the roots, calling `visit(depth, span)`.
    ///
    /// Every span is visited at most once, so malformed parent cycles cannot
    /// loop forever.
    pub fn walk(&self, mut visit: impl FnMut(usize, &'a Span)) {
        let mut seen: FxHashSet<&str> = FxHashSet::default();
        let mut stack: Vec<(usize, &'a Span)> =
            self.roots().into_iter().rev().map(|s| (0, s)).collect();
        while let Some((depth, span)) = stack.pop() {
            if !seen.insert(span.span_id()) {
                continue;
            }
            visit(depth, span);
            for child in self.children_of(Some(span.span_id())).into_iter().rev() {
                stack.push((depth + 1, child));
            }
        }
    }

    /// Render as an indented list, two spaces per level.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.walk(|depth, span| {
            out.push_str(&"  ".repeat(depth));
            out.push_str("- ");
            out.push_str(span.name());
            out.push_str("\ttrace_id: ");
            out.push_str(span.trace_id());
            out.push_str(" span_id: ");
            out.push_str(span.span_id());
            out.push('\n');
        });
        out
    }
}

/// Human-readable tree printer. Writes one rendered tree per batch.
pub struct TreeConsoleExporter {
    sink: Mutex<Box<dyn Write + Send>>,
}

impl TreeConsoleExporter {
    /// Print to stdout.
    #[must_use]
    pub fn new() -> Self {
        Self::with_writer(Box::new(std::io::stdout()))
    }

    /// Print to an arbitrary writer.
    #[must_use]
    pub fn with_writer(sink: Box<dyn Write + Send>) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }

    /// Render a batch without printing it.
    #[must_use]
    pub fn render(batch: &[Span]) -> String {
        SpanTree::from_batch(batch).render()
    }
}

impl Default for TreeConsoleExporter {
    fn default() -> Self {
        Self::new()
    }
}

impl SpanExporter for TreeConsoleExporter {
    fn export(&self, batch: &[Span]) -> Result<()> {
        let text = Self::render(batch);
        let mut sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        sink.write_all(text.as_bytes())?;
        sink.flush()?;
        Ok(())
    }

    fn force_flush(&self) -> Result<()> {
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()?;
        Ok(())
    }
}
