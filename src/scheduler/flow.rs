//! Flow nodes: line construction, pool dispatch and evaluation metrics.

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::{Execution, NodeContext, NodeResult};
use crate::experiment::{ExperimentNode, FlowNode, NodeRunStatus, Reference};
use crate::pool::{FlowTarget, LineBatch, LineInputs, LineResult, LineStatus};
use crate::trace::SpanContext;
use crate::{Error, Result};

/// File holding one JSON object per line under the run directory.
pub const OUTPUTS_FILE: &str = "outputs.jsonl";

/// Per-line values of a reference, or `None` if it is not a line source.
///
/// Data references yield one value per data row; output references to an
/// upstream flow node yield one value per upstream line.
pub(super) fn line_values(ctx: &NodeContext, reference: &Reference) -> Result<Option<Vec<Value>>> {
    match reference {
        Reference::Data { name, column } => {
            let rows = read_rows(ctx.data_path(name)?)?;
            Ok(Some(match column {
                None => rows,
                Some(column) => rows.iter().map(|row| field(row, column)).collect(),
            }))
        }
        Reference::NodeOutput { node, column } => {
            let Some(lines) = &ctx.upstream(node)?.lines else {
                return Ok(None);
            };
            Ok(Some(match column {
                None => lines.clone(),
                Some(column) => lines.iter().map(|line| field(line, column)).collect(),
            }))
        }
        _ => Ok(None),
    }
}

fn field(value: &Value, column: &str) -> Value {
    value.get(column).cloned().unwrap_or(Value::Null)
}

/// Read a JSON-lines data file, skipping blank lines.
fn read_rows(path: &Path) -> Result<Vec<Value>> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        Error::Validation(format!("cannot read data file {}: {e}", path.display()))
    })?;
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line).map_err(|e| {
                Error::Validation(format!("{} line {}: {e}", path.display(), n + 1))
            })
        })
        .collect()
}

/// Build the input record of every line.
///
/// Line sources must agree on length; without any the node runs one line.
pub(super) fn build_lines(node: &ExperimentNode, ctx: &NodeContext) -> Result<Vec<LineInputs>> {
    let mut constants = LineInputs::new();
    let mut sources: Vec<(&String, Vec<Value>)> = Vec::new();
    for (name, binding) in node.inputs() {
        match Reference::from_value(binding)? {
            None => {
                constants.insert(name.clone(), binding.clone());
            }
            Some(reference) => match line_values(ctx, &reference)? {
                Some(values) => sources.push((name, values)),
                None => {
                    constants.insert(name.clone(), ctx.value_of(&reference)?);
                }
            },
        }
    }

    let count = sources.first().map_or(1, |(_, values)| values.len());
    if let Some((name, values)) = sources.iter().find(|(_, values)| values.len() != count) {
        return Err(Error::Validation(format!(
            "input '{name}' has {} lines but '{}' has {count}",
            values.len(),
            sources[0].0
        )));
    }

    Ok((0..count)
        .map(|line| {
            let mut inputs = constants.clone();
            for (name, values) in &sources {
                inputs.insert((*name).clone(), values[line].clone());
            }
            inputs
        })
        .collect())
}

/// Mean of every numeric field over the given outputs.
pub(super) fn aggregate_metrics<'a>(outputs: impl Iterator<Item = &'a Value>) -> BTreeMap<String, f64> {
    let mut sums: BTreeMap<String, (f64, u32)> = BTreeMap::new();
    for output in outputs {
        let Value::Object(fields) = output else {
            continue;
        };
        for (key, value) in fields {
            if let Some(number) = value.as_f64() {
                let entry = sums.entry(key.clone()).or_default();
                entry.0 += number;
                entry.1 += 1;
            }
        }
    }
    sums.into_iter()
        .map(|(key, (sum, count))| (key, sum / f64::from(count)))
        .collect()
}

pub(super) async fn run_flow(
    node: &ExperimentNode,
    flow_node: &FlowNode,
    ctx: &NodeContext,
    run_name: &str,
    run_dir: &Path,
    parent: SpanContext,
    cancel: &CancellationToken,
) -> Result<Execution> {
    let lines = build_lines(node, ctx)?;
    let target = FlowTarget::new(flow_node.path()).with_env(node.environment_variables().clone());
    let total = lines.len();
    tracing::debug!(node = %node.name(), run = %run_name, lines = total, "dispatching lines");

    let batch = LineBatch::new(run_name, target, lines).parent(parent);
    let mut results = ctx.shared.pool.run(batch, cancel).await;

    let spans: Vec<_> = results.iter_mut().flat_map(LineResult::take_spans).collect();
    if !spans.is_empty() {
        ctx.shared.collector.add_spans(spans);
    }
    write_outputs(&run_dir.join(OUTPUTS_FILE), &results).await?;

    if cancel.is_cancelled() {
        return Err(Error::Canceled);
    }

    let failed = results.iter().filter(|r| !r.is_completed()).count();
    let lines: Vec<Value> = results
        .iter()
        .map(|r| r.output().cloned().unwrap_or(Value::Null))
        .collect();
    let metrics = if flow_node.is_evaluation() {
        aggregate_metrics(results.iter().filter_map(LineResult::output))
    } else {
        BTreeMap::new()
    };

    #[allow(clippy::cast_precision_loss)]
    let failed_ratio = if total == 0 { 0.0 } else { failed as f64 / total as f64 };
    let (status, error) = if failed_ratio > ctx.shared.config.line_error_tolerance {
        let first = results
            .iter()
            .find_map(|r| r.error().map(|e| format!(" (line {}: {})", r.line_number(), e.message)))
            .unwrap_or_default();
        (
            NodeRunStatus::Failed,
            Some(format!("{failed} of {total} lines failed{first}")),
        )
    } else {
        (NodeRunStatus::Completed, None)
    };

    Ok(Execution {
        result: NodeResult {
            status,
            output: json!({
                "output_path": run_dir.display().to_string(),
                "outputs": run_dir.join(OUTPUTS_FILE).display().to_string(),
                "lines": total,
                "failed_lines": failed,
            }),
            lines: Some(lines),
        },
        output_path: Some(run_dir.to_path_buf()),
        metrics,
        error,
    })
}

async fn write_outputs(path: &Path, results: &[LineResult]) -> Result<()> {
    let mut text = String::new();
    for result in results {
        let record = match result.status() {
            LineStatus::Completed => json!({
                "line_number": result.line_number(),
                "output": result.output(),
            }),
            _ => json!({
                "line_number": result.line_number(),
                "error": result.error().map(|e| e.message.clone()),
            }),
        };
        text.push_str(&serde_json::to_string(&record)?);
        text.push('\n');
    }
    tokio::fs::write(path, text).await?;
    Ok(())
}
