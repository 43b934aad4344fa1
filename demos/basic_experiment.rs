//! Basic Experiment: main flow, evaluation flow, report command
//!
//! This demo builds a three-node experiment over a small question set:
//! - `main` answers every question (one line per data row)
//! - `eval` scores the answers and yields metrics
//! - `report` is a shell command that runs only when `eval` completed
//!
//! Flow lines run in-process; swap in `EngineContext::process_launcher` to
//! isolate them in `flowrun-worker` processes.
//!
//! Run with: cargo run --example basic_experiment

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use flowrun::context::EngineContext;
use flowrun::controller::{ControllerConfig, ExperimentController};
use flowrun::experiment::{
    ActivateCondition, CommandNode, Experiment, ExperimentData, ExperimentInput, FlowNode, InputType,
};
use flowrun::pool::{LineContext, LineExecutor, LineInputs, PoolConfig, WorkerPool};
use flowrun::scheduler::SchedulerConfig;

/// Answers with the upper-cased question, or scores an answer when given
/// an `expected` value.
struct DemoFlow;

#[async_trait]
impl LineExecutor for DemoFlow {
    async fn execute_line(&self, ctx: &LineContext, inputs: &LineInputs) -> flowrun::Result<Value> {
        let mut span = ctx.start_span("demo step");
        let output = match (inputs.get("answer"), inputs.get("expected")) {
            (Some(answer), Some(expected)) => {
                let correct = answer.as_str().map(str::to_lowercase) == expected.as_str().map(str::to_lowercase);
                json!({ "accuracy": if correct { 1.0 } else { 0.0 } })
            }
            _ => {
                let question = inputs.get("question").and_then(Value::as_str).unwrap_or_default();
                let prefix = inputs.get("prefix").and_then(Value::as_str).unwrap_or_default();
                json!({ "answer": format!("{prefix}{}", question.to_uppercase()) })
            }
        };
        span.set_attribute("line_number", json!(ctx.line_number()));
        span.finish();
        Ok(output)
    }
}

#[tokio::main]
async fn main() -> flowrun::Result<()> {
    println!("=== Flowrun: Basic Experiment ===\n");

    let workdir = std::env::temp_dir().join(format!("flowrun-demo-{}", std::process::id()));
    std::fs::create_dir_all(&workdir)?;
    let data_path = workdir.join("questions.jsonl");
    std::fs::write(
        &data_path,
        "{\"question\": \"ping\", \"expected\": \"PING\"}\n\
         {\"question\": \"pong\", \"expected\": \"PONG\"}\n\
         {\"question\": \"rust\", \"expected\": \"ferris\"}\n",
    )?;

    let context = EngineContext::builder()
        .span_log(workdir.join("spans.jsonl"))
        .build()?;
    let pool = WorkerPool::new(
        PoolConfig::builder().worker_count(2).build(),
        Arc::new(context.in_process_launcher(Arc::new(DemoFlow))),
    );
    let controller = ExperimentController::new(
        ControllerConfig::builder().output_root(workdir.join("runs")).build(),
        context.scheduler(SchedulerConfig::default(), pool),
    )?;

    let experiment = Experiment::builder("qa")
        .description("answer and score a question set")
        .data(ExperimentData::new("questions", &data_path))
        .input(ExperimentInput::new("prefix", InputType::String, json!(""))?)
        .node(
            FlowNode::new("main", "flows/answer")
                .input("question", json!("${data.questions.question}"))
                .input("prefix", json!("${inputs.prefix}")),
        )
        .node(
            FlowNode::new("eval", "flows/score")
                .input("answer", json!("${main.outputs.answer}"))
                .input("expected", json!("${data.questions.expected}"))
                .evaluation(true),
        )
        .node(
            CommandNode::new("report", "echo scored run at ${eval.outputs.output_path}")
                .activate(ActivateCondition::new("${eval.status}", json!("Completed"))),
        )
        .build();

    controller.create_or_update(experiment).await?;
    controller.start("qa").await?;
    let finished = controller.wait("qa").await?;

    println!("Experiment status: {}", finished.status());
    if let Some(outcome) = finished.last_run_status() {
        println!("Last run outcome:  {outcome}");
    }
    println!("\nNode runs:");
    for (node, runs) in finished.node_runs() {
        for run in runs {
            println!("  {node:<8} {:<10} {}", run.status().as_str(), run.name());
            for metric in controller.get_metrics(run.name()).await {
                println!("           {} = {:.3}", metric.key(), metric.value());
            }
        }
    }

    context.shutdown()?;
    println!("\nSpans written to {}", workdir.join("spans.jsonl").display());
    Ok(())
}
