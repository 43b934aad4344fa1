//! Experiment controller integration tests
//!
//! Lifecycle: NotStarted → Queuing → InProgress → Terminated, with the
//! outcome of each run kept in `last_run_status`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};

use flowrun::controller::{ControllerConfig, ExperimentController};
use flowrun::experiment::{
    CommandNode, Experiment, ExperimentData, ExperimentInput, ExperimentStatus,
    ExperimentTemplate, FlowNode, InputType, NodeRunStatus,
};
use flowrun::pool::{InProcessLauncher, LineContext, LineExecutor, LineInputs, PoolConfig, WorkerPool};
use flowrun::scheduler::{DagScheduler, SchedulerConfig};
use flowrun::trace::TraceCollector;
use flowrun::ErrorKind;

/// `slow` sleeps, `score` yields an accuracy, everything else echoes.
struct Flows;

#[async_trait]
impl LineExecutor for Flows {
    async fn execute_line(&self, ctx: &LineContext, inputs: &LineInputs) -> flowrun::Result<Value> {
        let flow = ctx
            .flow_path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match flow.as_str() {
            "slow" => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(Value::Null)
            }
            "score" => Ok(json!({ "accuracy": inputs.get("x").and_then(Value::as_f64).unwrap_or_default() })),
            _ => Ok(Value::Object(inputs.clone())),
        }
    }
}

fn controller(config: ControllerConfig) -> ExperimentController {
    let pool = WorkerPool::new(
        PoolConfig::builder().worker_count(2).build(),
        Arc::new(InProcessLauncher::new(Arc::new(Flows))),
    );
    let scheduler = DagScheduler::new(
        SchedulerConfig::default(),
        pool,
        Arc::new(TraceCollector::new()),
    );
    ExperimentController::new(config, scheduler).unwrap()
}

fn quick(name: &str) -> Experiment {
    Experiment::builder(name)
        .node(FlowNode::new("main", "flows/echo").input("x", json!(1)))
        .build()
}

fn slow(name: &str) -> Experiment {
    Experiment::builder(name)
        .node(FlowNode::new("main", "flows/slow"))
        .node(FlowNode::new("after", "flows/echo").input("x", json!("${main.outputs}")))
        .build()
}

#[tokio::test]
async fn test_run_to_termination() {
    let dir = tempfile::tempdir().unwrap();
    let controller = controller(ControllerConfig::builder().output_root(dir.path()).build());

    let created = controller.create_or_update(quick("exp")).await.unwrap();
    assert_eq!(created.status(), ExperimentStatus::NotStarted);
    assert_eq!(created.output_dir(), Some(dir.path().join("exp").as_path()));

    let queued = controller.start("exp").await.unwrap();
    assert_eq!(queued.status(), ExperimentStatus::Queuing);
    assert!(queued.last_start_time().is_some());

    let finished = controller.wait("exp").await.unwrap();
    assert_eq!(finished.status(), ExperimentStatus::Terminated);
    assert_eq!(finished.last_run_status(), Some(ExperimentStatus::Completed));
    assert!(finished.last_end_time().is_some());
    assert_eq!(finished.runs_of("main").len(), 1);
    assert_eq!(finished.runs_of("main")[0].status(), NodeRunStatus::Completed);
    assert!(!controller.is_running("exp"));
}

#[tokio::test]
async fn test_start_twice_is_invalid_state() {
    let dir = tempfile::tempdir().unwrap();
    let controller = controller(ControllerConfig::builder().output_root(dir.path()).build());
    controller.create_or_update(slow("exp")).await.unwrap();

    controller.start("exp").await.unwrap();
    let err = controller.start("exp").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    let message = err.to_string();
    assert!(
        message == "Experiment exp is Queuing" || message == "Experiment exp is InProgress",
        "unexpected message: {message}"
    );

    let err = controller.create_or_update(slow("exp")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    controller.stop("exp").await.unwrap();
}

#[tokio::test]
async fn test_stop_cancels_in_flight_nodes() {
    let dir = tempfile::tempdir().unwrap();
    let controller = controller(ControllerConfig::builder().output_root(dir.path()).build());
    controller.create_or_update(slow("exp")).await.unwrap();
    controller.start("exp").await.unwrap();

    // Let the slow node get dispatched.
    let deadline = Instant::now() + Duration::from_secs(5);
    while controller.get("exp").await.unwrap().runs_of("main").is_empty() {
        assert!(Instant::now() < deadline, "main was never dispatched");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let started = Instant::now();
    let stopped = controller.stop("exp").await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(stopped.status(), ExperimentStatus::Terminated);
    assert_eq!(stopped.last_run_status(), Some(ExperimentStatus::Canceled));
    assert_eq!(stopped.runs_of("main")[0].status(), NodeRunStatus::Canceled);
    assert!(stopped.runs_of("after").is_empty());
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let controller = controller(ControllerConfig::builder().output_root(dir.path()).build());
    controller.create_or_update(quick("exp")).await.unwrap();

    let untouched = controller.stop("exp").await.unwrap();
    assert_eq!(untouched.status(), ExperimentStatus::NotStarted);

    controller.start("exp").await.unwrap();
    controller.wait("exp").await.unwrap();
    let first = controller.stop("exp").await.unwrap();
    let second = controller.stop("exp").await.unwrap();
    assert_eq!(first, second);

    assert_eq!(
        controller.stop("missing").await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
}

#[tokio::test]
async fn test_restart_appends_node_runs() {
    let dir = tempfile::tempdir().unwrap();
    let controller = controller(ControllerConfig::builder().output_root(dir.path()).build());
    controller.create_or_update(quick("exp")).await.unwrap();

    controller.start("exp").await.unwrap();
    let first = controller.wait("exp").await.unwrap();
    controller.start("exp").await.unwrap();
    let second = controller.wait("exp").await.unwrap();

    let runs = second.runs_of("main");
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0], first.runs_of("main")[0]);
    assert_ne!(runs[0].name(), runs[1].name());
}

#[tokio::test]
async fn test_update_keeps_history() {
    let dir = tempfile::tempdir().unwrap();
    let controller = controller(ControllerConfig::builder().output_root(dir.path()).build());
    controller.create_or_update(quick("exp")).await.unwrap();
    controller.start("exp").await.unwrap();
    controller.wait("exp").await.unwrap();

    let updated = Experiment::builder("exp")
        .description("second version")
        .node(FlowNode::new("main", "flows/echo").input("x", json!(2)))
        .build();
    let saved = controller.create_or_update(updated).await.unwrap();
    assert_eq!(saved.description(), Some("second version"));
    assert_eq!(saved.runs_of("main").len(), 1);
    assert_eq!(saved.status(), ExperimentStatus::Terminated);
}

#[tokio::test]
async fn test_get_metrics_of_evaluation_run() {
    let dir = tempfile::tempdir().unwrap();
    let data_path = dir.path().join("d.jsonl");
    std::fs::write(&data_path, "{\"x\": 0.25}\n{\"x\": 0.75}\n").unwrap();
    let controller = controller(ControllerConfig::builder().output_root(dir.path()).build());
    controller
        .create_or_update(
            Experiment::builder("eval")
                .data(ExperimentData::new("d", &data_path))
                .node(
                    FlowNode::new("score", "flows/score")
                        .input("x", json!("${data.d.x}"))
                        .evaluation(true),
                )
                .build(),
        )
        .await
        .unwrap();
    controller.start("eval").await.unwrap();
    let finished = controller.wait("eval").await.unwrap();

    let run = &finished.runs_of("score")[0];
    let metrics = controller.get_metrics(run.name()).await;
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].key(), "accuracy");
    assert!((metrics[0].value() - 0.5).abs() < 1e-9);
    assert!(controller.get_metrics("no-such-run").await.is_empty());
}

#[tokio::test]
async fn test_invalid_definitions_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let controller = controller(ControllerConfig::builder().output_root(dir.path()).build());

    let bad = Experiment::builder("bad")
        .node(FlowNode::new("a", "flows/echo").input("x", json!("${ghost.outputs}")))
        .build();
    let err = controller.create_or_update(bad).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(controller.get("bad").await.unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(controller.start("bad").await.unwrap_err().kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_template_snapshots_are_run() {
    let dir = tempfile::tempdir().unwrap();
    let code = dir.path().join("scripts");
    std::fs::create_dir_all(&code).unwrap();
    std::fs::write(code.join("hello.sh"), "echo from snapshot\n").unwrap();

    let template = ExperimentTemplate {
        name: "tpl".to_string(),
        description: Some("materialized".to_string()),
        nodes: vec![CommandNode::new("hello", "sh hello.sh").code(&code).into()],
        data: Vec::new(),
        inputs: Vec::new(),
    };
    let experiment = Experiment::from_template(template, dir.path().join("out")).unwrap();
    let controller = controller(ControllerConfig::builder().output_root(dir.path().join("out")).build());
    controller.create_or_update(experiment).await.unwrap();
    controller.start("tpl").await.unwrap();
    let finished = controller.wait("tpl").await.unwrap();

    let run = &finished.runs_of("hello")[0];
    assert_eq!(run.status(), NodeRunStatus::Completed);
    let stdout = std::fs::read_to_string(run.output_path().unwrap().join("stdout.log")).unwrap();
    assert_eq!(stdout.trim(), "from snapshot");
    assert!(run.output_path().unwrap().starts_with(dir.path().join("out/tpl")));
}

#[tokio::test]
async fn test_template_inputs_reach_lines_typed() {
    let dir = tempfile::tempdir().unwrap();
    let flow = dir.path().join("flows/echo");
    std::fs::create_dir_all(&flow).unwrap();
    let template = ExperimentTemplate {
        name: "typed".to_string(),
        description: None,
        nodes: vec![FlowNode::new("main", &flow).input("n", json!("${inputs.n}")).into()],
        data: Vec::new(),
        inputs: vec![ExperimentInput {
            name: "n".to_string(),
            input_type: InputType::Int,
            default: json!("2"),
        }],
    };
    let out = dir.path().join("out");
    let controller = controller(ControllerConfig::builder().output_root(&out).build());
    controller
        .create_or_update(Experiment::from_template(template, &out).unwrap())
        .await
        .unwrap();
    controller.start("typed").await.unwrap();
    let finished = controller.wait("typed").await.unwrap();

    let run = &finished.runs_of("main")[0];
    assert_eq!(run.status(), NodeRunStatus::Completed);
    let line: Value = serde_json::from_str(
        std::fs::read_to_string(run.output_path().unwrap().join("outputs.jsonl"))
            .unwrap()
            .lines()
            .next()
            .unwrap(),
    )
    .unwrap();
    assert_eq!(line["output"], json!({ "n": 2 }));
}

#[tokio::test]
async fn test_experiments_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = ControllerConfig::builder()
        .output_root(dir.path().join("runs"))
        .persist_dir(dir.path().join("store"))
        .build();

    {
        let controller = controller(config.clone());
        controller.create_or_update(quick("kept")).await.unwrap();
        controller.start("kept").await.unwrap();
        controller.wait("kept").await.unwrap();
    }

    let reopened = controller(config);
    let kept = reopened.get("kept").await.unwrap();
    assert_eq!(kept.status(), ExperimentStatus::Terminated);
    assert_eq!(kept.runs_of("main").len(), 1);
    assert_eq!(reopened.list().await.len(), 1);
}

#[tokio::test]
async fn test_stop_all() {
    let dir = tempfile::tempdir().unwrap();
    let controller = controller(ControllerConfig::builder().output_root(dir.path()).build());
    controller.create_or_update(slow("a")).await.unwrap();
    controller.create_or_update(slow("b")).await.unwrap();
    controller.start("a").await.unwrap();
    controller.start("b").await.unwrap();

    controller.stop_all().await;
    for name in ["a", "b"] {
        let experiment = controller.get(name).await.unwrap();
        assert_eq!(experiment.status(), ExperimentStatus::Terminated);
        assert!(!controller.is_running(name));
    }
}
