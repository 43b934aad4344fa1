//! Experiment Schema Tests
//!
//! Covers the persisted shape of experiments, node runs and metrics, and
//! template materialization into snapshots.

use std::collections::BTreeMap;

use serde_json::json;

use flowrun::experiment::{
    ActivateCondition, CommandNode, Experiment, ExperimentData, ExperimentInput, ExperimentNode,
    ExperimentStatus, ExperimentStore, ExperimentTemplate, FlowNode, InputType, MetricRecord,
    NodeRun, NodeRunStatus,
};
use flowrun::ErrorKind;

// =============================================================================
// Experiment Tests
// =============================================================================

#[test]
fn test_experiment_creation() {
    let experiment = Experiment::new("exp-001");

    assert_eq!(experiment.name(), "exp-001");
    assert_eq!(experiment.status(), ExperimentStatus::NotStarted);
    assert!(experiment.last_run_status().is_none());
    assert!(experiment.node_runs().is_empty());
    assert!(experiment.created_on().timestamp() > 0);
    assert!(experiment.last_start_time().is_none());
}

#[test]
fn test_experiment_builder() {
    let experiment = Experiment::builder("exp-002")
        .description("nightly eval")
        .data(ExperimentData::new("qa", "data/qa.jsonl"))
        .input(ExperimentInput::new("count", InputType::Int, json!("1")).unwrap())
        .node(FlowNode::new("main", "flows/main").input("q", json!("${data.qa.question}")))
        .node(CommandNode::new("report", "echo ${main.outputs}"))
        .build();

    assert_eq!(experiment.description(), Some("nightly eval"));
    assert_eq!(experiment.nodes().len(), 2);
    assert!(experiment.node("main").unwrap().is_flow());
    assert!(!experiment.node("report").unwrap().is_flow());
    assert_eq!(experiment.input_values()["count"], json!(1));
    assert_eq!(
        experiment.data_paths()["qa"],
        std::path::PathBuf::from("data/qa.jsonl")
    );
}

#[test]
fn test_experiment_serialization() {
    let experiment = Experiment::builder("exp-003")
        .node(
            FlowNode::new("eval", "flows/eval")
                .evaluation(true)
                .env("MODEL", "small")
                .activate(ActivateCondition::new("${inputs.enabled}", json!(true))),
        )
        .input(ExperimentInput::new("enabled", InputType::Bool, json!(true)).unwrap())
        .build();

    let json = serde_json::to_string(&experiment).expect("serialization failed");
    let deserialized: Experiment = serde_json::from_str(&json).expect("deserialization failed");
    assert_eq!(experiment, deserialized);
}

#[test]
fn test_node_definition_wire_shape() {
    let node: ExperimentNode = serde_json::from_value(json!({
        "type": "command",
        "name": "report",
        "command": "echo ${inputs.title} > ${outputs.page}",
        "inputs": {"title": "${main.outputs.title}"},
        "outputs": ["page"]
    }))
    .unwrap();

    assert_eq!(node.name(), "report");
    assert!(!node.is_flow());
    assert_eq!(
        node.dependencies().unwrap().into_iter().collect::<Vec<_>>(),
        vec!["main".to_string()]
    );
}

#[test]
fn test_status_display_names() {
    assert_eq!(ExperimentStatus::InProgress.to_string(), "InProgress");
    assert_eq!(ExperimentStatus::Terminated.as_str(), "Terminated");
    assert!(ExperimentStatus::Queuing.is_active());
    assert!(!ExperimentStatus::Terminated.is_active());
    assert_eq!(NodeRunStatus::Canceled.to_string(), "Canceled");
}

// =============================================================================
// Input Tests
// =============================================================================

#[test]
fn test_input_defaults_are_coerced() {
    let int = ExperimentInput::new("n", InputType::Int, json!("1")).unwrap();
    assert_eq!(int.default, json!(1));

    let float = ExperimentInput::new("t", InputType::Float, json!("0.5")).unwrap();
    assert_eq!(float.default, json!(0.5));

    let flag = ExperimentInput::new("f", InputType::Bool, json!("TRUE")).unwrap();
    assert_eq!(flag.default, json!(true));

    let list = ExperimentInput::new("l", InputType::List, json!("[1, 2]")).unwrap();
    assert_eq!(list.default, json!([1, 2]));
}

#[test]
fn test_input_default_must_fit_type() {
    let err = ExperimentInput::new("n", InputType::Int, json!("one")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(err.to_string().contains("input 'n'"));
}

// =============================================================================
// NodeRun Tests
// =============================================================================

#[test]
fn test_node_run_creation() {
    let run = NodeRun::new("exp", "main");

    assert!(run.name().starts_with("exp_main_"));
    assert_eq!(run.name().len(), "exp_main_".len() + 8);
    assert_eq!(run.experiment(), "exp");
    assert_eq!(run.node(), "main");
    assert_eq!(run.status(), NodeRunStatus::Queued);
    assert!(run.started_at().is_none());
    assert!(run.ended_at().is_none());
}

#[test]
fn test_node_run_names_are_unique() {
    let a = NodeRun::new("exp", "main");
    let b = NodeRun::new("exp", "main");
    assert_ne!(a.name(), b.name());
}

#[test]
fn test_node_run_lifecycle() {
    let mut run = NodeRun::builder("exp_eval_00000001", "exp", "eval")
        .output_path("/tmp/out")
        .build();
    run.start();
    assert_eq!(run.status(), NodeRunStatus::Running);
    run.record_attempt();
    run.set_metrics(BTreeMap::from([("accuracy".to_string(), 0.75)]));
    run.complete(NodeRunStatus::Completed);

    assert_eq!(run.status(), NodeRunStatus::Completed);
    assert_eq!(run.attempts(), 1);
    assert!(run.ended_at().unwrap() >= run.started_at().unwrap());
    assert_eq!(run.output_path(), Some(std::path::Path::new("/tmp/out")));
    assert!((run.metrics()["accuracy"] - 0.75).abs() < f64::EPSILON);
}

#[test]
fn test_node_run_error() {
    let mut run = NodeRun::new("exp", "main");
    run.start();
    run.set_error("upstream node 'a' failed");
    run.complete(NodeRunStatus::Failed);

    assert_eq!(run.status(), NodeRunStatus::Failed);
    assert_eq!(run.error(), Some("upstream node 'a' failed"));
}

// =============================================================================
// MetricRecord Tests
// =============================================================================

fn evaluated_run(metrics: &[(&str, f64)]) -> NodeRun {
    let mut run = NodeRun::new("exp", "eval");
    run.start();
    run.set_metrics(metrics.iter().map(|(k, v)| ((*k).to_string(), *v)).collect());
    run.complete(NodeRunStatus::Completed);
    run
}

#[test]
fn test_metric_records_come_from_run() {
    let run = evaluated_run(&[("accuracy", 0.95)]);
    let metrics = MetricRecord::from_run(&run);

    assert_eq!(metrics.len(), 1);
    let metric = &metrics[0];
    assert_eq!(metric.run_name(), run.name());
    assert_eq!((metric.experiment(), metric.node()), ("exp", "eval"));
    assert_eq!(metric.key(), "accuracy");
    assert!((metric.value() - 0.95).abs() < f64::EPSILON);
    assert_eq!(Some(metric.recorded_at()), run.ended_at());
}

#[test]
fn test_metric_record_serialization() {
    let metric = MetricRecord::from_run(&evaluated_run(&[("loss", 0.1)])).remove(0);
    let json = serde_json::to_string(&metric).expect("serialization failed");
    assert!(json.contains("\"node\":\"eval\""));
    let deserialized: MetricRecord = serde_json::from_str(&json).expect("deserialization failed");
    assert_eq!(metric, deserialized);
}

// =============================================================================
// ExperimentStore Tests
// =============================================================================

#[test]
fn test_store_metrics_are_scoped_to_run() {
    let mut store = ExperimentStore::new();
    store.upsert(Experiment::new("exp")).unwrap();
    let a = evaluated_run(&[("accuracy", 0.5)]);
    let b = evaluated_run(&[("accuracy", 0.9)]);
    for metric in MetricRecord::from_run(&a).into_iter().chain(MetricRecord::from_run(&b)) {
        store.add_metric(metric);
    }

    assert_eq!(store.get_metrics_for_run(a.name()).len(), 1);
    assert!(store.get_metrics_for_run("run-c").is_empty());
}

#[test]
fn test_store_update_missing_experiment() {
    let mut store = ExperimentStore::new();
    let err = store.update("ghost", |_| ()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

// =============================================================================
// Template Materialization Tests
// =============================================================================

#[test]
fn test_from_template_snapshots_sources() {
    let dir = tempfile::tempdir().unwrap();
    let flow_dir = dir.path().join("flows/main");
    std::fs::create_dir_all(flow_dir.join("nested")).unwrap();
    std::fs::write(flow_dir.join("flow.dag.yaml"), "nodes: []").unwrap();
    std::fs::write(flow_dir.join("nested/tool.py"), "print(1)").unwrap();

    let template = ExperimentTemplate {
        name: "snap".to_string(),
        description: None,
        nodes: vec![
            FlowNode::new("main", &flow_dir).into(),
            CommandNode::new("report", "echo done").into(),
        ],
        data: Vec::new(),
        inputs: Vec::new(),
    };
    let experiment = Experiment::from_template(template, dir.path().join("out")).unwrap();

    let snapshots = dir.path().join("out/snap/snapshots");
    assert_eq!(experiment.output_dir(), Some(dir.path().join("out/snap").as_path()));
    assert!(snapshots.join("main/flow.dag.yaml").exists());
    assert!(snapshots.join("main/nested/tool.py").exists());
    assert!(snapshots.join("report").is_dir());
    assert_eq!(
        experiment.node("main").unwrap().source_dir(),
        Some(snapshots.join("main").as_path())
    );
}

#[test]
fn test_from_template_rejects_missing_source_and_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let missing = ExperimentTemplate {
        name: "missing".to_string(),
        description: None,
        nodes: vec![FlowNode::new("main", dir.path().join("nope")).into()],
        data: Vec::new(),
        inputs: Vec::new(),
    };
    let err = Experiment::from_template(missing, dir.path()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let duplicate = ExperimentTemplate {
        name: "dup".to_string(),
        description: None,
        nodes: vec![
            CommandNode::new("a", "true").into(),
            CommandNode::new("a", "false").into(),
        ],
        data: Vec::new(),
        inputs: Vec::new(),
    };
    let err = Experiment::from_template(duplicate, dir.path()).unwrap_err();
    assert!(err.to_string().contains("duplicate node name 'a'"));
}

#[test]
fn test_from_template_resolves_loaded_input_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let template: ExperimentTemplate = serde_json::from_value(json!({
        "name": "typed",
        "inputs": [
            {"name": "count", "type": "int", "default": "5"},
            {"name": "ratio", "type": "float", "default": "0.5"},
            {"name": "strict", "type": "bool", "default": "True"},
            {"name": "tags", "type": "list", "default": "[\"a\", \"b\"]"},
            {"name": "label", "type": "string", "default": 7}
        ]
    }))
    .unwrap();
    assert_eq!(template.inputs[0].default, json!("5"));

    let experiment = Experiment::from_template(template, dir.path()).unwrap();
    let defaults: Vec<_> = experiment.inputs().iter().map(|i| i.default.clone()).collect();
    assert_eq!(
        defaults,
        vec![json!(5), json!(0.5), json!(true), json!(["a", "b"]), json!("7")]
    );
    assert_eq!(experiment.input_values()["count"], json!(5));
}

#[test]
fn test_from_template_rejects_misfit_default() {
    let dir = tempfile::tempdir().unwrap();
    let template = ExperimentTemplate {
        name: "misfit".to_string(),
        description: None,
        nodes: vec![CommandNode::new("a", "true").into()],
        data: Vec::new(),
        inputs: vec![ExperimentInput {
            name: "count".to_string(),
            input_type: InputType::Int,
            default: json!("abc"),
        }],
    };

    let err = Experiment::from_template(template, dir.path()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(err.to_string().contains("input 'count'"));
    assert!(!dir.path().join("misfit").exists());
}
