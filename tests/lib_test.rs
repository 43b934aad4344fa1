//! Tests for the top-level engine API

use std::sync::Arc;

use flowrun::context::EngineContext;
use flowrun::recorder::{RecorderConfig, RecordingMode};
use flowrun::trace::TraceCollector;
use flowrun::ErrorKind;

#[test]
fn test_engine_context_builder() {
    let context = EngineContext::builder().build().unwrap();
    assert_eq!(context.recorder().mode(), RecordingMode::Live);
    assert!(context.recorder().store().is_none());
}

#[test]
fn test_engine_context_global_collector_is_shared() {
    let a = EngineContext::builder().global_collector().build().unwrap();
    let b = EngineContext::builder().global_collector().build().unwrap();
    assert!(Arc::ptr_eq(a.collector(), b.collector()));
    assert!(Arc::ptr_eq(a.collector(), &TraceCollector::global()));
}

#[test]
fn test_engine_context_with_record_mode_opens_store() {
    let dir = tempfile::tempdir().unwrap();
    let config = RecorderConfig::builder()
        .mode(RecordingMode::Record)
        .path(dir.path().join("calls.jsonl"))
        .build();
    let context = EngineContext::builder().recorder(config).build().unwrap();

    assert_eq!(context.recorder().mode(), RecordingMode::Record);
    assert!(dir.path().join("calls.jsonl").exists());
    context.shutdown().unwrap();
}

#[test]
fn test_engine_context_replay_without_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = RecorderConfig::builder()
        .mode(RecordingMode::Replay)
        .path(dir.path().join("missing.jsonl"))
        .build();
    let err = EngineContext::builder().recorder(config).build().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn test_process_launcher_inherits_recording_mode() {
    let dir = tempfile::tempdir().unwrap();
    let config = RecorderConfig::builder()
        .mode(RecordingMode::Record)
        .path(dir.path().join("calls.jsonl"))
        .build();
    let context = EngineContext::builder().recorder(config.clone()).build().unwrap();
    let env = context.recorder().config().to_env();
    assert_eq!(env, config.to_env());
    let _launcher = context.process_launcher("flowrun-worker");
}
