//! `flowrun-worker`: isolated worker process for the worker pool.
//!
//! Speaks the JSON-lines worker protocol on stdin/stdout and logs to stderr
//! (`RUST_LOG` sets the filter). Lines run through a built-in echo executor:
//! the output is the input record minus control keys, and control keys make
//! the line misbehave on purpose.
//!
//! | Key          | Effect                                               |
//! |--------------|------------------------------------------------------|
//! | `__sleep_ms` | sleep before answering                               |
//! | `__fail`     | fail the line with the given message                 |
//! | `__panic`    | panic (the worker process dies)                      |
//! | `__exit`     | exit the process with the given code                 |
//! | `__tool`     | call the `nonce` tool; its result lands in `"tool"`  |
//! | `__env`      | copy an environment variable into `"env"`            |

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

use flowrun::pool::{serve, FlowTarget, LineContext, LineExecutor, LineInputs, LineRunner, ENV_FLOW_PATH};
use flowrun::recorder::{CallRecorder, RecorderConfig, RecordingMode, Tool, ToolArgs};
use flowrun::{Error, Result};

/// Tool returning a fresh random id on every live call, so replays are
/// distinguishable from live calls.
struct NonceTool;

#[async_trait]
impl Tool for NonceTool {
    fn name(&self) -> &str {
        "nonce"
    }

    async fn invoke(&self, args: &ToolArgs) -> Result<Value> {
        Ok(json!({
            "nonce": uuid::Uuid::new_v4().to_string(),
            "args": args.positional(),
        }))
    }
}

struct EchoExecutor;

#[async_trait]
impl LineExecutor for EchoExecutor {
    async fn execute_line(&self, ctx: &LineContext, inputs: &LineInputs) -> Result<Value> {
        if let Some(ms) = inputs.get("__sleep_ms").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        if let Some(message) = inputs.get("__fail") {
            return Err(Error::Other(render(message)));
        }
        if let Some(message) = inputs.get("__panic") {
            panic!("{}", render(message));
        }
        if let Some(code) = inputs.get("__exit").and_then(Value::as_i64) {
            std::process::exit(i32::try_from(code).unwrap_or(1));
        }

        let mut output: serde_json::Map<String, Value> = inputs
            .iter()
            .filter(|(key, _)| !key.starts_with("__"))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        if let Some(arg) = inputs.get("__tool") {
            let args = ToolArgs::new().arg(arg.clone());
            output.insert("tool".to_string(), ctx.invoke_tool(&NonceTool, &args).await?);
        }
        if let Some(name) = inputs.get("__env").and_then(Value::as_str) {
            output.insert("env".to_string(), json!(ctx.env_var(name)));
        }
        Ok(Value::Object(output))
    }
}

fn render(value: &Value) -> String {
    value
        .as_str()
        .map_or_else(|| value.to_string(), ToString::to_string)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let config = RecorderConfig::from_env().context("invalid recorder environment")?;
    let recorder = match config.mode() {
        RecordingMode::Live => None,
        _ => Some(Arc::new(
            CallRecorder::open(config).context("failed to open call store")?,
        )),
    };
    let flow_path = std::env::var_os(ENV_FLOW_PATH).map_or_else(|| PathBuf::from("."), PathBuf::from);
    tracing::debug!(pid = std::process::id(), flow = %flow_path.display(), "worker starting");

    let runner = LineRunner::new(Arc::new(EchoExecutor), FlowTarget::new(&flow_path))
        .recorder(recorder.clone());
    let served = serve(&runner, BufReader::new(tokio::io::stdin()), tokio::io::stdout())
        .await
        .context("worker protocol failed")?;

    if let Some(recorder) = recorder {
        recorder.close().context("failed to close call store")?;
    }
    tracing::debug!(served, "worker exiting");
    Ok(())
}
