//! JSON-lines wire protocol between the pool and a worker process.
//!
//! ```text
//! worker  ──► {"type":"ready","pid":4242}
//! pool    ──► {"type":"line","run_id":"..","line_number":0,"inputs":{..}}
//! worker  ──► {"type":"result","line_number":0,"status":"Completed","output":{..},"spans":[..]}
//! pool    ──► {"type":"shutdown"}
//! ```
//!
//! stdout carries only protocol messages; worker logs go to stderr.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use super::{LineResult, LineRunner, LineTask};
use crate::Result;

/// Pool → worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    /// Execute one line
    Line(LineTask),
    /// Finish and exit
    Shutdown,
}

/// Worker → pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerResponse {
    /// Initialised and waiting for lines
    Ready {
        /// Worker process id
        pid: u32,
    },
    /// Outcome of one line
    Result(LineResult),
}

/// Encode one message as a JSON line.
///
/// # Errors
/// Returns error if the message cannot be serialized
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    Ok(line)
}

/// Worker-side loop: announce readiness, then answer line requests until
/// shutdown or end of input. Returns the number of lines served.
///
/// Malformed requests are logged and skipped.
///
/// # Errors
/// Returns error if reading requests or writing responses fails
pub async fn serve<R, W>(runner: &LineRunner, reader: R, mut writer: W) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(&encode(&WorkerResponse::Ready {
            pid: std::process::id(),
        })?)
        .await?;
    writer.flush().await?;

    let mut served = 0;
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request: WorkerRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed worker request");
                continue;
            }
        };
        match request {
            WorkerRequest::Shutdown => break,
            WorkerRequest::Line(task) => {
                tracing::debug!(run = %task.run_id, line_number = task.line_number, "serving line");
                let result = runner.run(&task).await;
                writer
                    .write_all(&encode(&WorkerResponse::Result(result))?)
                    .await?;
                writer.flush().await?;
                served += 1;
            }
        }
    }
    tracing::debug!(served, "worker loop finished");
    Ok(served)
}
