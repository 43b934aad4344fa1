//! Call Recorder/Replayer - deterministic outbound calls for tests
//!
//! Toyota Way: Standardized work. The same workload replays byte-for-byte
//! without touching the network.
//!
//! ## Modes
//!
//! - [`RecordingMode::Live`]: calls go straight to the tool
//! - [`RecordingMode::Record`]: calls run live, then `(key, result)` is appended
//! - [`RecordingMode::Replay`]: calls are answered from the store; a miss is
//!   [`Error::RecordNotFound`], never a live call
//!
//! Repeated identical calls inside one [`RecordingSession`] get increasing
//! occurrence indexes, so the Nth call replays the Nth recorded result.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use serde_json::{json, Value};
//! use flowrun::recorder::{CallRecorder, RecorderConfig, RecordingMode, Tool, ToolArgs};
//!
//! struct Upper;
//!
//! #[async_trait]
//! impl Tool for Upper {
//!     fn name(&self) -> &str {
//!         "upper"
//!     }
//!     async fn invoke(&self, args: &ToolArgs) -> flowrun::Result<Value> {
//!         let text = args.get(0).and_then(Value::as_str).unwrap_or_default();
//!         Ok(json!(text.to_uppercase()))
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> flowrun::Result<()> {
//! let dir = tempfile::tempdir()?;
//! let file = dir.path().join("calls.jsonl");
//!
//! let recorder = Arc::new(CallRecorder::open(
//!     RecorderConfig::builder().mode(RecordingMode::Record).path(&file).build(),
//! )?);
//! let session = recorder.session("line-0");
//! let live = session.invoke(&Upper, &ToolArgs::new().arg(json!("hi"))).await?;
//! recorder.close()?;
//!
//! let replayer = Arc::new(CallRecorder::open(
//!     RecorderConfig::builder().mode(RecordingMode::Replay).path(&file).build(),
//! )?);
//! let replayed = replayer
//!     .session("line-0")
//!     .invoke(&Upper, &ToolArgs::new().arg(json!("hi")))
//!     .await?;
//! assert_eq!(live, replayed);
//! # Ok(())
//! # }
//! ```

mod key;
mod lock;
mod store;

pub use key::{CallSignature, KEY_ALGORITHM};
pub use lock::{LockFile, LockGuard, DEFAULT_LOCK_TIMEOUT, DEFAULT_STALE_AFTER};
pub use store::{CallRecord, RecordStore, RecordedResult};

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// Environment variable selecting the recording mode.
pub const ENV_RECORDING_MODE: &str = "FLOWRUN_RECORDING_MODE";

/// Environment variable naming the call store file.
pub const ENV_RECORDING_FILE: &str = "FLOWRUN_RECORDING_FILE";

/// How instrumented calls are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingMode {
    /// Pass through
    #[default]
    Live,
    /// Execute live and capture
    Record,
    /// Answer from the store only
    Replay,
}

impl RecordingMode {
    /// Lowercase name, as accepted by [`FromStr`].
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Record => "record",
            Self::Replay => "replay",
        }
    }
}

impl fmt::Display for RecordingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordingMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "live" => Ok(Self::Live),
            "record" | "recording" => Ok(Self::Record),
            "replay" | "replaying" => Ok(Self::Replay),
            other => Err(Error::Validation(format!(
                "unknown recording mode '{other}' (expected live, record or replay)"
            ))),
        }
    }
}

/// Recorder configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecorderConfig {
    mode: RecordingMode,
    path: Option<PathBuf>,
    lock_timeout: Duration,
    stale_after: Duration,
}

impl RecorderConfig {
    /// Create a configuration builder.
    #[must_use]
    pub fn builder() -> RecorderConfigBuilder {
        RecorderConfigBuilder::default()
    }

    /// Read `FLOWRUN_RECORDING_MODE` and `FLOWRUN_RECORDING_FILE`.
    ///
    /// Unset mode means [`RecordingMode::Live`].
    ///
    /// # Errors
    /// Returns [`Error::Validation`] for an unknown mode
    pub fn from_env() -> Result<Self> {
        let mode = std::env::var(ENV_RECORDING_MODE)
            .ok()
            .map(|raw| raw.parse())
            .transpose()?
            .unwrap_or_default();
        let path = std::env::var_os(ENV_RECORDING_FILE).map(PathBuf::from);
        Ok(Self {
            mode,
            path,
            ..Self::default()
        })
    }

    /// Environment that reproduces this configuration in a child process.
    #[must_use]
    pub fn to_env(&self) -> Vec<(String, String)> {
        let mut vars = vec![(ENV_RECORDING_MODE.to_string(), self.mode.to_string())];
        if let Some(path) = &self.path {
            vars.push((ENV_RECORDING_FILE.to_string(), path.display().to_string()));
        }
        vars
    }

    /// Get the mode.
    #[must_use]
    pub const fn mode(&self) -> RecordingMode {
        self.mode
    }

    /// Get the call store path.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Get the lock wait timeout.
    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Get the staleness threshold.
    #[must_use]
    pub const fn stale_after(&self) -> Duration {
        self.stale_after
    }
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            mode: RecordingMode::Live,
            path: None,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }
}

/// Builder for [`RecorderConfig`].
#[derive(Debug, Default)]
pub struct RecorderConfigBuilder {
    config: RecorderConfig,
}

impl RecorderConfigBuilder {
    /// Set the mode.
    #[must_use]
    pub const fn mode(mut self, mode: RecordingMode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Set the call store file.
    #[must_use]
    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.config.path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set the lock wait timeout.
    #[must_use]
    pub const fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.lock_timeout = timeout;
        self
    }

    /// Set the staleness threshold for leaked locks.
    #[must_use]
    pub const fn stale_after(mut self, stale_after: Duration) -> Self {
        self.config.stale_after = stale_after;
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> RecorderConfig {
        self.config
    }
}

/// Arguments of a tool call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolArgs {
    #[serde(default)]
    positional: Vec<Value>,
    #[serde(default)]
    named: BTreeMap<String, Value>,
}

impl ToolArgs {
    /// No arguments.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument.
    #[must_use]
    pub fn arg(mut self, value: Value) -> Self {
        self.positional.push(value);
        self
    }

    /// Add a named argument.
    #[must_use]
    pub fn named_arg(mut self, name: impl Into<String>, value: Value) -> Self {
        self.named.insert(name.into(), value);
        self
    }

    /// Positional argument by index.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.positional.get(index)
    }

    /// Named argument by name.
    #[must_use]
    pub fn get_named(&self, name: &str) -> Option<&Value> {
        self.named.get(name)
    }

    /// All positional arguments.
    #[must_use]
    pub fn positional(&self) -> &[Value] {
        &self.positional
    }

    /// All named arguments.
    #[must_use]
    pub const fn named(&self) -> &BTreeMap<String, Value> {
        &self.named
    }
}

/// An already-loaded outbound callable.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Stable identity, part of the call key.
    fn name(&self) -> &str;

    /// Call-shaping parameters beyond the arguments (model, api version).
    fn key_extras(&self) -> BTreeMap<String, Value> {
        BTreeMap::new()
    }

    /// Perform the call.
    ///
    /// # Errors
    /// Returns whatever the underlying call fails with
    async fn invoke(&self, args: &ToolArgs) -> Result<Value>;
}

/// Owner of the call store for one process.
#[derive(Debug)]
pub struct CallRecorder {
    config: RecorderConfig,
    store: Option<RecordStore>,
}

impl CallRecorder {
    /// Open the recorder described by `config`.
    ///
    /// # Errors
    /// Returns [`Error::Validation`] if a recording mode has no file, or the
    /// store's open error
    pub fn open(config: RecorderConfig) -> Result<Self> {
        let store = match config.mode {
            RecordingMode::Live => None,
            RecordingMode::Record => Some(RecordStore::open(
                require_path(&config)?,
                config.lock_timeout,
                config.stale_after,
            )?),
            RecordingMode::Replay => Some(RecordStore::open_read_only(require_path(&config)?)?),
        };
        tracing::info!(mode = %config.mode, path = ?config.path, "call recorder opened");
        Ok(Self { config, store })
    }

    /// A pass-through recorder.
    #[must_use]
    pub fn live() -> Self {
        Self {
            config: RecorderConfig::default(),
            store: None,
        }
    }

    /// Configuration in effect.
    #[must_use]
    pub const fn config(&self) -> &RecorderConfig {
        &self.config
    }

    /// Active mode.
    #[must_use]
    pub const fn mode(&self) -> RecordingMode {
        self.config.mode
    }

    /// Backing store, absent in live mode.
    #[must_use]
    pub const fn store(&self) -> Option<&RecordStore> {
        self.store.as_ref()
    }

    /// Start a logical run. Occurrence counters are private to the session.
    ///
    /// `scope` must be stable across record and replay (a line number or node
    /// name, never a generated id).
    #[must_use]
    pub fn session(self: &Arc<Self>, scope: impl Into<String>) -> RecordingSession {
        RecordingSession {
            recorder: Arc::clone(self),
            scope: scope.into(),
            counters: Mutex::new(FxHashMap::default()),
        }
    }

    /// Stop recording and remove the lock file if this recorder leaked it.
    ///
    /// A lock held by another writer is left alone.
    ///
    /// # Errors
    /// Returns error if the lock file cannot be read or removed
    pub fn close(&self) -> Result<()> {
        if let Some(store) = &self.store {
            store.close();
            if store.release_own_lock()? {
                tracing::warn!(lock = %store.lock_path().display(), "removed leaked lock file at close");
            }
        }
        Ok(())
    }

    async fn call(
        &self,
        scope: &str,
        key: String,
        occurrence: u64,
        tool: &dyn Tool,
        args: &ToolArgs,
    ) -> Result<Value> {
        let Some(store) = &self.store else {
            return tool.invoke(args).await;
        };
        if store.is_read_only() {
            return match store.lookup(scope, &key, occurrence) {
                Some(recorded) => {
                    tracing::debug!(tool = tool.name(), %key, occurrence, "replayed call");
                    recorded.into_result()
                }
                None => Err(Error::RecordNotFound {
                    tool: tool.name().to_string(),
                    key,
                    occurrence,
                }),
            };
        }

        let result = tool.invoke(args).await;
        store
            .append(CallRecord {
                scope: scope.to_string(),
                key,
                tool: tool.name().to_string(),
                occurrence,
                result: RecordedResult::capture(&result),
                recorded_at: chrono::Utc::now(),
            })
            .await?;
        result
    }
}

fn signature_of(tool: &dyn Tool, args: &ToolArgs) -> CallSignature {
    tool.key_extras()
        .into_iter()
        .fold(CallSignature::from_args(tool.name(), args), |sig, (name, value)| {
            sig.extra(name, value)
        })
}

fn require_path(config: &RecorderConfig) -> Result<&Path> {
    config.path.as_deref().ok_or_else(|| {
        Error::Validation(format!(
            "recording mode '{}' needs a call store file ({ENV_RECORDING_FILE})",
            config.mode
        ))
    })
}

/// One logical run's view of the recorder.
#[derive(Debug)]
pub struct RecordingSession {
    recorder: Arc<CallRecorder>,
    scope: String,
    counters: Mutex<FxHashMap<String, u64>>,
}

impl RecordingSession {
    /// Session scope.
    #[must_use]
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Recorder this session belongs to.
    #[must_use]
    pub const fn recorder(&self) -> &Arc<CallRecorder> {
        &self.recorder
    }

    /// Invoke `tool` through the recorder.
    ///
    /// # Errors
    /// Returns the tool's error (live or recorded), or
    /// [`Error::RecordNotFound`] on a replay miss
    pub async fn invoke(&self, tool: &dyn Tool, args: &ToolArgs) -> Result<Value> {
        if self.recorder.mode() == RecordingMode::Live {
            return tool.invoke(args).await;
        }
        let key = signature_of(tool, args).key();
        let occurrence = self.next_occurrence(&key);
        self.recorder
            .call(&self.scope, key, occurrence, tool, args)
            .await
    }

    fn next_occurrence(&self, key: &str) -> u64 {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let counter = counters.entry(key.to_string()).or_insert(0);
        let occurrence = *counter;
        *counter += 1;
        occurrence
    }
}

/// A [`Tool`] whose every call goes through a [`RecordingSession`].
pub struct RecordedTool {
    inner: Arc<dyn Tool>,
    session: Arc<RecordingSession>,
}

impl RecordedTool {
    /// Wrap `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn Tool>, session: Arc<RecordingSession>) -> Self {
        Self { inner, session }
    }
}

#[async_trait]
impl Tool for RecordedTool {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn key_extras(&self) -> BTreeMap<String, Value> {
        self.inner.key_extras()
    }

    async fn invoke(&self, args: &ToolArgs) -> Result<Value> {
        self.session.invoke(self.inner.as_ref(), args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct Counter(AtomicU64);

    #[async_trait]
    impl Tool for Counter {
        fn name(&self) -> &str {
            "counter"
        }
        async fn invoke(&self, _args: &ToolArgs) -> Result<Value> {
            Ok(json!(self.0.fetch_add(1, Ordering::SeqCst)))
        }
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("Record".parse::<RecordingMode>().unwrap(), RecordingMode::Record);
        assert_eq!("replay".parse::<RecordingMode>().unwrap(), RecordingMode::Replay);
        assert_eq!("".parse::<RecordingMode>().unwrap(), RecordingMode::Live);
        assert!("tape".parse::<RecordingMode>().is_err());
    }

    #[test]
    fn test_recording_mode_requires_file() {
        let config = RecorderConfig::builder().mode(RecordingMode::Record).build();
        let err = CallRecorder::open(config).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Validation);
    }

    #[test]
    fn test_to_env_round_trip_shape() {
        let config = RecorderConfig::builder()
            .mode(RecordingMode::Replay)
            .path("/tmp/calls.jsonl")
            .build();
        let env = config.to_env();
        assert!(env.contains(&(ENV_RECORDING_MODE.to_string(), "replay".to_string())));
        assert!(env.contains(&(ENV_RECORDING_FILE.to_string(), "/tmp/calls.jsonl".to_string())));
    }

    #[tokio::test]
    async fn test_live_mode_passes_through() {
        let recorder = Arc::new(CallRecorder::live());
        let session = recorder.session("s");
        let tool = Counter(AtomicU64::new(0));
        assert_eq!(session.invoke(&tool, &ToolArgs::new()).await.unwrap(), json!(0));
        assert_eq!(session.invoke(&tool, &ToolArgs::new()).await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_repeated_calls_replay_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("calls.jsonl");

        let recorder = Arc::new(
            CallRecorder::open(
                RecorderConfig::builder()
                    .mode(RecordingMode::Record)
                    .path(&file)
                    .build(),
            )
            .unwrap(),
        );
        let session = recorder.session("line-0");
        let tool = Counter(AtomicU64::new(10));
        for expected in 10..13 {
            let got = session.invoke(&tool, &ToolArgs::new()).await.unwrap();
            assert_eq!(got, json!(expected));
        }
        recorder.close().unwrap();

        let replayer = Arc::new(
            CallRecorder::open(
                RecorderConfig::builder()
                    .mode(RecordingMode::Replay)
                    .path(&file)
                    .build(),
            )
            .unwrap(),
        );
        let session = replayer.session("line-0");
        let untouched = Counter(AtomicU64::new(999));
        for expected in 10..13 {
            let got = session.invoke(&untouched, &ToolArgs::new()).await.unwrap();
            assert_eq!(got, json!(expected));
        }
        assert_eq!(untouched.0.load(Ordering::SeqCst), 999);

        let err = session.invoke(&untouched, &ToolArgs::new()).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::RecordNotFound);
    }

    #[tokio::test]
    async fn test_recorded_tool_wrapper() {
        let recorder = Arc::new(CallRecorder::live());
        let session = Arc::new(recorder.session("s"));
        let inner: Arc<dyn Tool> = Arc::new(Counter(AtomicU64::new(5)));
        let wrapped = RecordedTool::new(inner, session);
        assert_eq!(wrapped.name(), "counter");
        assert_eq!(wrapped.invoke(&ToolArgs::new()).await.unwrap(), json!(5));
    }
}
