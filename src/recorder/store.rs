//! Append-only JSON-lines call store.
//!
//! One [`CallRecord`] per line. Writers take the sibling lock file for each
//! append; replay opens the file read-only, loads it once and never locks.
//! When a `(scope, key, occurrence)` triple appears more than once (a call was
//! re-recorded) the latest line wins.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::lock::LockFile;
use crate::{Error, Result};

/// Captured outcome of a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecordedResult {
    /// The call returned a value
    Ok {
        /// Returned value
        value: Value,
    },
    /// The call raised an error
    Err {
        /// Rendered error message
        message: String,
    },
}

impl RecordedResult {
    /// Capture a live outcome.
    #[must_use]
    pub fn capture(result: &Result<Value>) -> Self {
        match result {
            Ok(value) => Self::Ok {
                value: value.clone(),
            },
            Err(e) => Self::Err {
                message: e.to_string(),
            },
        }
    }

    /// Turn back into the outcome the caller sees.
    ///
    /// # Errors
    /// Returns the recorded error as [`Error::Other`]
    pub fn into_result(self) -> Result<Value> {
        match self {
            Self::Ok { value } => Ok(value),
            Self::Err { message } => Err(Error::Other(message)),
        }
    }
}

/// One line of the call store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    /// Logical run scope the occurrence counter belongs to
    #[serde(default)]
    pub scope: String,
    /// Call key (`sha256:<hex>`)
    pub key: String,
    /// Tool identity, kept for humans reading the log
    pub tool: String,
    /// Zero-based index among identical calls in the scope
    pub occurrence: u64,
    /// Captured outcome
    pub result: RecordedResult,
    /// When the record was written
    pub recorded_at: DateTime<Utc>,
}

type RecordIndex = FxHashMap<(String, String, u64), RecordedResult>;

/// File-backed call store.
#[derive(Debug)]
pub struct RecordStore {
    path: PathBuf,
    lock: LockFile,
    read_only: bool,
    closed: AtomicBool,
    records: RwLock<RecordIndex>,
}

impl RecordStore {
    /// Open for recording, creating the file if needed and loading any
    /// existing records.
    ///
    /// # Errors
    /// Returns error if the file cannot be created or holds malformed lines
    pub fn open(path: impl AsRef<Path>, lock_timeout: Duration, stale_after: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(&path)?;
        let records = load(&path)?;
        Ok(Self {
            lock: LockFile::for_resource(&path)
                .timeout(lock_timeout)
                .stale_after(stale_after),
            path,
            read_only: false,
            closed: AtomicBool::new(false),
            records: RwLock::new(records),
        })
    }

    /// Open an existing store for replay. No lock is taken.
    ///
    /// # Errors
    /// Returns [`Error::NotFound`] if the file does not exist, or a decode
    /// error for malformed lines
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(Error::NotFound(format!(
                "recording file {}",
                path.display()
            )));
        }
        let records = load(&path)?;
        tracing::debug!(path = %path.display(), records = records.len(), "loaded call store");
        Ok(Self {
            lock: LockFile::for_resource(&path),
            path,
            read_only: true,
            closed: AtomicBool::new(false),
            records: RwLock::new(records),
        })
    }

    /// Store file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sibling lock file path.
    #[must_use]
    pub fn lock_path(&self) -> &Path {
        self.lock.path()
    }

    /// Whether this store was opened for replay.
    #[must_use]
    pub const fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Number of distinct `(scope, key, occurrence)` entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find the recorded outcome of the `occurrence`-th call with `key`.
    #[must_use]
    pub fn lookup(&self, scope: &str, key: &str, occurrence: u64) -> Option<RecordedResult> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(scope.to_string(), key.to_string(), occurrence))
            .cloned()
    }

    /// Append a record under the lock file.
    ///
    /// # Errors
    /// Returns error if the store is read-only or closed, the lock cannot be
    /// acquired, or the write fails
    pub async fn append(&self, record: CallRecord) -> Result<()> {
        if self.read_only {
            return Err(Error::Other(format!(
                "call store {} is open read-only",
                self.path.display()
            )));
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Other(format!(
                "call store {} is closed",
                self.path.display()
            )));
        }

        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let guard = self.lock.acquire().await?;
        let written = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .and_then(|mut file| {
                file.write_all(&line)?;
                file.flush()
            });
        guard.release()?;
        written?;

        tracing::debug!(tool = %record.tool, key = %record.key, occurrence = record.occurrence, "recorded call");
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((record.scope, record.key, record.occurrence), record.result);
        Ok(())
    }

    /// Stop accepting appends. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Remove the lock file if this store's own writer left it behind.
    /// Returns whether a file was removed.
    ///
    /// Another writer's lock is never touched, live or leaked; a leaked one
    /// is taken over once it goes stale.
    ///
    /// # Errors
    /// Returns error if the lock file cannot be read or removed
    pub fn release_own_lock(&self) -> Result<bool> {
        self.lock.release_if_owned()
    }

    /// Owner id this store writes into the lock file.
    #[must_use]
    pub fn lock_owner(&self) -> &str {
        self.lock.owner()
    }
}

fn load(path: &Path) -> Result<RecordIndex> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = RecordIndex::default();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: CallRecord = serde_json::from_str(&line)?;
        records.insert((record.scope, record.key, record.occurrence), record.result);
    }
    Ok(records)
}
