//! Advisory lock file serializing writers across processes.
//!
//! The lock is a sibling file created with `create_new`, so exactly one
//! process wins. The winner writes an owner token into it:
//!
//! ```text
//! <owner> <nonce> <acquired-at>
//! ```
//!
//! `owner` identifies the [`LockFile`] (pid plus a random id) and `nonce` the
//! acquisition. A guard only removes the file while it still carries its own
//! token, so a holder that lost its lock to a stale takeover never deletes
//! the new holder's lock. A lock whose mtime is older than the staleness
//! threshold is assumed leaked by a dead process and taken over.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind as IoErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use crate::{Error, Result};

/// Default time to wait for a contended lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Default age after which a lock file counts as leaked.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(60);

const INITIAL_BACKOFF: Duration = Duration::from_millis(5);
const MAX_BACKOFF: Duration = Duration::from_millis(100);

/// Lock file next to a guarded resource.
#[derive(Debug, Clone)]
pub struct LockFile {
    path: PathBuf,
    owner: String,
    timeout: Duration,
    stale_after: Duration,
}

impl LockFile {
    /// Lock guarding `resource`; the lock lives at `<resource>.lock`.
    #[must_use]
    pub fn for_resource(resource: &Path) -> Self {
        let mut path = resource.as_os_str().to_owned();
        path.push(".lock");
        Self {
            path: PathBuf::from(path),
            owner: format!("{}-{}", std::process::id(), uuid::Uuid::new_v4().simple()),
            timeout: DEFAULT_LOCK_TIMEOUT,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }

    /// Set how long [`acquire`](Self::acquire) waits before giving up.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the staleness threshold.
    #[must_use]
    pub const fn stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Owner id written into every lock this handle acquires.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Whether a lock file currently exists.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.path.exists()
    }

    /// Owner id of the current holder, if the lock is held.
    ///
    /// # Errors
    /// Returns error if the lock file exists but cannot be read
    pub fn holder(&self) -> Result<Option<String>> {
        Ok(read_token(&self.path)?.map(|(owner, _)| owner))
    }

    /// Wait for the lock, taking over stale ones.
    ///
    /// # Errors
    /// Returns [`Error::LockContention`] if a live holder keeps the lock past
    /// the timeout, or an IO error if the lock file cannot be created or
    /// its owner token cannot be written.
    pub async fn acquire(&self) -> Result<LockGuard> {
        let started = Instant::now();
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.path)
            {
                Ok(mut file) => {
                    let nonce = uuid::Uuid::new_v4().simple().to_string();
                    let written = writeln!(
                        file,
                        "{} {nonce} {}",
                        self.owner,
                        chrono::Utc::now().to_rfc3339()
                    )
                    .and_then(|()| file.sync_all());
                    if let Err(e) = written {
                        // an unreadable token could never be released by its owner
                        drop(file);
                        remove_if_exists(&self.path)?;
                        return Err(e.into());
                    }
                    return Ok(LockGuard {
                        path: self.path.clone(),
                        owner: self.owner.clone(),
                        nonce,
                        released: false,
                    });
                }
                Err(e) if e.kind() == IoErrorKind::AlreadyExists => {
                    if self.is_stale() {
                        tracing::warn!(
                            lock = %self.path.display(),
                            stale_after = ?self.stale_after,
                            holder = ?self.holder().ok().flatten(),
                            "taking over stale lock file"
                        );
                        remove_if_exists(&self.path)?;
                        continue;
                    }
                    let waited = started.elapsed();
                    if waited >= self.timeout {
                        return Err(Error::LockContention {
                            path: self.path.clone(),
                            waited,
                        });
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Remove the lock file only if this handle's owner holds it, e.g. a
    /// guard of ours that was leaked. Locks of other owners are left to the
    /// stale takeover.
    ///
    /// Returns whether a file was removed.
    ///
    /// # Errors
    /// Returns error if the lock file cannot be read or removed
    pub fn release_if_owned(&self) -> Result<bool> {
        match read_token(&self.path)? {
            Some((owner, _)) if owner == self.owner => remove_if_exists(&self.path),
            _ => Ok(false),
        }
    }

    fn is_stale(&self) -> bool {
        fs::metadata(&self.path)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .is_some_and(|age| age > self.stale_after)
    }
}

/// Held lock. Dropping it releases the lock if it is still ours.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    owner: String,
    nonce: String,
    released: bool,
}

impl LockGuard {
    /// Release explicitly, surfacing IO errors.
    ///
    /// Returns whether the file was removed; `false` means the lock was
    /// taken over in the meantime and the new holder's file was kept.
    ///
    /// # Errors
    /// Returns error if the lock file cannot be read or removed
    pub fn release(mut self) -> Result<bool> {
        self.released = true;
        self.remove_own()
    }

    fn remove_own(&self) -> Result<bool> {
        match read_token(&self.path)? {
            Some((owner, nonce)) if owner == self.owner && nonce == self.nonce => {
                remove_if_exists(&self.path)
            }
            Some(_) => {
                tracing::warn!(lock = %self.path.display(), "lock was taken over, leaving the new holder's file");
                Ok(false)
            }
            None => Ok(false),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.remove_own() {
                tracing::warn!(lock = %self.path.display(), error = %e, "failed to release lock file");
            }
        }
    }
}

/// `(owner, nonce)` of the lock file at `path`, if it exists.
fn read_token(path: &Path) -> Result<Option<(String, String)>> {
    match fs::read_to_string(path) {
        Ok(text) => {
            let mut words = text.split_whitespace();
            let owner = words.next().unwrap_or_default().to_string();
            let nonce = words.next().unwrap_or_default().to_string();
            Ok(Some((owner, nonce)))
        }
        Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == IoErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
