//! Staging stores for pending log entries.
//!
//! The batch buffer mirrors its contents into a [`StagingStore`] so that a
//! crash between `log` and `flush` loses nothing. Every operation is a full
//! read-modify-write of one document under an exclusive lock, and the lock
//! is only ever held for that local I/O, never across a network call.
//!
//! Two implementations:
//!
//! - [`MemoryStaging`]: a mutex-guarded vector. Survives nothing, but lets
//!   several buffers in one process share staged state.
//! - [`FileStaging`]: a JSON document on disk, guarded by a sibling lock
//!   file created with `O_EXCL`, rewritten through a temp file and an atomic
//!   rename so a reader never observes a half-written document.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::batch::LogEntry;
use crate::config;

/// Failures of the staging layer.
#[derive(Debug, Error)]
pub enum StagingError {
    /// Reading or writing the staging document failed.
    #[error("staging I/O on {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Another process held the lock for longer than the wait bound.
    #[error("timed out after {waited_ms}ms waiting for staging lock {path}")]
    LockTimeout {
        /// Lock file path.
        path: PathBuf,
        /// How long we waited.
        waited_ms: u64,
    },

    /// The staging document exists but is not valid.
    #[error("staging document {path} is corrupt: {reason}")]
    Corrupt {
        /// Document path.
        path: PathBuf,
        /// Parse failure.
        reason: String,
    },
}

/// Single-writer access to the staged entry sequence.
pub trait StagingStore: Send + Sync {
    /// Returns the staged entries.
    fn load(&self) -> Result<Vec<LogEntry>, StagingError>;

    /// Runs `edit` on the staged entries while holding the exclusive lock,
    /// persists the result, and returns it.
    fn update(
        &self,
        edit: &mut dyn FnMut(&mut Vec<LogEntry>),
    ) -> Result<Vec<LogEntry>, StagingError>;

    /// Short label for logs.
    fn describe(&self) -> String;
}

// ---------------------------------------------------------------------------
// MemoryStaging
// ---------------------------------------------------------------------------

/// Process-local staging.
#[derive(Debug, Default)]
pub struct MemoryStaging {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemoryStaging {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StagingStore for MemoryStaging {
    fn load(&self) -> Result<Vec<LogEntry>, StagingError> {
        Ok(self.entries.lock().clone())
    }

    fn update(
        &self,
        edit: &mut dyn FnMut(&mut Vec<LogEntry>),
    ) -> Result<Vec<LogEntry>, StagingError> {
        let mut entries = self.entries.lock();
        edit(&mut entries);
        Ok(entries.clone())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

// ---------------------------------------------------------------------------
// FileStaging
// ---------------------------------------------------------------------------

/// On-disk form of the staged sequence.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StagedDocument {
    entries: Vec<LogEntry>,
}

/// Durable staging in a single JSON file.
#[derive(Debug, Clone)]
pub struct FileStaging {
    path: PathBuf,
    lock_path: PathBuf,
    reclaim_path: PathBuf,
    lock_timeout: Duration,
    stale_after: Duration,
}

impl FileStaging {
    /// Stages into `path`; the lock file is `path` with `.lock` appended.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_name = path.as_os_str().to_owned();
        lock_name.push(".lock");
        let mut reclaim_name = lock_name.clone();
        reclaim_name.push(".reclaim");
        Self {
            path,
            lock_path: PathBuf::from(lock_name),
            reclaim_path: PathBuf::from(reclaim_name),
            lock_timeout: config::STAGING_LOCK_TIMEOUT,
            stale_after: config::STAGING_LOCK_STALE_AFTER,
        }
    }

    /// Overrides the lock wait bound.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// The staging document path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(path: &Path, source: std::io::Error) -> StagingError {
        StagingError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Takes the lock file. A lock older than `stale_after` is assumed to
    /// belong to a crashed process and is reclaimed.
    fn acquire_lock(&self) -> Result<LockGuard, StagingError> {
        if let Some(dir) = self.lock_path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir).map_err(|e| Self::io_err(dir, e))?;
            }
        }

        let start = Instant::now();
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.lock_path)
            {
                Ok(file) => {
                    return Ok(LockGuard {
                        path: self.lock_path.clone(),
                        _file: file,
                    })
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if is_older_than(&self.lock_path, self.stale_after) && self.reclaim_stale_lock()? {
                        tracing::warn!(lock = %self.lock_path.display(), "removed stale staging lock");
                        continue;
                    }
                    if start.elapsed() > self.lock_timeout {
                        return Err(StagingError::LockTimeout {
                            path: self.lock_path.clone(),
                            waited_ms: start.elapsed().as_millis() as u64,
                        });
                    }
                    std::thread::sleep(Duration::from_millis(20));
                }
                Err(e) => return Err(Self::io_err(&self.lock_path, e)),
            }
        }
    }

    /// Removes the lock file if it is still stale. Waiters serialize on a
    /// second marker file, and staleness is checked again under it, so a
    /// lock that was broken and retaken by another waiter in the meantime
    /// survives. Returns whether the lock was removed.
    fn reclaim_stale_lock(&self) -> Result<bool, StagingError> {
        let marker = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.reclaim_path)
        {
            Ok(file) => LockGuard {
                path: self.reclaim_path.clone(),
                _file: file,
            },
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                // Left behind by a waiter that died while reclaiming.
                if is_older_than(&self.reclaim_path, self.stale_after) {
                    let _ = fs::remove_file(&self.reclaim_path);
                }
                return Ok(false);
            }
            Err(e) => return Err(Self::io_err(&self.reclaim_path, e)),
        };

        let removed = if is_older_than(&self.lock_path, self.stale_after) {
            match fs::remove_file(&self.lock_path) {
                Ok(()) => true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
                Err(e) => return Err(Self::io_err(&self.lock_path, e)),
            }
        } else {
            false
        };
        drop(marker);
        Ok(removed)
    }

    fn read_document(&self) -> Result<Vec<LogEntry>, StagingError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Self::io_err(&self.path, e)),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        serde_json::from_slice::<StagedDocument>(&bytes)
            .map(|doc| doc.entries)
            .map_err(|e| StagingError::Corrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            })
    }

    fn write_document(&self, entries: &[LogEntry]) -> Result<(), StagingError> {
        let doc = StagedDocument {
            entries: entries.to_vec(),
        };
        let json = serde_json::to_vec_pretty(&doc).map_err(|e| StagingError::Corrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        let dir = self
            .path
            .parent()
            .filter(|d| !d.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let tmp = dir.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
        {
            let mut f = File::create(&tmp).map_err(|e| Self::io_err(&tmp, e))?;
            f.write_all(&json).map_err(|e| Self::io_err(&tmp, e))?;
            f.sync_all().map_err(|e| Self::io_err(&tmp, e))?;
        }
        if let Err(e) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(Self::io_err(&self.path, e));
        }
        // Flush the directory entry so the rename itself is durable.
        if let Ok(dir_file) = File::open(&dir) {
            let _ = dir_file.sync_all();
        }
        Ok(())
    }
}

impl StagingStore for FileStaging {
    fn load(&self) -> Result<Vec<LogEntry>, StagingError> {
        let _guard = self.acquire_lock()?;
        self.read_document()
    }

    fn update(
        &self,
        edit: &mut dyn FnMut(&mut Vec<LogEntry>),
    ) -> Result<Vec<LogEntry>, StagingError> {
        let _guard = self.acquire_lock()?;
        let mut entries = self.read_document()?;
        edit(&mut entries);
        self.write_document(&entries)?;
        Ok(entries)
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}

/// `true` if `path` exists and was last modified more than `age` ago.
fn is_older_than(path: &Path, age: Duration) -> bool {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
        .map(|elapsed| elapsed > age)
        .unwrap_or(false)
}

/// Removes the lock file when dropped.
struct LockGuard {
    path: PathBuf,
    _file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
