// Storage engines behind the persistence gateway
//
// The gateway treats the store as an opaque record store with three failure
// classes: busy (transient, retried), corrupt and denied (permanent).

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};

/// Completion state of one level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelProgress {
    pub stars: u8,
    pub completed: bool,
}

/// Everything the session persists: the egg balance and per-level progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressRecord {
    pub eggs: u64,
    pub levels: BTreeMap<u32, LevelProgress>,
    /// Finished sessions, oldest first
    pub sessions: Vec<SessionSummary>,
}

/// One finished session as kept in the history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Wall-clock start, milliseconds since the Unix epoch
    pub started_at_ms: u64,
    pub duration_ms: u64,
    pub attempted: u32,
    pub correct: u32,
}

impl SessionSummary {
    /// Percentage of correct answers; 0 when nothing was attempted.
    pub fn accuracy(&self) -> f64 {
        if self.attempted == 0 {
            return 0.0;
        }
        f64::from(self.correct) * 100.0 / f64::from(self.attempted)
    }
}

/// Totals over the session history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ProgressStats {
    pub sessions: usize,
    pub attempted: u64,
    pub correct: u64,
    pub duration_ms: u64,
    pub accuracy: f64,
}

impl ProgressRecord {
    pub fn stats(&self) -> ProgressStats {
        let mut stats = ProgressStats {
            sessions: self.sessions.len(),
            ..ProgressStats::default()
        };
        for session in &self.sessions {
            stats.attempted += u64::from(session.attempted);
            stats.correct += u64::from(session.correct);
            stats.duration_ms += session.duration_ms;
        }
        if stats.attempted > 0 {
            stats.accuracy = stats.correct as f64 * 100.0 / stats.attempted as f64;
        }
        stats
    }

    /// Highest completed level + 1, or 1 when nothing is completed.
    pub fn next_level(&self) -> u32 {
        self.levels
            .iter()
            .filter(|(_, progress)| progress.completed)
            .map(|(id, _)| *id)
            .max()
            .map_or(1, |id| id.saturating_add(1))
    }

    /// Levels the player may open: every level up to and including the next one.
    pub fn unlocked_levels(&self) -> Vec<u32> {
        (1..=self.next_level()).collect()
    }
}

/// Failure class reported by a storage engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreFault {
    /// Another writer holds the store; worth retrying
    Busy,
    Corrupt(String),
    Denied(String),
}

impl fmt::Display for StoreFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreFault::Busy => write!(f, "store busy"),
            StoreFault::Corrupt(details) => write!(f, "store corrupt: {}", details),
            StoreFault::Denied(details) => write!(f, "store access denied: {}", details),
        }
    }
}

impl From<io::Error> for StoreFault {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            ErrorKind::PermissionDenied => StoreFault::Denied(err.to_string()),
            ErrorKind::WouldBlock | ErrorKind::AlreadyExists | ErrorKind::Interrupted => {
                StoreFault::Busy
            }
            _ => StoreFault::Corrupt(err.to_string()),
        }
    }
}

/// Blocking record store. Calls run on the blocking thread pool.
pub trait StorageEngine: Send + Sync + 'static {
    /// Read the committed record.
    fn load(&self) -> Result<ProgressRecord, StoreFault>;

    /// Replace the committed record. Must be all-or-nothing.
    fn commit(&self, record: &ProgressRecord) -> Result<(), StoreFault>;

    /// Make committed data durable before shutdown.
    fn flush(&self) -> Result<(), StoreFault> {
        Ok(())
    }
}

/// In-memory store with scriptable commit failures.
#[derive(Default)]
pub struct MemoryStore {
    record: Mutex<ProgressRecord>,
    scripted: Mutex<VecDeque<StoreFault>>,
    persistent: Mutex<Option<StoreFault>>,
    commit_delay: Mutex<Duration>,
    attempts: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(record: ProgressRecord) -> Self {
        Self {
            record: Mutex::new(record),
            ..Self::default()
        }
    }

    /// Fail the next commits with `faults`, in order.
    pub fn script_failures<I: IntoIterator<Item = StoreFault>>(&self, faults: I) {
        lock(&self.scripted).extend(faults);
    }

    /// Fail every commit with `fault` until cleared with `None`.
    pub fn fail_always(&self, fault: Option<StoreFault>) {
        *lock(&self.persistent) = fault;
    }

    /// Block each commit for `delay`, simulating a slow disk.
    pub fn set_commit_delay(&self, delay: Duration) {
        *lock(&self.commit_delay) = delay;
    }

    /// Commit calls seen so far, failed ones included.
    pub fn commit_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn stored(&self) -> ProgressRecord {
        lock(&self.record).clone()
    }
}

impl StorageEngine for MemoryStore {
    fn load(&self) -> Result<ProgressRecord, StoreFault> {
        Ok(lock(&self.record).clone())
    }

    fn commit(&self, record: &ProgressRecord) -> Result<(), StoreFault> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.commit_delay);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if let Some(fault) = lock(&self.scripted).pop_front() {
            return Err(fault);
        }
        if let Some(fault) = lock(&self.persistent).clone() {
            return Err(fault);
        }
        *lock(&self.record) = record.clone();
        Ok(())
    }
}

/// JSON document on disk.
///
/// Writes go to a sibling temp file that is renamed over the document, so a
/// reader never sees a half-written record. An OS advisory lock on the
/// `<file>.lock` sibling guards the write; finding it held by another writer
/// reports [`StoreFault::Busy`]. The kernel drops the lock when its holder
/// exits, so a marker left behind by a crashed process does not block writes.
pub struct JsonFileStore {
    path: PathBuf,
    lock_path: PathBuf,
    temp_path: PathBuf,
}

impl JsonFileStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            lock_path: sibling(&path, "lock"),
            temp_path: sibling(&path, "tmp"),
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

impl StorageEngine for JsonFileStore {
    fn load(&self) -> Result<ProgressRecord, StoreFault> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("[JsonFileStore] {} not found, starting fresh", self.path.display());
                return Ok(ProgressRecord::default());
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&contents).map_err(|e| StoreFault::Corrupt(e.to_string()))
    }

    fn commit(&self, record: &ProgressRecord) -> Result<(), StoreFault> {
        let _guard = LockFile::acquire(&self.lock_path)?;
        let body = serde_json::to_string_pretty(record)
            .map_err(|e| StoreFault::Corrupt(e.to_string()))?;
        {
            let mut temp = fs::File::create(&self.temp_path)?;
            temp.write_all(body.as_bytes())?;
            temp.sync_all()?;
        }
        fs::rename(&self.temp_path, &self.path)?;
        Ok(())
    }

    /// Succeeds once no other writer holds the lock.
    fn flush(&self) -> Result<(), StoreFault> {
        LockFile::acquire(&self.lock_path).map(drop)
    }
}

/// Exclusive advisory lock on the `.lock` sibling, released on drop.
///
/// The marker file itself stays on disk; only the lock matters.
struct LockFile {
    file: File,
}

impl LockFile {
    fn acquire(path: &Path) -> Result<Self, StoreFault> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        match file.try_lock() {
            Ok(()) => Ok(Self { file }),
            Err(TryLockError::WouldBlock) => Err(StoreFault::Busy),
            Err(TryLockError::Error(e)) => Err(e.into()),
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
