use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::entry::{ItemState, LedgerEntry, WorkItem};
use crate::error::PipelineError;

const ENTRIES_DIR: &str = "entries";
const LOCK_FILE: &str = ".lock";
const TEMP_PREFIX: &str = ".entry-";
const TEMP_SUFFIX: &str = ".tmp";

/// Writes `bytes` to `path` through a sibling temp file and a rename, so a
/// reader sees either the old contents or the new ones.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PipelineError> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let io_err = |source| PipelineError::LedgerWrite {
        path: path.to_path_buf(),
        source,
    };

    let mut tmp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(TEMP_SUFFIX)
        .tempfile_in(dir)
        .map_err(io_err)?;
    tmp.write_all(bytes).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

/// Per-state counts over a set of ledger entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub done: usize,
    pub failed: usize,
}

impl StateCounts {
    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.done + self.failed
    }

    /// Entries in a terminal state.
    pub fn finished(&self) -> usize {
        self.done + self.failed
    }

    fn add(&mut self, state: ItemState) {
        match state {
            ItemState::Pending => self.pending += 1,
            ItemState::InProgress => self.in_progress += 1,
            ItemState::Done => self.done += 1,
            ItemState::FailedPermanent => self.failed += 1,
        }
    }
}

/// Consistent copy of the ledger at one point in time.
#[derive(Debug, Clone, Default)]
pub struct LedgerSnapshot {
    entries: BTreeMap<String, LedgerEntry>,
}

impl LedgerSnapshot {
    pub fn get(&self, identity: &str) -> Option<&LedgerEntry> {
        self.entries.get(identity)
    }

    pub fn state_of(&self, identity: &str) -> Option<ItemState> {
        self.entries.get(identity).map(|e| e.state)
    }

    pub fn entries(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn counts(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for entry in self.entries.values() {
            counts.add(entry.state);
        }
        counts
    }

    pub fn in_state(&self, state: ItemState) -> impl Iterator<Item = &LedgerEntry> {
        self.entries.values().filter(move |e| e.state == state)
    }
}

#[derive(Debug, Serialize)]
struct StatusRow<'a> {
    identity: &'a str,
    state: ItemState,
    attempt_count: u32,
    last_error: &'a str,
    last_updated: DateTime<Utc>,
    output_path: String,
}

/// Durable identity → [`LedgerEntry`] mapping for one stage.
///
/// Each entry lives in its own JSON file under `<dir>/entries/`, named by the
/// SHA-256 of the identity, and is replaced atomically on every write. All
/// writes go through one mutex, which also serializes writes per identity.
pub struct Ledger {
    dir: PathBuf,
    entries: Mutex<BTreeMap<String, LedgerEntry>>,
    version: watch::Sender<u64>,
    _dir_lock: fd_lock::RwLock<File>,
}

/// Takes the exclusive lock on `<dir>/.lock`.
///
/// The guard is forgotten so the lock lasts until the file handle inside the
/// returned value is closed.
fn lock_dir(dir: &Path) -> Result<fd_lock::RwLock<File>, PipelineError> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(dir.join(LOCK_FILE))?;
    let mut lock = fd_lock::RwLock::new(file);
    match lock.try_write() {
        Ok(guard) => std::mem::forget(guard),
        Err(source) => {
            return Err(PipelineError::LedgerLocked {
                dir: dir.to_path_buf(),
                source,
            });
        }
    }
    Ok(lock)
}

/// Reads every record under `entries_dir`, skipping unreadable ones.
/// With `sweep_temp`, stale temp files from an interrupted write are removed.
fn read_records(
    entries_dir: &Path,
    sweep_temp: bool,
) -> Result<BTreeMap<String, LedgerEntry>, PipelineError> {
    let mut entries = BTreeMap::new();
    for dirent in std::fs::read_dir(entries_dir)? {
        let path = dirent?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with(TEMP_PREFIX) && name.ends_with(TEMP_SUFFIX) {
            if sweep_temp {
                debug!(path = %path.display(), "removing stale ledger temp file");
                let _ = std::fs::remove_file(&path);
            }
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }

        let entry: LedgerEntry = match std::fs::read(&path)
            .map_err(PipelineError::from)
            .and_then(|bytes| serde_json::from_slice(&bytes).map_err(PipelineError::from))
        {
            Ok(entry) => entry,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable ledger record");
                continue;
            }
        };
        entries.insert(entry.identity.clone(), entry);
    }
    Ok(entries)
}

impl Ledger {
    /// Opens (or creates) the ledger in `dir` and reconstructs every entry.
    ///
    /// Takes an exclusive advisory lock on `<dir>/.lock` for the lifetime of
    /// the returned value; a second open of the same directory fails with
    /// [`PipelineError::LedgerLocked`]. Entries left `in-progress` by an
    /// earlier run are returned to `pending` and written back; their open
    /// attempt is recorded as interrupted.
    pub fn load(dir: impl Into<PathBuf>) -> Result<Self, PipelineError> {
        let dir = dir.into();
        let entries_dir = dir.join(ENTRIES_DIR);
        std::fs::create_dir_all(&entries_dir)?;
        let dir_lock = lock_dir(&dir)?;

        let mut entries = read_records(&entries_dir, true)?;
        let mut recovered = Vec::new();
        for entry in entries.values_mut() {
            if entry.release_interrupted() {
                recovered.push(entry.identity.clone());
            }
        }

        let (version, _) = watch::channel(0);
        let ledger = Self {
            dir,
            entries: Mutex::new(entries),
            version,
            _dir_lock: dir_lock,
        };

        if !recovered.is_empty() {
            warn!(
                count = recovered.len(),
                "recovered items left in-progress by an interrupted run"
            );
            let guard = ledger.lock();
            for identity in &recovered {
                if let Some(entry) = guard.get(identity) {
                    ledger.write_record(entry)?;
                }
            }
        }

        Ok(ledger)
    }

    /// Reads the entries in `dir` as they are on disk.
    ///
    /// Takes no lock and writes nothing, so it is safe while a run holds the
    /// ledger: `in-progress` entries are reported as such. A missing
    /// directory reads as an empty snapshot.
    pub fn inspect(dir: &Path) -> Result<LedgerSnapshot, PipelineError> {
        let entries_dir = dir.join(ENTRIES_DIR);
        if !entries_dir.is_dir() {
            return Ok(LedgerSnapshot::default());
        }
        Ok(LedgerSnapshot {
            entries: read_records(&entries_dir, false)?,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Creates `pending` entries for identities not seen before.
    /// Returns how many were created.
    pub fn register<'a>(
        &self,
        items: impl IntoIterator<Item = &'a WorkItem>,
    ) -> Result<usize, PipelineError> {
        let mut guard = self.lock();
        let mut created = 0;
        for item in items {
            if guard.contains_key(&item.identity) {
                continue;
            }
            let entry = LedgerEntry::new(item);
            self.write_record(&entry)?;
            guard.insert(entry.identity.clone(), entry);
            created += 1;
        }
        drop(guard);
        if created > 0 {
            self.bump();
        }
        Ok(created)
    }

    pub fn get(&self, identity: &str) -> Option<LedgerEntry> {
        self.lock().get(identity).cloned()
    }

    /// Writes one entry durably, then publishes it in memory.
    ///
    /// Refuses to move an entry out of `done` or `failed-permanent`.
    pub fn upsert(&self, entry: LedgerEntry) -> Result<(), PipelineError> {
        let mut guard = self.lock();
        if let Some(current) = guard.get(&entry.identity)
            && current.state.is_terminal()
            && current.state != entry.state
        {
            return Err(PipelineError::InvalidTransition {
                identity: entry.identity,
                from: current.state,
                to: entry.state,
            });
        }
        self.write_record(&entry)?;
        guard.insert(entry.identity.clone(), entry);
        drop(guard);
        self.bump();
        Ok(())
    }

    /// Operator override: returns a `failed-permanent` entry to `pending` with
    /// a fresh attempt budget. Attempt history is kept.
    pub fn reset_failed(&self, identity: &str) -> Result<bool, PipelineError> {
        let mut guard = self.lock();
        let Some(current) = guard.get(identity) else {
            return Ok(false);
        };
        if current.state != ItemState::FailedPermanent {
            return Ok(false);
        }
        let mut entry = current.clone();
        entry.state = ItemState::Pending;
        entry.attempt_count = 0;
        entry.last_updated = Utc::now();
        self.write_record(&entry)?;
        guard.insert(entry.identity.clone(), entry);
        drop(guard);
        self.bump();
        Ok(true)
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            entries: self.lock().clone(),
        }
    }

    /// Receiver whose value changes after every ledger mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    /// Writes the status table, one CSV row per entry.
    pub fn export_status(&self, path: &Path) -> Result<(), PipelineError> {
        let snapshot = self.snapshot();
        let mut writer = csv::Writer::from_writer(Vec::new());
        for entry in snapshot.entries() {
            writer.serialize(StatusRow {
                identity: &entry.identity,
                state: entry.state,
                attempt_count: entry.attempt_count,
                last_error: entry.last_error.as_deref().unwrap_or(""),
                last_updated: entry.last_updated,
                output_path: entry
                    .output_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
            })?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| PipelineError::Io(e.into_error()))?;
        write_atomic(path, &bytes)
    }

    fn record_path(&self, identity: &str) -> PathBuf {
        let digest = Sha256::digest(identity.as_bytes());
        self.dir
            .join(ENTRIES_DIR)
            .join(format!("{}.json", hex::encode(digest)))
    }

    fn write_record(&self, entry: &LedgerEntry) -> Result<(), PipelineError> {
        let bytes = serde_json::to_vec_pretty(entry)?;
        write_atomic(&self.record_path(&entry.identity), &bytes)
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, LedgerEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }
}
