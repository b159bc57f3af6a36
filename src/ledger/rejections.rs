use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entry::LedgerEntry;
use super::store::write_atomic;
use crate::error::PipelineError;

/// One permanently failed item, as shown to a human reviewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectionRow {
    pub identity: String,
    pub input: String,
    pub attempts: u32,
    pub last_error: String,
    pub rejected_at: DateTime<Utc>,
}

/// CSV list of identities that ended `failed-permanent`.
///
/// The whole file is rewritten atomically on every change, and an identity
/// is listed at most once.
pub struct RejectionList {
    path: PathBuf,
    rows: Mutex<Vec<RejectionRow>>,
}

impl RejectionList {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PipelineError> {
        let path = path.into();
        let rows = Self::read(&path)?;
        Ok(Self {
            path,
            rows: Mutex::new(rows),
        })
    }

    /// Reads a rejection list; a missing file is an empty list.
    pub fn read(path: &Path) -> Result<Vec<RejectionRow>, PipelineError> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::Reader::from_path(path)?;
        let mut rows: Vec<RejectionRow> = Vec::new();
        for row in reader.deserialize() {
            let row: RejectionRow = row?;
            if !rows.iter().any(|r| r.identity == row.identity) {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Adds the entry unless its identity is already listed.
    /// Returns whether the list changed.
    pub fn append(&self, entry: &LedgerEntry) -> Result<bool, PipelineError> {
        let mut rows = self.lock();
        if rows.iter().any(|r| r.identity == entry.identity) {
            return Ok(false);
        }
        rows.push(RejectionRow {
            identity: entry.identity.clone(),
            input: entry.input.clone(),
            attempts: entry.attempt_count,
            last_error: entry.last_error.clone().unwrap_or_default(),
            rejected_at: Utc::now(),
        });
        self.persist(&rows)?;
        Ok(true)
    }

    /// Drops an identity from the list, e.g. when it is force-retried.
    pub fn remove(&self, identity: &str) -> Result<bool, PipelineError> {
        let mut rows = self.lock();
        let before = rows.len();
        rows.retain(|r| r.identity != identity);
        if rows.len() == before {
            return Ok(false);
        }
        self.persist(&rows)?;
        Ok(true)
    }

    pub fn rows(&self) -> Vec<RejectionRow> {
        self.lock().clone()
    }

    fn persist(&self, rows: &[RejectionRow]) -> Result<(), PipelineError> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        for row in rows {
            writer.serialize(row)?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| PipelineError::Io(e.into_error()))?;
        write_atomic(&self.path, &bytes)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<RejectionRow>> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
