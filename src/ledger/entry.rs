use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FailureClass;

/// Processing state of one item.
///
/// `pending → in-progress → {done | pending (retry) | failed-permanent}`.
/// `done` and `failed-permanent` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemState {
    Pending,
    InProgress,
    Done,
    FailedPermanent,
}

impl ItemState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemState::Done | ItemState::FailedPermanent)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ItemState::Pending => "pending",
            ItemState::InProgress => "in-progress",
            ItemState::Done => "done",
            ItemState::FailedPermanent => "failed-permanent",
        }
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttemptOutcome {
    Success,
    Failure,
    InProgress,
}

/// One execution of the operation for an item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based.
    pub number: u32,
    /// Process run that made the attempt.
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: AttemptOutcome,
    pub error_class: Option<FailureClass>,
}

/// A unit of work handed to an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    /// Stable key derived from the source record.
    pub identity: String,
    /// URL for downloads, audio path for transcription.
    pub input: String,
    pub output: PathBuf,
    /// Short human-readable name for progress output.
    pub label: String,
}

/// What a successful operation produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemPayload {
    pub output_path: PathBuf,
    /// Summary such as size or word count.
    pub detail: String,
}

/// Durable state of one identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub identity: String,
    pub state: ItemState,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub last_updated: DateTime<Utc>,
    pub input: String,
    /// Planned at registration and kept for the identity's lifetime, so a
    /// reordered manifest cannot hand this file to another item.
    #[serde(default)]
    pub output_path: Option<PathBuf>,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
}

impl LedgerEntry {
    pub fn new(item: &WorkItem) -> Self {
        Self {
            identity: item.identity.clone(),
            state: ItemState::Pending,
            attempt_count: 0,
            last_error: None,
            last_updated: Utc::now(),
            input: item.input.clone(),
            output_path: Some(item.output.clone()),
            detail: None,
            attempts: Vec::new(),
        }
    }

    /// Marks the entry in-progress and opens a new attempt record.
    /// Returns the attempt number.
    pub fn begin_attempt(&mut self, run_id: &str) -> u32 {
        let number = self.attempts.len() as u32 + 1;
        let now = Utc::now();
        self.attempts.push(AttemptRecord {
            number,
            run_id: run_id.to_string(),
            started_at: now,
            finished_at: None,
            outcome: AttemptOutcome::InProgress,
            error_class: None,
        });
        self.state = ItemState::InProgress;
        self.last_updated = now;
        number
    }

    /// Closes the open attempt record, if any.
    pub fn finish_attempt(&mut self, outcome: AttemptOutcome, error_class: Option<FailureClass>) {
        let now = Utc::now();
        if let Some(record) = self
            .attempts
            .last_mut()
            .filter(|r| r.outcome == AttemptOutcome::InProgress)
        {
            record.finished_at = Some(now);
            record.outcome = outcome;
            record.error_class = error_class;
        }
        self.last_updated = now;
    }

    /// Returns an in-progress entry to pending without charging the attempt.
    /// Used on crash recovery and when a systemic error aborts the attempt.
    pub fn release_interrupted(&mut self) -> bool {
        if self.state != ItemState::InProgress {
            return false;
        }
        self.finish_attempt(AttemptOutcome::Failure, Some(FailureClass::Interrupted));
        self.state = ItemState::Pending;
        true
    }
}
