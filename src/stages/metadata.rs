//! `downloads/metadata.csv`: what was learned about each episode while
//! downloading it.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::ledger::write_atomic;

pub const METADATA_FILE: &str = "metadata.csv";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Completed,
    Failed,
}

/// One episode. Rows are keyed by episode title plus podcast title, the same
/// pair the download ledger uses as its identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeMetadata {
    pub episode_title: String,
    pub podcast_title: String,
    #[serde(default)]
    pub candidate_name: String,
    #[serde(default)]
    pub date_posted: String,
    /// Hyperlink from the manifest.
    #[serde(default)]
    pub original_url: String,
    /// JSON array of every audio link seen on the episode page, or of the
    /// single URL fetched when the hyperlink was audio already.
    #[serde(default)]
    pub audio_urls: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub duration: Option<String>,
    pub extracted_at: Option<DateTime<Utc>>,
    pub downloaded_at: Option<DateTime<Utc>>,
    pub download_path: Option<String>,
    pub status: DownloadStatus,
    pub error_message: Option<String>,
}

impl EpisodeMetadata {
    fn same_episode(&self, other: &EpisodeMetadata) -> bool {
        self.episode_title == other.episode_title && self.podcast_title == other.podcast_title
    }
}

/// In-memory copy of `metadata.csv`, rewritten atomically after each change.
pub struct MetadataLog {
    path: PathBuf,
    rows: Mutex<Vec<EpisodeMetadata>>,
}

impl MetadataLog {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PipelineError> {
        let path = path.into();
        let rows = Self::read(&path)?;
        Ok(Self {
            path,
            rows: Mutex::new(rows),
        })
    }

    /// A missing file reads as no rows.
    pub fn read(path: &Path) -> Result<Vec<EpisodeMetadata>, PipelineError> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::Reader::from_path(path)?;
        let mut rows = Vec::new();
        for row in reader.deserialize() {
            rows.push(row?);
        }
        Ok(rows)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Inserts or replaces the row for this episode.
    ///
    /// A failure never replaces a completed row. Returns whether the file
    /// changed.
    pub fn record(&self, row: EpisodeMetadata) -> Result<bool, PipelineError> {
        let mut rows = self.lock();
        match rows.iter_mut().find(|r| r.same_episode(&row)) {
            Some(existing)
                if existing.status == DownloadStatus::Completed
                    && row.status == DownloadStatus::Failed =>
            {
                return Ok(false);
            }
            Some(existing) => *existing = row,
            None => rows.push(row),
        }
        self.persist(&rows)?;
        Ok(true)
    }

    pub fn rows(&self) -> Vec<EpisodeMetadata> {
        self.lock().clone()
    }

    fn persist(&self, rows: &[EpisodeMetadata]) -> Result<(), PipelineError> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        for row in rows {
            writer.serialize(row)?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| PipelineError::Io(e.into_error()))?;
        write_atomic(&self.path, &bytes)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<EpisodeMetadata>> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn row(episode: &str, status: DownloadStatus) -> EpisodeMetadata {
        EpisodeMetadata {
            episode_title: episode.into(),
            podcast_title: "Town Hall".into(),
            candidate_name: "Ann Lee".into(),
            date_posted: "1/15/2024".into(),
            original_url: "https://example.com/ep".into(),
            audio_urls: r#"["https://example.com/ep.mp3"]"#.into(),
            title: Some("Opening Night".into()),
            description: None,
            duration: Some("42:10".into()),
            extracted_at: Some(Utc::now()),
            downloaded_at: None,
            download_path: None,
            status,
            error_message: None,
        }
    }

    #[test]
    fn record_upserts_by_episode_and_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(METADATA_FILE);
        let log = MetadataLog::open(&path).unwrap();

        assert!(log.record(row("one", DownloadStatus::Failed)).unwrap());
        assert!(log.record(row("two", DownloadStatus::Completed)).unwrap());
        let mut done = row("one", DownloadStatus::Completed);
        done.download_path = Some("downloads/one.mp3".into());
        assert!(log.record(done).unwrap());

        let rows = MetadataLog::read(&path).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].episode_title, "one");
        assert_eq!(rows[0].status, DownloadStatus::Completed);
        assert_eq!(rows[0].download_path.as_deref(), Some("downloads/one.mp3"));
        assert_eq!(rows[0].description, None);
        assert_eq!(MetadataLog::open(&path).unwrap().rows(), rows);
    }

    #[test]
    fn failure_does_not_overwrite_completed_row() {
        let dir = TempDir::new().unwrap();
        let log = MetadataLog::open(dir.path().join(METADATA_FILE)).unwrap();
        log.record(row("one", DownloadStatus::Completed)).unwrap();

        let mut failed = row("one", DownloadStatus::Failed);
        failed.error_message = Some("network: reset".into());
        assert!(!log.record(failed).unwrap());
        assert_eq!(log.rows()[0].status, DownloadStatus::Completed);
    }

    #[test]
    fn header_uses_snake_case_columns() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(METADATA_FILE);
        MetadataLog::open(&path)
            .unwrap()
            .record(row("one", DownloadStatus::Completed))
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with(
            "episode_title,podcast_title,candidate_name,date_posted,original_url,audio_urls,\
             title,description,duration,extracted_at,downloaded_at,download_path,status,\
             error_message"
        ));
        assert!(contents.contains(",completed,"));
    }
}
