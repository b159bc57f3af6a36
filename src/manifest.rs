//! Episode manifest (`master.csv`) and output filename rules.

use std::path::Path;

use chrono::NaiveDate;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::PipelineError;

/// Source tag used as the first filename component.
pub const SOURCE_TAG: &str = "applepodcasts";

const REQUIRED_COLUMNS: [&str; 5] = [
    "Episode title",
    "Podcast title",
    "Candidate name",
    "Date posted",
    "Hyperlink",
];

/// One manifest row; columns not listed here are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ManifestRow {
    #[serde(rename = "Episode title", default)]
    pub episode_title: String,
    #[serde(rename = "Podcast title", default)]
    pub podcast_title: String,
    #[serde(rename = "Candidate name", default)]
    pub candidate_name: String,
    #[serde(rename = "Date posted", default)]
    pub date_posted: String,
    #[serde(rename = "Hyperlink", default)]
    pub hyperlink: String,
}

impl ManifestRow {
    /// Stable key for the ledger: episode title plus podcast title.
    pub fn identity(&self) -> String {
        format!(
            "{} | {}",
            self.episode_title.trim(),
            self.podcast_title.trim()
        )
    }

    /// `applepodcasts_<candidate>_<podcast>_<YYYYMMDD>`, without extension.
    pub fn file_stem(&self, today: NaiveDate) -> String {
        format!(
            "{SOURCE_TAG}_{}_{}_{}",
            clean_component(&self.candidate_name),
            clean_component(&self.podcast_title),
            normalize_date(&self.date_posted, today),
        )
    }
}

/// Reads the manifest in row order, skipping rows without an episode title.
pub fn read_manifest(path: &Path) -> Result<Vec<ManifestRow>, PipelineError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)?;

    let headers = reader.headers()?.clone();
    let missing: Vec<&str> = REQUIRED_COLUMNS
        .iter()
        .copied()
        .filter(|col| !headers.iter().any(|h| h == *col))
        .collect();
    if !missing.is_empty() {
        return Err(PipelineError::Manifest(format!(
            "{} is missing column(s): {}",
            path.display(),
            missing.join(", ")
        )));
    }

    let mut rows = Vec::new();
    for (index, record) in reader.deserialize::<ManifestRow>().enumerate() {
        let row = record?;
        if row.episode_title.is_empty() {
            // Header is line 1.
            warn!(line = index + 2, "skipping manifest row without an episode title");
            continue;
        }
        rows.push(row);
    }
    debug!(path = %path.display(), rows = rows.len(), "manifest loaded");
    Ok(rows)
}

/// Lowercase ASCII letters and digits joined by single underscores.
/// Anything else, including non-ASCII letters, acts as a separator.
pub fn clean_component(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_sep = false;
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(c.to_ascii_lowercase());
        } else if c == '\'' {
            // Apostrophes join words: "Let's" -> "lets".
        } else {
            pending_sep = true;
        }
    }
    if out.is_empty() {
        "unknown".to_string()
    } else {
        out
    }
}

/// Accepts `MM/DD/YYYY` or `YYYYMMDD`; anything else becomes `today`.
pub fn normalize_date(raw: &str, today: NaiveDate) -> String {
    let raw = raw.trim();
    let parsed = if raw.contains('/') {
        NaiveDate::parse_from_str(raw, "%m/%d/%Y")
    } else {
        NaiveDate::parse_from_str(raw, "%Y%m%d")
    };
    parsed.unwrap_or(today).format("%Y%m%d").to_string()
}
