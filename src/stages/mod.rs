//! The two pipeline stages and their per-item operations.

pub mod download;
pub mod metadata;
pub mod transcribe;

pub use download::{HttpDownloader, download_items};
pub use metadata::{EpisodeMetadata, MetadataLog};
pub use transcribe::{CommandTranscriber, transcription_items};
