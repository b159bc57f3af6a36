use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ledger::ItemState;

/// Errors that stop a stage as a whole rather than a single item.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Ledger write failed at {path}: {source}")]
    LedgerWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Ledger in {dir} is in use by another podscribe process: {source}")]
    LedgerLocked {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Refusing to move {identity} from {from} to {to}")]
    InvalidTransition {
        identity: String,
        from: ItemState,
        to: ItemState,
    },

    #[error("Systemic failure while processing {identity}: {error}")]
    Systemic { identity: String, error: ItemError },

    #[error("Worker task failed: {0}")]
    Worker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// How a failure is treated by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Worth retrying (network blip, resource contention).
    Transient,
    /// Unlikely to succeed on retry, but still subject to the retry cap.
    Permanent,
    /// Not attributable to one item. Halts the pool.
    Systemic,
}

/// Error classification recorded on failed attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureClass {
    Network,
    NotFound,
    MalformedUrl,
    Io,
    StorageFull,
    DecodeError,
    RecognitionError,
    ResourceExhausted,
    MissingTool,
    /// The operation panicked or its task was aborted.
    Crashed,
    /// The process stopped while the attempt was in flight.
    Interrupted,
}

impl FailureClass {
    pub fn kind(self) -> ErrorKind {
        match self {
            FailureClass::Network
            | FailureClass::Io
            | FailureClass::ResourceExhausted
            | FailureClass::Crashed
            | FailureClass::Interrupted => ErrorKind::Transient,
            FailureClass::NotFound
            | FailureClass::MalformedUrl
            | FailureClass::DecodeError
            | FailureClass::RecognitionError => ErrorKind::Permanent,
            FailureClass::StorageFull | FailureClass::MissingTool => ErrorKind::Systemic,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureClass::Network => "network",
            FailureClass::NotFound => "not-found",
            FailureClass::MalformedUrl => "malformed-url",
            FailureClass::Io => "io",
            FailureClass::StorageFull => "storage-full",
            FailureClass::DecodeError => "decode-error",
            FailureClass::RecognitionError => "recognition-error",
            FailureClass::ResourceExhausted => "resource-exhausted",
            FailureClass::MissingTool => "missing-tool",
            FailureClass::Crashed => "crashed",
            FailureClass::Interrupted => "interrupted",
        }
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by a per-item operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{class}: {message}")]
pub struct ItemError {
    pub class: FailureClass,
    pub message: String,
}

impl ItemError {
    pub fn new(class: FailureClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    /// Classifies a filesystem error. A full disk is systemic, anything else
    /// is charged to the item.
    pub fn from_io(err: &std::io::Error) -> Self {
        let class = match err.kind() {
            std::io::ErrorKind::StorageFull => FailureClass::StorageFull,
            _ => FailureClass::Io,
        };
        Self::new(class, err.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        self.class.kind()
    }

    pub fn is_systemic(&self) -> bool {
        self.kind() == ErrorKind::Systemic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_class_kinds() {
        assert_eq!(FailureClass::Network.kind(), ErrorKind::Transient);
        assert_eq!(FailureClass::MalformedUrl.kind(), ErrorKind::Permanent);
        assert_eq!(FailureClass::DecodeError.kind(), ErrorKind::Permanent);
        assert_eq!(FailureClass::StorageFull.kind(), ErrorKind::Systemic);
        assert_eq!(FailureClass::MissingTool.kind(), ErrorKind::Systemic);
    }

    #[test]
    fn failure_class_serializes_kebab_case() {
        let json = serde_json::to_string(&FailureClass::ResourceExhausted).unwrap();
        assert_eq!(json, "\"resource-exhausted\"");
        assert_eq!(FailureClass::NotFound.to_string(), "not-found");
    }

    #[test]
    fn item_error_display() {
        let err = ItemError::new(FailureClass::Network, "connection reset");
        assert_eq!(err.to_string(), "network: connection reset");
        assert!(!err.is_systemic());
    }

    #[test]
    fn full_disk_is_systemic() {
        let io = std::io::Error::new(std::io::ErrorKind::StorageFull, "no space left");
        assert!(ItemError::from_io(&io).is_systemic());

        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = ItemError::from_io(&io);
        assert_eq!(err.class, FailureClass::Io);
        assert!(!err.is_systemic());
    }
}
