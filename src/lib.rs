//! Resumable two-stage podcast pipeline: download episodes listed in a
//! manifest, then transcribe them, recording every item's progress in a
//! durable per-stage ledger so interrupted runs pick up where they stopped.

pub mod cli;
pub mod config;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod manifest;
pub mod pipeline;
pub mod pool;
pub mod progress;
pub mod retry;
pub mod source;
pub mod stages;

pub use error::{ErrorKind, FailureClass, ItemError, PipelineError};
pub use pipeline::{Stage, StageOptions, StageReport, run_stage};
pub use pool::ItemOperation;
