//! Wiring for one stage run: ledger, rejection list, source, pool and
//! progress reporter.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::ledger::{Ledger, RejectionList, StateCounts, WorkItem};
use crate::pool::{ItemOperation, PoolReport, WorkerPool};
use crate::progress::{LogSink, ProgressReporter, TerminalSink};
use crate::retry::{RetryCoordinator, RetryPolicy};
use crate::source::pending_items;

pub const STATUS_FILE: &str = "status.csv";
pub const REJECTIONS_FILE: &str = "retry_list.csv";

const PROGRESS_TICK: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Download,
    Transcribe,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Download => "download",
            Stage::Transcribe => "transcribe",
        }
    }

    pub const ALL: [Stage; 2] = [Stage::Download, Stage::Transcribe];
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How progress is shown while a stage runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressMode {
    Terminal,
    Log,
    Off,
}

/// Settings shared by every stage of one invocation.
#[derive(Debug, Clone)]
pub struct StageOptions {
    pub policy: RetryPolicy,
    /// Give `failed-permanent` items a fresh attempt budget.
    pub force_retry: bool,
    pub progress: ProgressMode,
    pub shutdown: Option<watch::Receiver<bool>>,
}

impl StageOptions {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            force_retry: false,
            progress: ProgressMode::Off,
            shutdown: None,
        }
    }
}

/// Outcome of one stage run.
#[derive(Debug, Clone)]
pub struct StageReport {
    pub stage: Stage,
    pub pool: PoolReport,
    /// Ledger counts after the run, including items not in this run's input.
    pub counts: StateCounts,
    pub status_path: PathBuf,
    pub rejections_path: PathBuf,
}

impl StageReport {
    pub fn is_complete(&self) -> bool {
        !self.pool.interrupted && self.counts.pending == 0 && self.counts.in_progress == 0
    }

    pub fn has_failures(&self) -> bool {
        self.counts.failed > 0
    }
}

/// Runs `operation` over every eligible candidate and records the outcome in
/// the stage's `ledger`. The status table and rejection list live next to
/// the ledger's records.
///
/// The status table is exported even when the pool stops on an error, so the
/// on-disk view always matches the ledger. The ledger, and with it the
/// directory lock, is released when the stage returns.
pub async fn run_stage<O: ItemOperation>(
    stage: Stage,
    ledger: Ledger,
    candidates: Vec<WorkItem>,
    operation: O,
    workers: usize,
    options: &StageOptions,
) -> Result<StageReport, PipelineError> {
    let status_dir = ledger.dir().to_path_buf();
    let ledger = Arc::new(ledger);
    let rejections_path = status_dir.join(REJECTIONS_FILE);
    let retry = Arc::new(RetryCoordinator::new(
        options.policy.clone(),
        RejectionList::open(&rejections_path)?,
    ));
    retry.reconcile(&ledger.snapshot())?;

    let registered = ledger.register(&candidates)?;
    let snapshot = ledger.snapshot();
    let items: Vec<WorkItem> =
        pending_items(candidates, &snapshot, options.force_retry).collect();
    drop(snapshot);

    if options.force_retry {
        for item in &items {
            if ledger.reset_failed(&item.identity)? {
                retry.rejections().remove(&item.identity)?;
                info!(identity = %item.identity, "failed item reset for retry");
            }
        }
    }

    info!(
        %stage,
        new = registered,
        eligible = items.len(),
        workers,
        "stage starting"
    );

    let reporter = start_reporter(stage, &ledger, options.progress);
    let mut pool = WorkerPool::new(
        workers,
        Arc::clone(&ledger),
        Arc::clone(&retry),
        Arc::new(operation),
    );
    if let Some(shutdown) = &options.shutdown {
        pool = pool.with_shutdown(shutdown.clone());
    }
    let outcome = pool.run(items).await;
    if let Some(reporter) = reporter {
        reporter.finish().await;
    }

    let status_path = status_dir.join(STATUS_FILE);
    let exported = ledger.export_status(&status_path);
    let pool = outcome?;
    exported?;

    let counts = ledger.snapshot().counts();
    Ok(StageReport {
        stage,
        pool,
        counts,
        status_path,
        rejections_path,
    })
}

fn start_reporter(
    stage: Stage,
    ledger: &Arc<Ledger>,
    mode: ProgressMode,
) -> Option<ProgressReporter> {
    let ledger = Arc::clone(ledger);
    match mode {
        ProgressMode::Off => None,
        ProgressMode::Log => Some(ProgressReporter::spawn(
            stage.as_str(),
            ledger,
            LogSink::default(),
            PROGRESS_TICK,
        )),
        ProgressMode::Terminal => match TerminalSink::new(stage.as_str()) {
            Ok(sink) => Some(ProgressReporter::spawn(
                stage.as_str(),
                ledger,
                sink,
                PROGRESS_TICK,
            )),
            Err(e) => {
                warn!(error = %e, "terminal progress unavailable, logging instead");
                Some(ProgressReporter::spawn(
                    stage.as_str(),
                    ledger,
                    LogSink::default(),
                    PROGRESS_TICK,
                ))
            }
        },
    }
}
