//! Live progress output for a running stage.
//!
//! [`ProgressReporter`] wakes on every ledger mutation (and on a periodic
//! tick), takes a snapshot and hands a [`ProgressSummary`] to a
//! [`ProgressSink`]. It only ever reads the ledger; sink errors are logged
//! and otherwise ignored.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use console::Style;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::ledger::{ItemState, Ledger, LedgerSnapshot, StateCounts};

const MAX_LABEL: usize = 60;

/// Point-in-time view of a stage's progress.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSummary {
    pub stage: String,
    pub counts: StateCounts,
    /// Share of entries in a terminal state, 0–100.
    pub percent: f64,
    pub elapsed: Duration,
    /// Estimated time to finish, from this run's completion rate.
    pub eta: Option<Duration>,
    /// Identities currently being worked on.
    pub active: Vec<String>,
}

impl ProgressSummary {
    /// `baseline_finished` is the number of terminal entries when the run
    /// started; only items finished since then feed the estimate.
    pub fn compute(
        stage: &str,
        snapshot: &LedgerSnapshot,
        baseline_finished: usize,
        elapsed: Duration,
    ) -> Self {
        let counts = snapshot.counts();
        let total = counts.total();
        let percent = if total == 0 {
            100.0
        } else {
            counts.finished() as f64 * 100.0 / total as f64
        };

        let finished_now = counts.finished().saturating_sub(baseline_finished);
        let remaining = counts.pending + counts.in_progress;
        let eta = (finished_now > 0).then(|| {
            let per_item = elapsed.as_secs_f64() / finished_now as f64;
            Duration::from_secs_f64(per_item * remaining as f64)
        });

        let active = snapshot
            .in_state(ItemState::InProgress)
            .map(|e| e.identity.clone())
            .collect();

        Self {
            stage: stage.to_string(),
            counts,
            percent,
            elapsed,
            eta,
            active,
        }
    }
}

/// Destination for progress summaries.
pub trait ProgressSink: Send + 'static {
    fn render(&mut self, summary: &ProgressSummary) -> Result<()>;

    fn finish(&mut self, summary: &ProgressSummary) -> Result<()>;
}

/// Interactive terminal output: one bar for the stage and one spinner per
/// item in flight.
pub struct TerminalSink {
    multi: MultiProgress,
    main: ProgressBar,
    spinner_style: ProgressStyle,
    workers: HashMap<String, ProgressBar>,
    green: Style,
    red: Style,
    yellow: Style,
}

impl TerminalSink {
    pub fn new(stage: &str) -> Result<Self> {
        let multi = MultiProgress::with_draw_target(ProgressDrawTarget::stderr());
        let main = multi.add(ProgressBar::new(0));
        main.set_style(
            ProgressStyle::with_template(
                "{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} {percent}% {msg}",
            )?
            .progress_chars("=> "),
        );
        main.set_prefix(stage.to_string());

        let spinner_style = ProgressStyle::with_template("  {spinner:.cyan} {msg}")?;

        Ok(Self {
            multi,
            main,
            spinner_style,
            workers: HashMap::new(),
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        })
    }

    fn sync_workers(&mut self, active: &[String]) {
        self.workers.retain(|identity, pb| {
            let keep = active.contains(identity);
            if !keep {
                pb.finish_and_clear();
            }
            keep
        });
        for identity in active {
            if self.workers.contains_key(identity) {
                continue;
            }
            let pb = self.multi.add(ProgressBar::new_spinner());
            pb.set_style(self.spinner_style.clone());
            pb.set_message(truncate(identity, MAX_LABEL));
            pb.enable_steady_tick(Duration::from_millis(100));
            self.workers.insert(identity.clone(), pb);
        }
    }
}

impl ProgressSink for TerminalSink {
    fn render(&mut self, summary: &ProgressSummary) -> Result<()> {
        let counts = &summary.counts;
        self.main.set_length(counts.total() as u64);
        self.main.set_position(counts.finished() as u64);
        self.main.set_message(format!(
            "{} {} {} {} pending · eta {}",
            self.green.apply_to(format!("{} done", counts.done)),
            self.red.apply_to(format!("{} failed", counts.failed)),
            self.yellow.apply_to(format!("{} active", counts.in_progress)),
            counts.pending,
            summary.eta.map(format_duration).unwrap_or_else(|| "--".into()),
        ));
        self.sync_workers(&summary.active);
        Ok(())
    }

    fn finish(&mut self, summary: &ProgressSummary) -> Result<()> {
        self.sync_workers(&[]);
        self.main.finish_and_clear();
        let counts = &summary.counts;
        self.multi.println(format!(
            "  {} {}: {} done in {}",
            self.green.apply_to("✓"),
            summary.stage,
            counts.done,
            format_duration(summary.elapsed),
        ))?;
        if counts.failed > 0 {
            self.multi.println(format!(
                "  {} {}: {} failed permanently",
                self.red.apply_to("✗"),
                summary.stage,
                counts.failed,
            ))?;
        }
        if counts.pending > 0 {
            self.multi.println(format!(
                "  {} {}: {} still pending",
                self.yellow.apply_to("↻"),
                summary.stage,
                counts.pending,
            ))?;
        }
        Ok(())
    }
}

/// Plain log lines, for non-interactive runs. Only logs when counts change.
#[derive(Default)]
pub struct LogSink {
    last: Option<StateCounts>,
}

impl ProgressSink for LogSink {
    fn render(&mut self, summary: &ProgressSummary) -> Result<()> {
        if self.last == Some(summary.counts) {
            return Ok(());
        }
        self.last = Some(summary.counts);
        info!(
            stage = %summary.stage,
            done = summary.counts.done,
            failed = summary.counts.failed,
            in_progress = summary.counts.in_progress,
            pending = summary.counts.pending,
            percent = %format!("{:.1}", summary.percent),
            eta = %summary.eta.map(format_duration).unwrap_or_default(),
            "progress"
        );
        Ok(())
    }

    fn finish(&mut self, summary: &ProgressSummary) -> Result<()> {
        info!(
            stage = %summary.stage,
            done = summary.counts.done,
            failed = summary.counts.failed,
            pending = summary.counts.pending,
            elapsed = %format_duration(summary.elapsed),
            "stage finished"
        );
        Ok(())
    }
}

/// Handle to the background reporting task.
pub struct ProgressReporter {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl ProgressReporter {
    pub fn spawn<S: ProgressSink>(
        stage: &str,
        ledger: Arc<Ledger>,
        mut sink: S,
        tick: Duration,
    ) -> Self {
        let (stop, mut stop_rx) = oneshot::channel();
        let stage = stage.to_string();
        let handle = tokio::spawn(async move {
            let mut changes = ledger.subscribe();
            let baseline = ledger.snapshot().counts().finished();
            let started = Instant::now();
            let mut interval = tokio::time::interval(tick);

            loop {
                let stopping = tokio::select! {
                    changed = changes.changed() => changed.is_err(),
                    _ = interval.tick() => false,
                    _ = &mut stop_rx => true,
                };
                let summary = ProgressSummary::compute(
                    &stage,
                    &ledger.snapshot(),
                    baseline,
                    started.elapsed(),
                );
                if stopping {
                    if let Err(e) = sink.finish(&summary) {
                        debug!(error = %e, "progress sink failed to finish");
                    }
                    break;
                }
                if let Err(e) = sink.render(&summary) {
                    debug!(error = %e, "progress sink failed to render");
                }
            }
        });
        Self { stop, handle }
    }

    /// Renders the final summary and waits for the task to exit.
    pub async fn finish(self) {
        let _ = self.stop.send(());
        if let Err(e) = self.handle.await {
            debug!(error = %e, "progress task ended abnormally");
        }
    }
}

/// Formats a duration as `1h02m03s`, `2m03s` or `3s`.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h{m:02}m{s:02}s")
    } else if m > 0 {
        format!("{m}m{s:02}s")
    } else {
        format!("{s}s")
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max.saturating_sub(1)).collect();
    format!("{cut}…")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::WorkItem;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn item(identity: &str) -> WorkItem {
        WorkItem {
            identity: identity.to_string(),
            input: identity.to_string(),
            output: PathBuf::from(identity),
            label: identity.to_string(),
        }
    }

    fn set_state(ledger: &Ledger, identity: &str, state: ItemState) {
        let mut entry = ledger.get(identity).unwrap();
        entry.state = state;
        ledger.upsert(entry).unwrap();
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        rendered: Arc<Mutex<Vec<ProgressSummary>>>,
        finished: Arc<Mutex<Option<ProgressSummary>>>,
    }

    impl ProgressSink for RecordingSink {
        fn render(&mut self, summary: &ProgressSummary) -> Result<()> {
            self.rendered.lock().unwrap().push(summary.clone());
            Ok(())
        }

        fn finish(&mut self, summary: &ProgressSummary) -> Result<()> {
            *self.finished.lock().unwrap() = Some(summary.clone());
            Ok(())
        }
    }

    struct BrokenSink;

    impl ProgressSink for BrokenSink {
        fn render(&mut self, _: &ProgressSummary) -> Result<()> {
            anyhow::bail!("stderr closed")
        }

        fn finish(&mut self, _: &ProgressSummary) -> Result<()> {
            anyhow::bail!("stderr closed")
        }
    }

    #[test]
    fn summary_counts_and_eta() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::load(dir.path()).unwrap();
        ledger
            .register(&[item("a"), item("b"), item("c"), item("d")])
            .unwrap();
        set_state(&ledger, "a", ItemState::Done);
        set_state(&ledger, "b", ItemState::FailedPermanent);
        set_state(&ledger, "c", ItemState::InProgress);

        let summary =
            ProgressSummary::compute("download", &ledger.snapshot(), 0, Duration::from_secs(10));
        assert_eq!(summary.counts.done, 1);
        assert_eq!(summary.counts.failed, 1);
        assert_eq!(summary.percent, 50.0);
        assert_eq!(summary.active, vec!["c".to_string()]);
        // Two finished in 10s, two remaining.
        assert_eq!(summary.eta, Some(Duration::from_secs(10)));

        let summary =
            ProgressSummary::compute("download", &ledger.snapshot(), 2, Duration::from_secs(10));
        assert_eq!(summary.eta, None);
    }

    #[test]
    fn empty_ledger_is_complete() {
        let summary =
            ProgressSummary::compute("transcribe", &LedgerSnapshot::default(), 0, Duration::ZERO);
        assert_eq!(summary.percent, 100.0);
        assert!(summary.active.is_empty());
    }

    #[tokio::test]
    async fn reporter_observes_mutations_without_changing_state() {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(Ledger::load(dir.path()).unwrap());
        ledger.register(&[item("a"), item("b")]).unwrap();
        let before = ledger.snapshot();

        let sink = RecordingSink::default();
        let reporter = ProgressReporter::spawn(
            "download",
            ledger.clone(),
            sink.clone(),
            Duration::from_millis(5),
        );
        set_state(&ledger, "a", ItemState::Done);
        tokio::time::sleep(Duration::from_millis(30)).await;
        reporter.finish().await;

        assert!(!sink.rendered.lock().unwrap().is_empty());
        let finished = sink.finished.lock().unwrap().clone().unwrap();
        assert_eq!(finished.counts.done, 1);
        assert_eq!(finished.counts.pending, 1);

        let after = ledger.snapshot();
        assert_eq!(after.state_of("b"), before.state_of("b"));
    }

    #[tokio::test]
    async fn broken_sink_does_not_disturb_callers() {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(Ledger::load(dir.path()).unwrap());
        ledger.register(&[item("a")]).unwrap();

        let reporter = ProgressReporter::spawn(
            "download",
            ledger.clone(),
            BrokenSink,
            Duration::from_millis(5),
        );
        set_state(&ledger, "a", ItemState::Done);
        tokio::time::sleep(Duration::from_millis(20)).await;
        reporter.finish().await;

        assert_eq!(ledger.get("a").unwrap().state, ItemState::Done);
    }

    #[test]
    fn duration_formatting() {
        assert_eq!(format_duration(Duration::from_secs(3)), "3s");
        assert_eq!(format_duration(Duration::from_secs(123)), "2m03s");
        assert_eq!(format_duration(Duration::from_secs(3723)), "1h02m03s");
    }

    #[test]
    fn labels_are_truncated() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghijkl", 5), "abcd…");
    }
}
