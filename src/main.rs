use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use console::{Style, Term};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use podscribe::cli::{Cli, Command, ProgressArg};
use podscribe::config::PipelineConfig;
use podscribe::ledger::{Ledger, RejectionList};
use podscribe::logging::init_tracing;
use podscribe::pipeline::{ProgressMode, REJECTIONS_FILE, Stage, StageOptions, StageReport};
use podscribe::stages::{download, transcribe};

/// How the invocation ended, mapped to the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Complete,
    Failures,
    Interrupted,
}

impl Outcome {
    fn from_reports(reports: &[StageReport]) -> Self {
        if reports.iter().any(|r| r.pool.interrupted) {
            Outcome::Interrupted
        } else if reports.iter().any(StageReport::has_failures) {
            Outcome::Failures
        } else {
            Outcome::Complete
        }
    }

    fn exit_code(self) -> ExitCode {
        match self {
            Outcome::Complete => ExitCode::SUCCESS,
            Outcome::Failures => ExitCode::from(1),
            Outcome::Interrupted => ExitCode::from(130),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(outcome) => outcome.exit_code(),
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<Outcome> {
    let mut config = PipelineConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    config.apply_overrides(&cli.overrides())?;

    let options = StageOptions {
        policy: config.retry_policy(),
        force_retry: cli.force_retry,
        progress: progress_mode(cli.progress),
        shutdown: Some(watch_ctrl_c()),
    };

    let reports = match &cli.command {
        Command::Download { manifest } => {
            vec![download::run(&config, manifest, &options).await?]
        }
        Command::Transcribe => vec![transcribe::run(&config, &options).await?],
        Command::Run { manifest } => {
            let downloaded = download::run(&config, manifest, &options).await?;
            if downloaded.pool.interrupted {
                vec![downloaded]
            } else {
                let transcribed = transcribe::run(&config, &options).await?;
                vec![downloaded, transcribed]
            }
        }
        Command::Status => {
            print_status(&config)?;
            return Ok(Outcome::Complete);
        }
    };

    for report in &reports {
        print_report(report);
    }
    Ok(Outcome::from_reports(&reports))
}

/// Sends `true` on the first Ctrl-C: in-flight items finish, nothing new
/// starts. A second Ctrl-C exits at once with code 130; the attempts it cuts
/// short are left `in-progress` and recovered by the next run.
fn watch_ctrl_c() -> watch::Receiver<bool> {
    let (shutdown, rx) = watch::channel(false);
    let (signals, received) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "cannot listen for Ctrl-C");
                break;
            }
            if signals.send(()).is_err() {
                break;
            }
        }
    });
    tokio::spawn(async move {
        if relay_interrupts(received, shutdown).await {
            std::process::exit(130);
        }
    });
    rx
}

/// Turns interrupt signals into the shutdown channel. Returns `true` when a
/// second signal asks to abort, `false` when the signal source ends first.
async fn relay_interrupts(
    mut signals: mpsc::UnboundedReceiver<()>,
    shutdown: watch::Sender<bool>,
) -> bool {
    if signals.recv().await.is_none() {
        return false;
    }
    warn!("interrupt received, finishing in-flight items (Ctrl-C again to abort)");
    let _ = shutdown.send(true);

    let aborted = signals.recv().await.is_some();
    if aborted {
        warn!("second interrupt, aborting; unfinished items resume on the next run");
    }
    aborted
}

fn progress_mode(arg: ProgressArg) -> ProgressMode {
    match arg {
        ProgressArg::Auto if Term::stderr().is_term() => ProgressMode::Terminal,
        ProgressArg::Auto | ProgressArg::Log => ProgressMode::Log,
        ProgressArg::Terminal => ProgressMode::Terminal,
        ProgressArg::Off => ProgressMode::Off,
    }
}

fn print_report(report: &StageReport) {
    let bold = Style::new().bold();
    let green = Style::new().green();
    let red = Style::new().red();
    let yellow = Style::new().yellow();

    let counts = &report.counts;
    println!(
        "{} {} done, {} failed, {} pending",
        bold.apply_to(format!("[{}]", report.stage)),
        green.apply_to(counts.done),
        red.apply_to(counts.failed),
        yellow.apply_to(counts.pending + counts.in_progress),
    );
    if report.pool.interrupted {
        println!("  {}", yellow.apply_to("interrupted; rerun to continue"));
    }
    if report.has_failures() {
        println!("  rejected items: {}", report.rejections_path.display());
    }
    info!(
        stage = %report.stage,
        dispatched = report.pool.dispatched,
        retried = report.pool.retried,
        status = %report.status_path.display(),
        "stage summary"
    );
}

fn print_status(config: &PipelineConfig) -> Result<()> {
    let bold = Style::new().bold();
    let dim = Style::new().dim();
    let red = Style::new().red();

    for stage in Stage::ALL {
        let dir = config.status_dir(stage.as_str());
        println!("{}", bold.apply_to(stage));
        if !dir.is_dir() {
            println!("  {}", dim.apply_to("no ledger yet"));
            continue;
        }

        // Read-only: a run may hold the ledger right now.
        let snapshot = Ledger::inspect(&dir)
            .with_context(|| format!("failed to read ledger in {}", dir.display()))?;
        let counts = snapshot.counts();
        println!(
            "  {} total: {} done, {} failed, {} pending, {} in progress",
            counts.total(),
            counts.done,
            counts.failed,
            counts.pending,
            counts.in_progress,
        );

        for row in RejectionList::read(&dir.join(REJECTIONS_FILE))? {
            println!(
                "  {} {} ({} attempts): {}",
                red.apply_to("x"),
                row.identity,
                row.attempts,
                dim.apply_to(&row.last_error),
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_interrupt_drains_and_second_aborts() {
        let (signals, received) = mpsc::unbounded_channel();
        let (shutdown, mut rx) = watch::channel(false);
        let relay = tokio::spawn(relay_interrupts(received, shutdown));

        signals.send(()).unwrap();
        rx.wait_for(|stop| *stop).await.unwrap();
        assert!(!relay.is_finished());

        signals.send(()).unwrap();
        assert!(relay.await.unwrap());
    }

    #[tokio::test]
    async fn signal_source_ending_does_not_abort() {
        let (signals, received) = mpsc::unbounded_channel();
        let (shutdown, rx) = watch::channel(false);
        let relay = tokio::spawn(relay_interrupts(received, shutdown));

        signals.send(()).unwrap();
        drop(signals);
        assert!(!relay.await.unwrap());
        assert!(*rx.borrow());
    }
}
