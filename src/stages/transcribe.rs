//! Transcription stage: audio files under `downloads/` to text under `txt/`.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::error::{FailureClass, ItemError};
use crate::ledger::{ItemPayload, Ledger, WorkItem};
use crate::pipeline::{Stage, StageOptions, StageReport, run_stage};
use crate::pool::ItemOperation;

const EXHAUSTION_MARKERS: [&str; 4] = [
    "out of memory",
    "cannot allocate",
    "failed to allocate",
    "resource exhausted",
];

/// Lists audio files below `downloads_dir` (recursively, sorted) as work
/// items. Empty files are left out; they are usually downloads still being
/// written by another process.
///
/// The identity is the path relative to `downloads_dir`, `/`-separated. The
/// transcript keeps the full file name and appends `.txt`, so `ep.mp3` and
/// `ep.m4a` never share an output.
pub fn transcription_items(
    downloads_dir: &Path,
    transcripts_dir: &Path,
    extensions: &[String],
) -> Result<Vec<WorkItem>> {
    let mut files = Vec::new();
    if downloads_dir.is_dir() {
        collect_audio(downloads_dir, extensions, &mut files)
            .with_context(|| format!("failed to list {}", downloads_dir.display()))?;
    }
    files.sort();

    let items = files
        .into_iter()
        .filter_map(|path| {
            let relative = path.strip_prefix(downloads_dir).ok()?.to_path_buf();
            let identity = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            Some(WorkItem {
                label: relative
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| identity.clone()),
                identity,
                input: path.display().to_string(),
                output: append_txt(&transcripts_dir.join(&relative)),
            })
        })
        .collect();
    Ok(items)
}

fn collect_audio(
    dir: &Path,
    extensions: &[String],
    out: &mut Vec<PathBuf>,
) -> std::io::Result<()> {
    for dirent in std::fs::read_dir(dir)? {
        let dirent = dirent?;
        let path = dirent.path();
        let file_type = dirent.file_type()?;
        if file_type.is_dir() {
            collect_audio(&path, extensions, out)?;
            continue;
        }
        let matches = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| extensions.iter().any(|want| want.eq_ignore_ascii_case(ext)));
        if !matches {
            continue;
        }
        if dirent.metadata()?.len() == 0 {
            debug!(path = %path.display(), "skipping empty audio file");
            continue;
        }
        out.push(path);
    }
    Ok(())
}

/// Runs an external speech-to-text program once per file.
///
/// `{input}` and `{output}` in the argument template are replaced with the
/// audio path and a hidden temporary output path. The program may write
/// either that path or that path with `.txt` appended. The result is renamed
/// to the item's output, overwriting any earlier transcript.
pub struct CommandTranscriber {
    program: String,
    args: Vec<String>,
}

impl CommandTranscriber {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(&config.transcribe.program, config.transcribe.args.clone())
    }

    fn command(&self, input: &str, output: &Path) -> Command {
        let output = output.display().to_string();
        let mut command = Command::new(&self.program);
        command
            .args(
                self.args
                    .iter()
                    .map(|arg| arg.replace("{input}", input).replace("{output}", &output)),
            )
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

impl ItemOperation for CommandTranscriber {
    async fn run(&self, item: &WorkItem) -> Result<ItemPayload, ItemError> {
        match tokio::fs::metadata(&item.input).await {
            Ok(meta) if meta.len() > 0 => {}
            Ok(_) => {
                return Err(ItemError::new(
                    FailureClass::DecodeError,
                    format!("{} is empty", item.input),
                ));
            }
            Err(e) => {
                return Err(ItemError::new(
                    FailureClass::DecodeError,
                    format!("cannot read {}: {e}", item.input),
                ));
            }
        }

        if let Some(parent) = item.output.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ItemError::from_io(&e))?;
        }
        let partial = partial_path(&item.output);
        let partial_txt = append_txt(&partial);
        remove_if_present(&partial).await;
        remove_if_present(&partial_txt).await;

        let output = match self.command(&item.input, &partial).output().await {
            Ok(output) => output,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ItemError::new(
                    FailureClass::MissingTool,
                    format!("transcription program {:?} not found", self.program),
                ));
            }
            Err(e) => return Err(ItemError::from_io(&e)),
        };

        if !output.status.success() {
            remove_if_present(&partial).await;
            remove_if_present(&partial_txt).await;
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_exit(&self.program, output.status, &stderr));
        }

        let produced = if tokio::fs::try_exists(&partial).await.unwrap_or(false) {
            partial
        } else if tokio::fs::try_exists(&partial_txt).await.unwrap_or(false) {
            partial_txt
        } else {
            return Err(ItemError::new(
                FailureClass::RecognitionError,
                format!("{} exited successfully but wrote no transcript", self.program),
            ));
        };

        let text = tokio::fs::read_to_string(&produced)
            .await
            .map_err(|e| ItemError::from_io(&e))?;
        let words = text.split_whitespace().count();
        if words == 0 {
            remove_if_present(&produced).await;
            return Err(ItemError::new(
                FailureClass::RecognitionError,
                "transcript is empty",
            ));
        }

        tokio::fs::rename(&produced, &item.output)
            .await
            .map_err(|e| ItemError::from_io(&e))?;
        Ok(ItemPayload {
            output_path: item.output.clone(),
            detail: format!("{words} words"),
        })
    }
}

/// Runs the transcription stage over everything currently in `downloads/`.
pub async fn run(config: &PipelineConfig, options: &StageOptions) -> Result<StageReport> {
    let items = transcription_items(
        &config.downloads_dir(),
        &config.transcripts_dir(),
        &config.transcribe.extensions,
    )?;
    if items.is_empty() {
        warn!(dir = %config.downloads_dir().display(), "no audio files to transcribe");
    }

    let ledger = Ledger::load(config.status_dir(Stage::Transcribe.as_str()))?;
    let report = run_stage(
        Stage::Transcribe,
        ledger,
        items,
        CommandTranscriber::from_config(config),
        config.transcribe.workers,
        options,
    )
    .await?;
    Ok(report)
}

fn classify_exit(program: &str, status: std::process::ExitStatus, stderr: &str) -> ItemError {
    let lowered = stderr.to_lowercase();
    let class = if EXHAUSTION_MARKERS.iter().any(|m| lowered.contains(m)) {
        FailureClass::ResourceExhausted
    } else {
        FailureClass::RecognitionError
    };
    let last_line = stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("");
    ItemError::new(
        class,
        format!("{program} exited with {status}: {}", last_line.trim()),
    )
}

/// `txt/show/ep.mp3.txt` -> `txt/show/.ep.mp3.partial`
fn partial_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    output.with_file_name(format!(".{stem}.partial"))
}

fn append_txt(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".txt");
    PathBuf::from(name)
}

async fn remove_if_present(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        debug!(path = %path.display(), error = %e, "could not remove temporary transcript");
    }
}
