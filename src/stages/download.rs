//! Download stage: manifest rows to audio files under `downloads/`.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use regex::Regex;
use reqwest::{Client, Response, StatusCode, Url, header};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::metadata::{DownloadStatus, EpisodeMetadata, METADATA_FILE, MetadataLog};
use crate::config::PipelineConfig;
use crate::error::{FailureClass, ItemError, PipelineError};
use crate::ledger::{ItemPayload, Ledger, LedgerSnapshot, WorkItem};
use crate::manifest::{ManifestRow, read_manifest};
use crate::pipeline::{Stage, StageOptions, StageReport, run_stage};
use crate::pool::ItemOperation;

/// Search queries per item; each one drops another trailing word.
const SEARCH_ATTEMPTS: usize = 3;

/// Audio links found on episode pages, most specific first.
static AUDIO_URL_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r#"https?://[^"'\s<>]+\.(?:mp3|m4a|aac)(?:\?[^"'\s<>]*)?"#,
        r#"https://dts\.podtrac\.com/[^"'\s<>]+"#,
        r#"https://(?:www|play)\.podtrac\.com/[^"'\s<>]+"#,
        r#"https://chrt\.fm/track/[^"'\s<>]+"#,
        r#"https://pdst\.fm/[^"'\s<>]+"#,
        r#"https://traffic\.megaphone\.fm/[^"'\s<>]+"#,
    ])
});

static TITLE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?is)<title[^>]*>(.*?)</title>",
        r#"(?i)<meta\s+property="og:title"\s+content="([^"]*)""#,
        r"(?is)<h1[^>]*>(.*?)</h1>",
        r#"(?i)<meta\s+name="title"\s+content="([^"]*)""#,
    ])
});

static DESCRIPTION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r#"(?i)<meta\s+name="description"\s+content="([^"]*)""#,
        r#"(?i)<meta\s+property="og:description"\s+content="([^"]*)""#,
        r#"(?is)<div[^>]*class="[^"]*description[^"]*"[^>]*>(.*?)</div>"#,
        r#"(?i)<meta\s+name="twitter:description"\s+content="([^"]*)""#,
    ])
});

static DURATION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?i)duration.*?(\d+:\d+)",
        r#"(?i)"duration":\s*"([^"]*)""#,
        r#"(?i)itemprop="duration"[^>]*>([^<]*)<"#,
        r#"(?i)data-duration="([^"]*)""#,
    ])
});

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().filter_map(|p| Regex::new(p).ok()).collect()
}

/// One work item per manifest row, in manifest order.
///
/// Identities already in `known` keep the output path recorded for them, so
/// reordering or extending the manifest never moves a finished file. New
/// identities take the first free name among `<stem>.mp3`,
/// `<stem>_part2.mp3`, ... that no known or earlier row has claimed.
pub fn download_items(
    rows: &[ManifestRow],
    downloads_dir: &Path,
    today: NaiveDate,
    known: &LedgerSnapshot,
) -> Vec<WorkItem> {
    let mut taken: HashSet<PathBuf> = known
        .entries()
        .filter_map(|e| e.output_path.clone())
        .collect();
    let mut seen_identities = HashSet::new();
    let mut items = Vec::with_capacity(rows.len());

    for row in rows {
        let identity = row.identity();
        if !seen_identities.insert(identity.clone()) {
            continue;
        }
        let output = match known.get(&identity).and_then(|e| e.output_path.clone()) {
            Some(path) => path,
            None => {
                let path = free_output(downloads_dir, &row.file_stem(today), &taken);
                taken.insert(path.clone());
                path
            }
        };
        items.push(WorkItem {
            label: output
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| identity.clone()),
            identity,
            input: row.hyperlink.trim().to_string(),
            output,
        });
    }
    items
}

fn free_output(downloads_dir: &Path, stem: &str, taken: &HashSet<PathBuf>) -> PathBuf {
    let first = downloads_dir.join(format!("{stem}.mp3"));
    if !taken.contains(&first) {
        return first;
    }
    let mut part = 2;
    loop {
        let candidate = downloads_dir.join(format!("{stem}_part{part}.mp3"));
        if !taken.contains(&candidate) {
            return candidate;
        }
        part += 1;
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchResult>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResult {
    #[serde(default)]
    track_name: String,
    track_view_url: Option<String>,
    episode_url: Option<String>,
}

/// Details scraped from an episode page.
#[derive(Debug, Default, PartialEq)]
struct PageDetails {
    title: Option<String>,
    description: Option<String>,
    duration: Option<String>,
    audio_urls: Vec<Url>,
}

/// What one attempt learned on the way to the audio.
#[derive(Debug, Default)]
struct Resolution {
    page: Option<PageDetails>,
    audio_url: Option<Url>,
}

/// Fetches episode audio over HTTP.
///
/// Episode pages (HTML) are scanned for audio links and the first one is
/// fetched. When the hyperlink leads nowhere (no audio link, 404), the
/// episode title is looked up in the podcast search directory, if one is
/// configured. The body is streamed to `<output>.part` and renamed into
/// place, so a retry always starts from an empty file.
pub struct HttpDownloader {
    client: Client,
    episodes: HashMap<String, ManifestRow>,
    search: Option<Url>,
    metadata: Option<MetadataLog>,
}

impl HttpDownloader {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, PipelineError> {
        let client = Client::builder()
            .user_agent(user_agent)
            .connect_timeout(Duration::from_secs(15))
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            episodes: HashMap::new(),
            search: None,
            metadata: None,
        })
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let downloader = Self::new(
            &config.download.user_agent,
            Duration::from_secs(config.download.timeout_secs),
        )?;
        if !config.download.search_fallback {
            return Ok(downloader);
        }
        let endpoint = Url::parse(&config.download.search_url).map_err(|e| {
            PipelineError::Config(format!(
                "invalid download.search_url {:?}: {e}",
                config.download.search_url
            ))
        })?;
        Ok(downloader.with_search(endpoint))
    }

    /// Manifest rows by identity, used for search terms and metadata rows.
    /// The first row wins for a repeated identity.
    pub fn with_episodes(mut self, rows: &[ManifestRow]) -> Self {
        for row in rows {
            self.episodes
                .entry(row.identity())
                .or_insert_with(|| row.clone());
        }
        self
    }

    /// Search endpoint queried with `term`, `entity=podcastEpisode` and
    /// `limit=20`.
    pub fn with_search(mut self, endpoint: Url) -> Self {
        self.search = Some(endpoint);
        self
    }

    pub fn with_metadata(mut self, log: MetadataLog) -> Self {
        self.metadata = Some(log);
        self
    }

    async fn get(&self, url: Url) -> Result<Response, ItemError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(classify_reqwest)?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(ItemError::new(
                FailureClass::NotFound,
                format!("{url} returned {status}"),
            ));
        }
        if !status.is_success() {
            return Err(ItemError::new(
                FailureClass::Network,
                format!("{url} returned {status}"),
            ));
        }
        Ok(response)
    }

    async fn fetch(&self, item: &WorkItem, found: &mut Resolution) -> Result<u64, ItemError> {
        let url = parse_http_url(&item.input)?;
        let response = match self.open_audio(url, found).await {
            Ok(response) => response,
            Err(e) if e.class == FailureClass::NotFound => {
                match self.search_audio(item, found).await? {
                    Some(response) => response,
                    None => return Err(e),
                }
            }
            Err(e) => return Err(e),
        };
        save_response(response, &item.output).await
    }

    /// Returns the audio response for `url`, going through an episode page
    /// when `url` serves HTML.
    async fn open_audio(&self, url: Url, found: &mut Resolution) -> Result<Response, ItemError> {
        let response = self.get(url.clone()).await?;
        if !is_html(&response) {
            found.audio_url = Some(url);
            return Ok(response);
        }

        let page = response.text().await.map_err(classify_reqwest)?;
        let details = extract_page_details(&page);
        let audio = details.audio_urls.first().cloned();
        found.page = Some(details);
        let audio = audio.ok_or_else(|| {
            ItemError::new(FailureClass::NotFound, format!("no audio link found on {url}"))
        })?;
        debug!(%audio, page = %url, "resolved audio link from episode page");
        let response = self.get(audio.clone()).await?;
        found.audio_url = Some(audio);
        Ok(response)
    }

    /// Looks the episode title up in the search directory, dropping trailing
    /// words between queries. Exact title matches are tried before partial
    /// ones, and a result's direct audio URL before its episode page.
    async fn search_audio(
        &self,
        item: &WorkItem,
        found: &mut Resolution,
    ) -> Result<Option<Response>, ItemError> {
        let (Some(endpoint), Some(row)) = (&self.search, self.episodes.get(&item.identity))
        else {
            return Ok(None);
        };
        let cleaned = clean_search_term(&row.episode_title);
        let words: Vec<&str> = cleaned.split_whitespace().collect();

        for dropped in 0..SEARCH_ATTEMPTS.min(words.len()) {
            let term = words[..words.len() - dropped].join(" ");
            let results = match self.search(endpoint, &term).await {
                Ok(results) => results,
                Err(e) if e.class == FailureClass::NotFound => Vec::new(),
                Err(e) => return Err(e),
            };
            debug!(identity = %item.identity, %term, results = results.len(), "searched");

            for result in ranked_matches(&results, &term) {
                let candidates = [&result.episode_url, &result.track_view_url];
                for raw in candidates.into_iter().flatten() {
                    let Ok(url) = parse_http_url(raw) else {
                        continue;
                    };
                    match self.open_audio(url.clone(), found).await {
                        Ok(response) => {
                            info!(identity = %item.identity, %url, "found episode by search");
                            return Ok(Some(response));
                        }
                        Err(e) if e.class == FailureClass::NotFound => {
                            debug!(%url, error = %e, "search result has no audio");
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        Ok(None)
    }

    async fn search(&self, endpoint: &Url, term: &str) -> Result<Vec<SearchResult>, ItemError> {
        let mut url = endpoint.clone();
        url.query_pairs_mut()
            .append_pair("term", term)
            .append_pair("entity", "podcastEpisode")
            .append_pair("limit", "20");
        let response = self.get(url).await?;
        let body: SearchResponse = response.json().await.map_err(|e| {
            ItemError::new(FailureClass::Network, format!("unreadable search response: {e}"))
        })?;
        Ok(body.results)
    }

    /// Writes the attempt's outcome to `metadata.csv`. Failures to write are
    /// logged; they never fail the download.
    fn record_metadata(
        &self,
        item: &WorkItem,
        found: &Resolution,
        result: &Result<u64, ItemError>,
    ) {
        let (Some(log), Some(row)) = (&self.metadata, self.episodes.get(&item.identity)) else {
            return;
        };
        let audio_urls: Vec<&str> = match &found.page {
            Some(page) => page.audio_urls.iter().map(Url::as_str).collect(),
            None => found.audio_url.iter().map(Url::as_str).collect(),
        };
        let page = found.page.as_ref();
        let now = Utc::now();
        let record = EpisodeMetadata {
            episode_title: row.episode_title.trim().to_string(),
            podcast_title: row.podcast_title.trim().to_string(),
            candidate_name: row.candidate_name.trim().to_string(),
            date_posted: row.date_posted.trim().to_string(),
            original_url: item.input.clone(),
            audio_urls: serde_json::to_string(&audio_urls).unwrap_or_default(),
            title: page.and_then(|p| p.title.clone()),
            description: page.and_then(|p| p.description.clone()),
            duration: page.and_then(|p| p.duration.clone()),
            extracted_at: page.map(|_| now),
            downloaded_at: result.is_ok().then_some(now),
            download_path: result.is_ok().then(|| item.output.display().to_string()),
            status: if result.is_ok() {
                DownloadStatus::Completed
            } else {
                DownloadStatus::Failed
            },
            error_message: result.as_ref().err().map(ToString::to_string),
        };
        if let Err(e) = log.record(record) {
            warn!(path = %log.path().display(), error = %e, "could not update episode metadata");
        }
    }
}

impl ItemOperation for HttpDownloader {
    async fn run(&self, item: &WorkItem) -> Result<ItemPayload, ItemError> {
        let mut found = Resolution::default();
        let result = self.fetch(item, &mut found).await;
        self.record_metadata(item, &found, &result);
        let bytes = result?;
        Ok(ItemPayload {
            output_path: item.output.clone(),
            detail: format_size(bytes),
        })
    }
}

/// Runs the download stage for `manifest`.
pub async fn run(
    config: &PipelineConfig,
    manifest: &Path,
    options: &StageOptions,
) -> Result<StageReport> {
    let rows = read_manifest(manifest)
        .with_context(|| format!("failed to read manifest {}", manifest.display()))?;
    let downloads_dir = config.downloads_dir();
    tokio::fs::create_dir_all(&downloads_dir)
        .await
        .with_context(|| format!("failed to create {}", downloads_dir.display()))?;

    let ledger = Ledger::load(config.status_dir(Stage::Download.as_str()))?;
    let today = chrono::Local::now().date_naive();
    let items = download_items(&rows, &downloads_dir, today, &ledger.snapshot());
    let metadata = MetadataLog::open(downloads_dir.join(METADATA_FILE))?;
    let downloader = HttpDownloader::from_config(config)?
        .with_episodes(&rows)
        .with_metadata(metadata);

    let report = run_stage(
        Stage::Download,
        ledger,
        items,
        downloader,
        config.download.workers,
        options,
    )
    .await?;
    Ok(report)
}

fn parse_http_url(raw: &str) -> Result<Url, ItemError> {
    if raw.is_empty() {
        return Err(ItemError::new(FailureClass::MalformedUrl, "missing hyperlink"));
    }
    let url = Url::parse(raw)
        .map_err(|e| ItemError::new(FailureClass::MalformedUrl, format!("{raw:?}: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ItemError::new(
            FailureClass::MalformedUrl,
            format!("unsupported scheme {other:?} in {raw:?}"),
        )),
    }
}

fn classify_reqwest(err: reqwest::Error) -> ItemError {
    let class = if err.is_builder() {
        FailureClass::MalformedUrl
    } else {
        FailureClass::Network
    };
    ItemError::new(class, err.to_string())
}

fn is_html(response: &Response) -> bool {
    response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/html"))
}

fn extract_page_details(page: &str) -> PageDetails {
    PageDetails {
        title: first_capture(&TITLE_PATTERNS, page),
        description: first_capture(&DESCRIPTION_PATTERNS, page),
        duration: first_capture(&DURATION_PATTERNS, page),
        audio_urls: find_audio_urls(page),
    }
}

/// Every distinct audio link on the page, in pattern order.
fn find_audio_urls(page: &str) -> Vec<Url> {
    let mut seen = HashSet::new();
    let mut urls = Vec::new();
    for re in AUDIO_URL_PATTERNS.iter() {
        for m in re.find_iter(page) {
            if let Ok(url) = Url::parse(m.as_str())
                && seen.insert(url.clone())
            {
                urls.push(url);
            }
        }
    }
    urls
}

fn first_capture(patterns: &[Regex], page: &str) -> Option<String> {
    patterns.iter().find_map(|re| {
        let text = re.captures(page)?.get(1)?.as_str().trim();
        (!text.is_empty()).then(|| text.to_string())
    })
}

/// Lowercases and keeps letters, digits, `-` and `_`, one space apart.
fn clean_search_term(text: &str) -> String {
    let spaced: String = text
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                ' '
            }
        })
        .collect();
    spaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Results whose cleaned name equals `term`, then those containing it.
fn ranked_matches<'a>(results: &'a [SearchResult], term: &str) -> Vec<&'a SearchResult> {
    let cleaned: Vec<String> = results
        .iter()
        .map(|r| clean_search_term(&r.track_name))
        .collect();
    let exact = results.iter().zip(&cleaned).filter(|(_, name)| *name == term);
    let partial = results
        .iter()
        .zip(&cleaned)
        .filter(|(_, name)| *name != term && name.contains(term));
    exact.chain(partial).map(|(result, _)| result).collect()
}

async fn save_response(mut response: Response, dest: &Path) -> Result<u64, ItemError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ItemError::from_io(&e))?;
    }
    let partial = partial_path(dest);

    let result = async {
        let mut file = tokio::fs::File::create(&partial)
            .await
            .map_err(|e| ItemError::from_io(&e))?;
        let mut written: u64 = 0;
        while let Some(chunk) = response.chunk().await.map_err(classify_reqwest)? {
            file.write_all(&chunk)
                .await
                .map_err(|e| ItemError::from_io(&e))?;
            written += chunk.len() as u64;
        }
        file.sync_all().await.map_err(|e| ItemError::from_io(&e))?;
        drop(file);
        tokio::fs::rename(&partial, dest)
            .await
            .map_err(|e| ItemError::from_io(&e))?;
        Ok::<u64, ItemError>(written)
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&partial).await;
    }
    result
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

fn format_size(bytes: u64) -> String {
    format!("{:.1}M", bytes as f64 / (1024.0 * 1024.0))
}
