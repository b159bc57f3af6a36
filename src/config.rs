//! Configuração do podscribe carregada a partir de `podscribe.toml`.
//!
//! A struct [`PipelineConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! A variável de ambiente `PODSCRIBE_DIR` tem precedência sobre `base_dir`, e
//! as flags da CLI têm precedência sobre ambos
//! (ver [`PipelineConfig::apply_overrides`]).

use std::path::{Path, PathBuf};

use reqwest::Url;
use serde::Deserialize;

use crate::error::PipelineError;
use crate::retry::RetryPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "podscribe.toml";

/// Configuração de nível superior carregada de `podscribe.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Diretório raiz com `downloads/`, `txt/` e `status/`.
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    #[serde(default)]
    pub retry: RetrySection,

    #[serde(default)]
    pub download: DownloadSection,

    #[serde(default)]
    pub transcribe: TranscribeSection,
}

/// Seção `[retry]`, compartilhada pelos dois estágios.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    /// Máximo de retentativas antes de rejeitar um item.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Atraso base em milissegundos para backoff exponencial.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Teto de um único atraso de backoff.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

/// Seção `[download]`.
#[derive(Debug, Clone, Deserialize)]
pub struct DownloadSection {
    #[serde(default = "default_download_workers")]
    pub workers: usize,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Timeout da requisição inteira de um download.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Busca o episódio pelo título quando o hyperlink não leva a um áudio.
    #[serde(default = "default_search_fallback")]
    pub search_fallback: bool,

    /// Endpoint de busca de episódios (API de busca do iTunes).
    #[serde(default = "default_search_url")]
    pub search_url: String,
}

/// Seção `[transcribe]`.
#[derive(Debug, Clone, Deserialize)]
pub struct TranscribeSection {
    #[serde(default = "default_transcribe_workers")]
    pub workers: usize,

    /// Programa de speech-to-text executado para cada arquivo.
    #[serde(default = "default_program")]
    pub program: String,

    /// Argumentos; `{input}` e `{output}` são substituídos.
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// Extensões de áudio consideradas em `downloads/`.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
}

// Valor padrão para o diretório raiz: "podcasts".
fn default_base_dir() -> PathBuf {
    PathBuf::from("podcasts")
}

// Valor padrão para retentativas máximas: 3.
fn default_max_retries() -> u32 {
    3
}

// Valor padrão para o atraso base: 1000ms.
fn default_base_delay_ms() -> u64 {
    1000
}

// Valor padrão para o teto do backoff: 60s.
fn default_max_delay_ms() -> u64 {
    60_000
}

// Valor padrão para workers de download: 4.
fn default_download_workers() -> usize {
    4
}

// Valor padrão para o user agent: "podscribe/<versão>".
fn default_user_agent() -> String {
    format!("podscribe/{}", env!("CARGO_PKG_VERSION"))
}

// Valor padrão para o timeout de download: 600s.
fn default_timeout_secs() -> u64 {
    600
}

// Valor padrão para a busca de fallback: ligada.
fn default_search_fallback() -> bool {
    true
}

// Valor padrão para o endpoint de busca: API do iTunes.
fn default_search_url() -> String {
    "https://itunes.apple.com/search".to_string()
}

// Valor padrão para workers de transcrição: 2.
fn default_transcribe_workers() -> usize {
    2
}

// Valor padrão para o programa de transcrição: "whisper-cli".
fn default_program() -> String {
    "whisper-cli".to_string()
}

// Valor padrão para os argumentos: saída de texto do whisper.cpp.
fn default_args() -> Vec<String> {
    ["-f", "{input}", "-otxt", "-of", "{output}"]
        .map(String::from)
        .to_vec()
}

// Valor padrão para as extensões de áudio: só "mp3".
fn default_extensions() -> Vec<String> {
    vec!["mp3".to_string()]
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for DownloadSection {
    fn default() -> Self {
        Self {
            workers: default_download_workers(),
            user_agent: default_user_agent(),
            timeout_secs: default_timeout_secs(),
            search_fallback: default_search_fallback(),
            search_url: default_search_url(),
        }
    }
}

impl Default for TranscribeSection {
    fn default() -> Self {
        Self {
            workers: default_transcribe_workers(),
            program: default_program(),
            args: default_args(),
            extensions: default_extensions(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            retry: RetrySection::default(),
            download: DownloadSection::default(),
            transcribe: TranscribeSection::default(),
        }
    }
}

/// Valores vindos da linha de comando; `None` mantém o valor configurado.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub base_dir: Option<PathBuf>,
    pub workers: Option<usize>,
    pub max_retries: Option<u32>,
}

impl PipelineConfig {
    /// Carrega a configuração de `path`.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<PipelineConfig>(&contents)?
        } else {
            Self::default()
        };

        // Variável de ambiente tem precedência sobre o arquivo para o diretório raiz.
        if let Ok(dir) = std::env::var("PODSCRIBE_DIR")
            && !dir.is_empty()
        {
            config.base_dir = PathBuf::from(dir);
        }

        config.validate()?;
        Ok(config)
    }

    /// Aplica as flags da CLI e valida o resultado.
    pub fn apply_overrides(&mut self, overrides: &Overrides) -> Result<(), PipelineError> {
        if let Some(dir) = &overrides.base_dir {
            self.base_dir = dir.clone();
        }
        if let Some(workers) = overrides.workers {
            self.download.workers = workers;
            self.transcribe.workers = workers;
        }
        if let Some(max_retries) = overrides.max_retries {
            self.retry.max_retries = max_retries;
        }
        self.validate()
    }

    fn validate(&self) -> Result<(), PipelineError> {
        if self.download.workers == 0 || self.transcribe.workers == 0 {
            return Err(PipelineError::Config(
                "worker count must be at least 1".into(),
            ));
        }
        if self.transcribe.program.trim().is_empty() {
            return Err(PipelineError::Config(
                "transcribe.program must not be empty".into(),
            ));
        }
        if self.download.search_fallback && Url::parse(&self.download.search_url).is_err() {
            return Err(PipelineError::Config(format!(
                "download.search_url {:?} is not a valid URL",
                self.download.search_url
            )));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            base_delay_ms: self.retry.base_delay_ms,
            max_delay_ms: self.retry.max_delay_ms,
        }
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.base_dir.join("downloads")
    }

    pub fn transcripts_dir(&self) -> PathBuf {
        self.base_dir.join("txt")
    }

    /// Diretório do ledger de um estágio, ex.: `status/download`.
    pub fn status_dir(&self, stage: &str) -> PathBuf {
        self.base_dir.join("status").join(stage)
    }
}
