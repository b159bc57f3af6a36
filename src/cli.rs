//! Interface de linha de comando do podscribe baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (download, transcribe,
//! run, status) e flags globais (--dir, --workers, --max-retries, ...).

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::config::{DEFAULT_CONFIG_FILE, Overrides};

/// podscribe: pipeline retomável de download e transcrição de podcasts.
#[derive(Debug, Parser)]
#[command(name = "podscribe", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Diretório raiz com downloads/, txt/ e status/.
    #[arg(long, short, global = true)]
    pub dir: Option<PathBuf>,

    /// Arquivo de configuração.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Número de workers concorrentes em cada estágio.
    #[arg(
        long,
        short,
        global = true,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub workers: Option<u16>,

    /// Número máximo de retentativas por item antes da rejeição.
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,

    /// Tenta de novo os itens marcados como failed-permanent.
    #[arg(long, global = true, default_value_t = false)]
    pub force_retry: bool,

    /// Modo de exibição do progresso.
    #[arg(long, global = true, value_enum, default_value_t = ProgressArg::Auto)]
    pub progress: ProgressArg,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

/// Modo de progresso aceito pela CLI, mapeado para
/// [`ProgressMode`](crate::pipeline::ProgressMode) internamente.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProgressArg {
    /// Barras em um terminal, linhas de log caso contrário.
    Auto,
    /// Barras de progresso.
    Terminal,
    /// Linhas de log periódicas.
    Log,
    /// Sem progresso.
    Off,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Baixa todos os episódios listados no manifesto.
    Download {
        /// Manifesto de episódios (CSV).
        #[arg(long, short, default_value = "master.csv")]
        manifest: PathBuf,
    },

    /// Transcreve todos os arquivos de áudio baixados.
    Transcribe,

    /// Baixa e depois transcreve.
    Run {
        /// Manifesto de episódios (CSV).
        #[arg(long, short, default_value = "master.csv")]
        manifest: PathBuf,
    },

    /// Mostra as contagens do ledger e os itens rejeitados dos dois estágios.
    Status,
}

impl Cli {
    /// Flags que sobrepõem a configuração carregada.
    pub fn overrides(&self) -> Overrides {
        Overrides {
            base_dir: self.dir.clone(),
            workers: self.workers.map(usize::from),
            max_retries: self.max_retries,
        }
    }
}
