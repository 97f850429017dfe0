//! CLI commands implementation.
//!
//! This module contains the CLI parser and dispatches to command-specific modules.

mod fetch;
mod helpers;
mod inspect;
mod queue;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::access::{EscalationMode, Strategy};
use crate::config::{load_settings_with_options, LoadOptions};

#[derive(Parser)]
#[command(name = "crawl-access")]
#[command(about = "Adaptive access controller for crawling bot-defended websites")]
#[command(version)]
pub struct Cli {
    /// Data directory for queue, caches and logs (overrides config file)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Config file path (overrides auto-discovery)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(clap::Args, Debug, Clone)]
pub struct FetchArgs {
    /// URLs to fetch
    #[arg(required = true)]
    pub urls: Vec<String>,
    /// Number of concurrent workers (default: from config, else 4)
    #[arg(short, long)]
    pub jobs: Option<usize>,
    /// Maximum attempts per URL
    #[arg(long)]
    pub access_max_attempts: Option<u32>,
    /// Escalation mode
    #[arg(long, value_enum)]
    pub access_escalation_mode: Option<EscalationMode>,
    /// Initial strategy (requests, js, stealth, stealth_patient, visible)
    #[arg(long)]
    pub strategy: Option<Strategy>,
    /// Domain tier; tier 1 failures are queued with high priority
    #[arg(long)]
    pub tier: Option<u8>,
    /// Playbook file (overrides config)
    #[arg(long)]
    pub playbooks: Option<PathBuf>,
    /// Run file (YAML) with method/patient/delay settings
    #[arg(long)]
    pub run_spec: Option<PathBuf>,
    /// Do not route failures to the manual-review queue
    #[arg(long)]
    pub no_queue: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch URLs through the adaptive access ladder
    Fetch(FetchArgs),

    /// Classify a saved response body
    Classify {
        /// File containing the response body
        file: PathBuf,
        /// HTTP status the body was served with
        #[arg(long)]
        status: Option<u16>,
        /// Content-Type header value
        #[arg(long, default_value = "text/html")]
        content_type: String,
        /// URL the body came from (used for recon lookup)
        #[arg(long)]
        url: Option<String>,
    },

    /// Manage the manual-review queue
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },

    /// Inspect the per-domain strategy cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Subcommand)]
enum QueueCommands {
    /// List queued domains
    List,
    /// Show the next domain to handle
    Next,
    /// Mark a domain as handled manually
    Complete {
        domain: String,
        /// Pages collected
        #[arg(long, default_value = "0")]
        pages: u64,
        /// Words collected
        #[arg(long, default_value = "0")]
        words: u64,
    },
    /// Remove every waiting entry
    Clear,
    /// Check whether a domain is flagged perpetual manual
    Perpetual { domain: String },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Show cached strategies
    Show {
        /// Only this domain
        domain: Option<String>,
    },
}

/// Run the CLI.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let options = LoadOptions {
        config_path: cli.config,
        data_dir: cli.data_dir,
    };
    let (settings, _config) = load_settings_with_options(options).await?;

    match cli.command {
        Commands::Fetch(args) => fetch::cmd_fetch(&settings, args).await,
        Commands::Classify {
            file,
            status,
            content_type,
            url,
        } => inspect::cmd_classify(&settings, &file, status, &content_type, url.as_deref()).await,
        Commands::Queue { command } => match command {
            QueueCommands::List => queue::cmd_queue_list(&settings).await,
            QueueCommands::Next => queue::cmd_queue_next(&settings).await,
            QueueCommands::Complete {
                domain,
                pages,
                words,
            } => queue::cmd_queue_complete(&settings, &domain, pages, words).await,
            QueueCommands::Clear => queue::cmd_queue_clear(&settings).await,
            QueueCommands::Perpetual { domain } => {
                queue::cmd_queue_perpetual(&settings, &domain).await
            }
        },
        Commands::Cache { command } => match command {
            CacheCommands::Show { domain } => inspect::cmd_cache_show(&settings, domain.as_deref()),
        },
    }
}
