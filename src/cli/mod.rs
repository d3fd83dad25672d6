pub mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::info;

use crate::utils::logging;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Debug-level logging for the crawler
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

/// Fetch strategy used for every request
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EngineKind {
    /// Plain HTTP only
    Static,
    /// HTTP with per-host fallback to browser rendering
    Smart,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl starting from a URL
    Crawl {
        /// Start URL
        #[arg(required = true)]
        url: String,

        /// Configuration file (defaults to the user config directory)
        #[arg(short, long)]
        config: Option<PathBuf>,

        #[arg(short, long, value_enum, default_value_t = EngineKind::Smart)]
        engine: EngineKind,

        /// Queue ordering
        #[arg(short, long, value_parser = ["bfs", "dfs"])]
        strategy: Option<String>,

        /// Maximum link depth from the start URL
        #[arg(short, long)]
        depth: Option<u32>,

        /// Maximum number of requests to handle (0 = unlimited)
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Show the persisted state of a crawl
    Status {
        /// Queue ID the crawl ran with
        #[arg(required = true)]
        queue_id: String,

        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Show or initialize the configuration
    Config {
        /// Print the effective configuration
        #[arg(short, long)]
        show: bool,

        /// Write the default configuration file
        #[arg(short, long)]
        init: bool,
    },
}

impl Cli {
    pub fn init_logging(&self) -> Result<()> {
        logging::init_logging(self.verbose, self.log_file.clone())
    }
}

pub fn parse_args() -> Cli {
    Cli::parse()
}

pub async fn process_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Crawl {
            url,
            config,
            engine,
            strategy,
            depth,
            limit,
        } => {
            info!("Starting {:?} crawl on {}", engine, url);
            let overrides = commands::CrawlOverrides { strategy, depth, limit };
            commands::crawl(url, config, engine, overrides).await
        }
        Commands::Status { queue_id, config } => {
            info!("Checking status for queue {}", queue_id);
            commands::status(queue_id, config).await
        }
        Commands::Config { show, init } => {
            if init {
                commands::init_config().await?;
            }
            if show || !init {
                commands::show_config().await?;
            }
            Ok(())
        }
    }
}
