//! # docent CLI
//!
//! ## Usage
//!
//! ```bash
//! docent --config ./docent.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docent ask "<question>"` | Ask one question and print the answer |
//! | `docent chat` | Interactive session |
//! | `docent extract` | Print the text extracted from the document |
//! | `docent index info` | Show the precomputed index metadata |
//! | `docent serve` | Start the HTTP server |
//!
//! Logs go to stderr and are controlled by `RUST_LOG`
//! (default `docent=info`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use docent::{chat, config, index, server};

/// docent: ask questions about a PDF document.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. When the file does not exist, built-in defaults are used.
#[derive(Parser)]
#[command(
    name = "docent",
    about = "Ask questions about a PDF document through a hosted LLM",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./docent.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask one question and print the answer.
    Ask {
        question: String,

        /// Stream the answer as it is generated (with post-processing).
        #[arg(long)]
        stream: bool,

        /// Use this PDF instead of `[document] path`.
        #[arg(long)]
        pdf: Option<PathBuf>,
    },

    /// Start an interactive chat session on stdin.
    ///
    /// `/history` reprints the conversation, `/quit` exits.
    Chat {
        #[arg(long)]
        pdf: Option<PathBuf>,
    },

    /// Print the text extracted from the document and its size.
    Extract {
        #[arg(long)]
        pdf: Option<PathBuf>,
    },

    /// Inspect the precomputed similarity index.
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// Start the HTTP server on `[server] bind`.
    Serve,
}

#[derive(Subcommand)]
enum IndexAction {
    /// Print the index metadata and chunk count.
    Info,
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("docent=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging();

    let cfg = config::load_config_or_default(&cli.config)?;

    match cli.command {
        Commands::Ask {
            question,
            stream,
            pdf,
        } => {
            chat::run_ask(&cfg, &question, stream, pdf).await?;
        }
        Commands::Chat { pdf } => {
            chat::run_chat(&cfg, pdf).await?;
        }
        Commands::Extract { pdf } => {
            chat::run_extract(&cfg, pdf).await?;
        }
        Commands::Index { action } => match action {
            IndexAction::Info => {
                index::run_index_info(&cfg).await?;
            }
        },
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
