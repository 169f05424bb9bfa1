//! Medir CLI - bit-level utilization analysis of model weights
//!
//! Fetch a model's safetensors files and measure how much of each tensor's
//! sign, exponent and mantissa allocation the weights actually use.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;

use medir::cli::{self, AnalyzeOptions, MetadataOptions};
use medir::error::MedirError;
use medir::pipeline::Cancellation;

/// Medir - bit-level utilization analysis of model weights
#[derive(Parser)]
#[command(name = "medir")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze how well the bits in a model's weights are used
    Analyze {
        /// HuggingFace repository, e.g. "meta-llama/Llama-3.2-1B"
        #[arg(long)]
        hf_repo: String,

        /// HuggingFace token; falls back to the HF_TOKEN environment variable
        #[arg(long)]
        hf_token: Option<String>,

        /// Glob selecting repository files
        #[arg(long, default_value = "*.safetensors")]
        hf_glob: String,

        /// Regular expression selecting tensors by name
        #[arg(long, default_value = ".*")]
        filter: String,

        /// Write the full analysis document to this path
        #[arg(long)]
        json: Option<PathBuf>,
    },
    /// Print tensor-type histograms and archive metadata
    Metadata {
        /// Local safetensors file to inspect
        #[arg(long, conflicts_with = "hf_repo")]
        name: Option<PathBuf>,

        /// HuggingFace repository, e.g. "meta-llama/Llama-3.2-1B"
        #[arg(long)]
        hf_repo: Option<String>,

        /// HuggingFace token; falls back to the HF_TOKEN environment variable
        #[arg(long)]
        hf_token: Option<String>,

        /// Glob selecting repository files
        #[arg(long, default_value = "*.safetensors")]
        hf_glob: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let cancel = Cancellation::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            wait_for_shutdown().await;
            info!("quitting");
            cancel.cancel();
        }
    });

    let result = match cli.command {
        Commands::Analyze {
            hf_repo,
            hf_token,
            hf_glob,
            filter,
            json,
        } => {
            cli::cmd_analyze(
                AnalyzeOptions {
                    hf_repo,
                    hf_token,
                    hf_glob,
                    filter,
                    json,
                },
                cancel,
            )
            .await
        }
        Commands::Metadata {
            name,
            hf_repo,
            hf_token,
            hf_glob,
        } => {
            cli::cmd_metadata(
                MetadataOptions {
                    name,
                    hf_repo,
                    hf_token,
                    hf_glob,
                },
                cancel,
            )
            .await
        }
    };

    match result {
        Ok(()) => {}
        // An interrupt already told the user everything they need.
        Err(MedirError::Cancelled) => std::process::exit(1),
        Err(e) => {
            eprintln!("medir: {e}");
            std::process::exit(1);
        }
    }
}

fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "error" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

/// Wait for SIGINT or SIGTERM.
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
