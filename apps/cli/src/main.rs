//! OmniDL CLI - Command-line download client
//!
//! Queues every URL on the command line, downloads them with a bounded
//! number of parallel transfers and resumes from `.tmp` files on `-c`.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// OmniDL - Resumable Download Client
#[derive(Parser)]
#[command(name = "omnidl")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Output format
    #[arg(long, global = true, default_value = "human")]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Download one or more URLs
    Get(GetArgs),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Args)]
struct GetArgs {
    /// URLs to download
    #[arg(required = true)]
    urls: Vec<String>,

    /// Directory to save into (defaults to the current directory)
    #[arg(short = 'd', long, env = "OMNIDL_DIR")]
    dir: Option<PathBuf>,

    /// Maximum simultaneous downloads
    #[arg(short = 'j', long, env = "OMNIDL_JOBS", default_value_t = 3)]
    jobs: u32,

    /// Speed limit in bytes/sec shared by all downloads, 0 for unlimited
    #[arg(long, env = "OMNIDL_LIMIT", default_value_t = 0)]
    limit: u64,

    /// Connect and read timeout in seconds, 0 to wait forever
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    /// Proxy URL for all requests
    #[arg(long, env = "OMNIDL_PROXY")]
    proxy: Option<String>,

    /// Continue from partial files left by an earlier run
    #[arg(short = 'c', long = "continue")]
    resume: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Get(args) => {
            let all_ok = commands::get(args, cli.output).await?;
            if !all_ok {
                return Ok(ExitCode::FAILURE);
            }
        }

        Commands::Completions { shell } => {
            use clap::CommandFactory;
            clap_complete::generate(shell, &mut Cli::command(), "omnidl", &mut std::io::stdout());
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Logs go to stderr; progress bars and JSON lines own stdout
fn init_tracing(verbose: bool) {
    let default = if verbose {
        "omnidl=debug,omnidl_core=debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
