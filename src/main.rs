use std::error::Error;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use palaver::core::constants::DEFAULT_BASE_URL;
use palaver::ui::chat_loop::{run, ChatLoopOptions};

#[derive(Parser)]
#[command(
    name = "palaver",
    version,
    about = "Terminal chat client for OpenAI-compatible APIs with session history"
)]
struct Cli {
    /// Model to chat with (overrides the persisted selection)
    #[arg(short, long)]
    model: Option<String>,

    /// Base URL of the completion service
    #[arg(long, default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// Bearer credential; omit to use the anonymous tier
    #[arg(short, long)]
    credential: Option<String>,

    /// Path of the state file (defaults to the platform data directory)
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Append logs to this file (set RUST_LOG to control verbosity)
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn init_logging(path: &Path) -> Result<(), Box<dyn Error>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(file)
        .with_ansi(false)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Some(path) = &cli.log_file {
        if let Err(e) = init_logging(path) {
            eprintln!("Error: failed to open log file: {e}");
            process::exit(1);
        }
    }

    let opts = ChatLoopOptions {
        base_url: cli.base_url,
        model: cli.model,
        credential: cli.credential,
        state_path: cli.state_file,
    };

    if let Err(e) = run(opts).await {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
