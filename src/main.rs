//! Stagecache CLI: incremental pipeline runner.

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "stagecache",
    version,
    about = "Incremental pipeline runner with ledger-backed stage caching"
)]
struct Cli {
    /// Garbage-collect superseded ledger rows and artifacts, then exit
    #[arg(long)]
    cleanup: bool,

    /// Path to the pipeline config
    #[arg(short, long, global = true, default_value = "pipeline.yaml")]
    file: PathBuf,

    /// State directory (ledger and artifacts)
    #[arg(long, global = true, default_value = "state")]
    state_dir: PathBuf,

    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<stagecache::cli::Commands>,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let opts = stagecache::cli::GlobalOptions {
        file: cli.file,
        state_dir: cli.state_dir,
        cleanup: cli.cleanup,
    };
    if let Err(e) = stagecache::cli::dispatch(&opts, cli.command) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
