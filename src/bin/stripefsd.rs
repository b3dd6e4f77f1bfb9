//! stripefsd: node daemon binary.
//!
//! Serves `READ`/`WRITE_PATH`/`WRITE`/`HEARTBEAT` on a TCP port, persisting
//! chunks as flat files under the configured root. One instance per lane;
//! the client decides which lane carries parity.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use stripefs::protocol::CHUNK_SIZE;
use stripefs::server::NodeServer;

#[derive(Parser, Debug)]
#[command(name = "stripefsd", about = "stripefs node daemon")]
struct Cli {
    /// TCP port to listen on.
    #[arg(short, long)]
    port: u16,

    /// Root directory for chunk storage (created if missing).
    #[arg(short, long)]
    root: PathBuf,

    /// Chunk size in bytes (default 1 MiB).
    #[arg(long, default_value_t = CHUNK_SIZE)]
    chunk_size: usize,

    /// Log file (stderr if not set).
    #[arg(short, long)]
    log: Option<PathBuf>,
}

fn init_logging(log: Option<&PathBuf>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "stripefs=info,stripefsd=info".into());
    match log {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log.as_ref())?;

    let server = NodeServer::bind(("0.0.0.0", cli.port), &cli.root, cli.chunk_size)
        .with_context(|| format!("bind port {}", cli.port))?;
    info!(
        port = cli.port,
        root = %cli.root.display(),
        chunk_size = cli.chunk_size,
        "stripefsd listening"
    );
    server.run().context("serve")?;
    Ok(())
}
