//! Schemaflow sync server.
//!
//! Loads `ServerConfig` from an optional TOML file, applies `SCHEMAFLOW_*`
//! environment overrides and then the command line flags, and serves
//! WebSocket sync connections until interrupted.

use clap::Parser;
use log::{info, warn};
use schemaflow_collab::{ServerConfig, SyncServer};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "schemaflow-server", version, about = "Real-time schema sync server")]
struct Args {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, e.g. 0.0.0.0:9090.
    #[arg(short, long)]
    bind: Option<String>,

    /// RocksDB directory; documents stay in memory when unset.
    #[arg(short, long)]
    storage: Option<PathBuf>,

    /// Updates per document before an immediate flush.
    #[arg(long)]
    flush_threshold: Option<u32>,
}

impl Args {
    fn apply(self, config: &mut ServerConfig) {
        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if let Some(storage) = self.storage {
            config.storage_path = Some(storage);
        }
        if let Some(threshold) = self.flush_threshold {
            config.persistence.flush_threshold = threshold;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let args = Args::parse();
    let mut config = ServerConfig::load(args.config.as_deref())?;
    args.apply(&mut config);

    if config.tokens.is_empty() {
        warn!("No tokens configured; every connection will fail authentication");
    }

    let server = SyncServer::new(config)?;
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            info!(
                "Shutting down: {} connections served, {} documents resident",
                stats.total_connections, stats.resident_documents
            );
        }
    }
    Ok(())
}
