//! canvas-server: collaborative pixel canvas over WebSockets.
//!
//! Opens the RocksDB store (or runs in memory with `--memory`), recovers
//! the canvas from the latest snapshot plus the log suffix, and serves
//! `/edit`, `/changes` and `/current`. Exits non-zero if the engine halts.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use canvas_sync::{AggregatorConfig, CanvasServer, EngineConfig, ServerConfig, StoreConfig};
use clap::Parser;
use log::{error, info};

#[derive(Parser, Debug)]
#[command(name = "canvas-server", about = "Collaborative pixel canvas server")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "CANVAS_BIND", default_value = "127.0.0.1:3211")]
    bind: String,
    /// RocksDB directory for the log and snapshots
    #[arg(long, env = "CANVAS_DATA", default_value = "canvas_data")]
    data: PathBuf,
    /// Keep everything in memory (nothing survives a restart)
    #[arg(long, env = "CANVAS_MEMORY")]
    memory: bool,
    /// fsync every append and snapshot
    #[arg(long, env = "CANVAS_SYNC_WRITES")]
    sync_writes: bool,
    /// Checkpoint whenever the version is a multiple of this
    #[arg(long, env = "CANVAS_CHECKPOINT_INTERVAL", default_value_t = 500)]
    checkpoint_interval: u64,
    /// Log entries before the snapshot to reload into the catch-up window
    #[arg(long, env = "CANVAS_WINDOW_PRELOAD", default_value_t = 1000)]
    window_preload: u64,
    /// Catch-up window trim period in seconds
    #[arg(long, env = "CANVAS_TRIM_SECS", default_value_t = 20, value_parser = clap::value_parser!(u64).range(1..))]
    trim_secs: u64,
    /// Fan-out batching window in milliseconds
    #[arg(long, env = "CANVAS_FANOUT_MS", default_value_t = 500)]
    fanout_ms: u64,
    /// Ingest batching window in milliseconds
    #[arg(long, env = "CANVAS_BATCH_MS", default_value_t = 200)]
    batch_ms: u64,
    /// Edits per source between rate counter resets
    #[arg(long, env = "CANVAS_RATE_THRESHOLD", default_value_t = 10)]
    rate_threshold: u32,
    /// Rate counter reset period in seconds
    #[arg(long, env = "CANVAS_RATE_RESET_SECS", default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
    rate_reset_secs: u64,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        let storage = (!self.memory).then(|| StoreConfig {
            path: self.data,
            sync_writes: self.sync_writes,
            ..StoreConfig::default()
        });
        ServerConfig {
            bind_addr: self.bind,
            storage,
            engine: EngineConfig {
                checkpoint_interval: self.checkpoint_interval,
                window_preload: self.window_preload,
                trim_interval: Duration::from_secs(self.trim_secs),
                fanout_window: Duration::from_millis(self.fanout_ms),
                ..EngineConfig::default()
            },
            aggregator: AggregatorConfig {
                batch_window: Duration::from_millis(self.batch_ms),
                rate_threshold: self.rate_threshold,
                rate_reset_interval: Duration::from_secs(self.rate_reset_secs),
                ..AggregatorConfig::default()
            },
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let config = Args::parse().into_config();
    info!("starting canvas server on {}", config.bind_addr);

    let server = match CanvasServer::start(config) {
        Ok(server) => server,
        Err(e) => {
            error!("failed to start: {e}");
            return ExitCode::FAILURE;
        }
    };
    let store = server.store().cloned();

    let code = tokio::select! {
        result = server.run() => match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("server stopped: {e}");
                ExitCode::FAILURE
            }
        },
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            ExitCode::SUCCESS
        }
    };

    if let Some(store) = store {
        if let Err(e) = store.sync() {
            error!("final flush failed: {e}");
        }
    }
    code
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_periods_rejected() {
        assert!(Args::try_parse_from(["canvas-server", "--trim-secs", "0"]).is_err());
        assert!(Args::try_parse_from(["canvas-server", "--rate-reset-secs", "0"]).is_err());
    }

    #[test]
    fn test_periods_reach_config() {
        let config = Args::try_parse_from(["canvas-server", "--memory", "--trim-secs", "3", "--rate-reset-secs", "7"])
            .unwrap()
            .into_config();
        assert!(config.storage.is_none());
        assert_eq!(config.engine.trim_interval, Duration::from_secs(3));
        assert_eq!(config.aggregator.rate_reset_interval, Duration::from_secs(7));
    }
}
