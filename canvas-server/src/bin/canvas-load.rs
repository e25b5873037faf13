//! canvas-load: synthetic write load against a running canvas server.
//!
//! Each writer holds one `/edit` connection and submits random edits in the
//! top-left `region`×`region` corner. All writers share the source address,
//! so run the server with a raised `--rate-threshold` to measure throughput
//! rather than the limiter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use canvas_sync::{CanvasClient, EditReply};
use clap::Parser;
use futures_util::future::join_all;
use log::{info, warn};
use rand::Rng;

#[derive(Parser, Debug)]
#[command(name = "canvas-load", about = "Write load generator for canvas-server")]
struct Args {
    /// WebSocket base URL of the server
    #[arg(long, env = "CANVAS_URL", default_value = "ws://127.0.0.1:3211")]
    url: String,
    /// Concurrent writer connections
    #[arg(long, default_value_t = 4)]
    writers: usize,
    /// Milliseconds between a writer's edits
    #[arg(long, default_value_t = 10)]
    interval_ms: u64,
    /// Side of the square region edits land in
    #[arg(long, default_value_t = 10)]
    region: u16,
    /// Stop after this many seconds (0 = run until interrupted)
    #[arg(long, default_value_t = 0)]
    duration_secs: u64,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    limited: AtomicU64,
    failed: AtomicU64,
}

async fn writer(id: usize, args: Arc<Args>, counters: Arc<Counters>) {
    let client = CanvasClient::new(args.url.clone());
    let mut session = match client.editor().await {
        Ok(session) => session,
        Err(e) => {
            warn!("writer {id} could not connect: {e}");
            return;
        }
    };
    let region = i32::from(args.region.clamp(1, 1000));
    let mut ticker = tokio::time::interval(Duration::from_millis(args.interval_ms.max(1)));

    loop {
        ticker.tick().await;
        let (x, y, color) = {
            let mut rng = rand::rng();
            (rng.random_range(0..region), rng.random_range(0..region), rng.random_range(0..16))
        };
        match session.submit(x, y, color).await {
            Ok(EditReply::Accepted { .. }) => counters.accepted.fetch_add(1, Ordering::Relaxed),
            Ok(EditReply::RateLimited) => counters.limited.fetch_add(1, Ordering::Relaxed),
            Ok(reply) => {
                warn!("writer {id}: {reply:?}");
                counters.failed.fetch_add(1, Ordering::Relaxed)
            }
            Err(e) => {
                warn!("writer {id} disconnected: {e}");
                return;
            }
        };
    }
}

async fn report(counters: Arc<Counters>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.tick().await;
    let mut last = 0;
    loop {
        ticker.tick().await;
        let accepted = counters.accepted.load(Ordering::Relaxed);
        info!(
            "{} edits/s accepted ({accepted} total, {} rate limited, {} failed)",
            accepted - last,
            counters.limited.load(Ordering::Relaxed),
            counters.failed.load(Ordering::Relaxed),
        );
        last = accepted;
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Arc::new(Args::parse());
    let counters = Arc::new(Counters::default());
    info!("adding load: {} writers against {}", args.writers, args.url);

    let writers = join_all((0..args.writers).map(|id| writer(id, Arc::clone(&args), Arc::clone(&counters))));
    let stop = async {
        if args.duration_secs == 0 {
            std::future::pending::<()>().await
        } else {
            tokio::time::sleep(Duration::from_secs(args.duration_secs)).await
        }
    };

    tokio::select! {
        _ = writers => info!("all writers stopped"),
        _ = report(Arc::clone(&counters)) => {}
        _ = stop => info!("duration elapsed"),
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }
    info!(
        "done: {} accepted, {} rate limited, {} failed",
        counters.accepted.load(Ordering::Relaxed),
        counters.limited.load(Ordering::Relaxed),
        counters.failed.load(Ordering::Relaxed),
    );
}
