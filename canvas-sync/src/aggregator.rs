//! Write path: rate limiting, validation and time-windowed batching of
//! client edits into log appends.
//!
//! ```text
//! submit ─► RateLimiter ─► Edit::from_signed ─► mpsc ─► batcher ─► OrderedLog::append
//!    ▲                                                     │
//!    └──────────────────── oneshot (offset | error) ◄──────┘
//! ```
//!
//! The first edit to reach an idle batcher opens a window. When the window
//! closes (or the batch hits its size cap) the whole batch becomes a single
//! log entry, and every waiting submitter gets the same outcome. Appends are
//! issued one at a time, so batches land in submission order.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::codec::{CodecError, Edit};
use crate::entry::LogEntry;
use crate::oplog::OrderedLog;
use crate::rate_limit::RateLimiter;

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// How long a batch stays open after its first edit (default: 200ms)
    pub batch_window: Duration,
    /// Flush early once a batch holds this many edits (default: 100 000)
    pub max_batch_edits: usize,
    /// Edits a source may submit between counter resets (default: 10)
    pub rate_threshold: u32,
    /// Counter reset period (default: 10s)
    pub rate_reset_interval: Duration,
    /// Submissions buffered ahead of the batcher (default: 4096)
    pub queue_capacity: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            batch_window: Duration::from_millis(200),
            max_batch_edits: 100_000,
            rate_threshold: 10,
            rate_reset_interval: Duration::from_secs(10),
            queue_capacity: 4096,
        }
    }
}

impl AggregatorConfig {
    pub fn for_testing() -> Self {
        Self {
            batch_window: Duration::from_millis(50),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("rate limited")]
    RateLimited,
    #[error("invalid edit: {0}")]
    Invalid(#[from] CodecError),
    #[error("log append failed: {0}")]
    Log(String),
    #[error("aggregator closed")]
    Closed,
}

struct Pending {
    edit: Edit,
    done: oneshot::Sender<Result<u64, SubmitError>>,
}

pub struct IngestAggregator {
    tx: mpsc::Sender<Pending>,
    limiter: Arc<RateLimiter>,
    reset_task: JoinHandle<()>,
    batch_task: JoinHandle<()>,
}

impl IngestAggregator {
    /// Start the batcher and the rate-reset timer.
    pub fn spawn(oplog: Arc<dyn OrderedLog>, config: AggregatorConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let limiter = Arc::new(RateLimiter::new(config.rate_threshold));
        let reset_task = limiter.spawn_reset(config.rate_reset_interval);
        let batch_task = tokio::spawn(batch_loop(oplog, rx, config));
        Self {
            tx,
            limiter,
            reset_task,
            batch_task,
        }
    }

    /// Submit one edit from `source`. Resolves once the batch carrying it
    /// has been appended, with the log offset of that batch.
    pub async fn submit(&self, source: IpAddr, x: i64, y: i64, color: i64) -> Result<u64, SubmitError> {
        if !self.limiter.try_admit(source) {
            return Err(SubmitError::RateLimited);
        }
        let edit = Edit::from_signed(x, y, color)?;

        let (done, result) = oneshot::channel();
        self.tx
            .send(Pending { edit, done })
            .await
            .map_err(|_| SubmitError::Closed)?;
        result.await.map_err(|_| SubmitError::Closed)?
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }
}

impl Drop for IngestAggregator {
    fn drop(&mut self) {
        self.reset_task.abort();
        self.batch_task.abort();
    }
}

async fn batch_loop(oplog: Arc<dyn OrderedLog>, mut rx: mpsc::Receiver<Pending>, config: AggregatorConfig) {
    while let Some(first) = rx.recv().await {
        let deadline = Instant::now() + config.batch_window;
        let mut batch = vec![first];

        while batch.len() < config.max_batch_edits {
            tokio::select! {
                _ = sleep_until(deadline) => break,
                next = rx.recv() => match next {
                    Some(pending) => batch.push(pending),
                    None => break,
                },
            }
        }

        append_batch(&oplog, batch).await;
    }
    log::debug!("aggregator queue closed");
}

async fn append_batch(oplog: &Arc<dyn OrderedLog>, batch: Vec<Pending>) {
    let edits: Vec<Edit> = batch.iter().map(|p| p.edit).collect();
    let count = edits.len();

    let result = match LogEntry::from_edits(&edits).encode() {
        Ok(payload) => {
            let target = Arc::clone(oplog);
            match tokio::task::spawn_blocking(move || target.append(&payload)).await {
                Ok(Ok(offset)) => Ok(offset),
                Ok(Err(e)) => Err(SubmitError::Log(e.to_string())),
                Err(e) => Err(SubmitError::Log(e.to_string())),
            }
        }
        Err(e) => Err(SubmitError::Log(e.to_string())),
    };

    match &result {
        Ok(offset) => log::debug!("appended {count} edits at offset {offset}"),
        Err(e) => log::error!("append of {count} edits failed: {e}"),
    }

    for pending in batch {
        // submitter may have gone away
        let _ = pending.done.send(result.clone());
    }
}
