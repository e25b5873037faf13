//! The ordered, append-only log the engine consumes.
//!
//! ```text
//! aggregator ──append──► OrderedLog ──subscribe(from)──► engine
//!                          │  head watch
//!                          ▼
//!                    tail-follow task
//! ```
//!
//! Offsets start at 0 and are dense. `head()` is the offset the next append
//! will receive. A log must hand out offsets in the order the payloads become
//! readable; `watch_head` only advances after the payload is stored.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// Entries fetched per `read_from` call by the tail-follow task.
const READ_CHUNK: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LogError {
    #[error("log storage error: {0}")]
    Storage(String),
    #[error("log unavailable: {0}")]
    Unavailable(String),
    #[error("log stream closed")]
    Closed,
}

pub trait OrderedLog: Send + Sync + 'static {
    /// Append one payload, returning its offset.
    fn append(&self, payload: &[u8]) -> Result<u64, LogError>;

    /// Up to `limit` entries starting at `from`, in offset order.
    fn read_from(&self, from: u64, limit: usize) -> Result<Vec<(u64, Vec<u8>)>, LogError>;

    /// Offset the next append will receive.
    fn head(&self) -> u64;

    /// Follows `head()`.
    fn watch_head(&self) -> watch::Receiver<u64>;
}

/// One entry delivered to a log subscriber.
pub type LogItem = Result<(u64, Vec<u8>), LogError>;

/// Stream every entry from `from` onward, then keep following the tail.
///
/// The returned channel is meant for a single consumer. A read error is
/// delivered once and ends the stream.
pub fn subscribe(source: Arc<dyn OrderedLog>, from: u64, capacity: usize) -> mpsc::Receiver<LogItem> {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    tokio::spawn(async move {
        let mut head_rx = source.watch_head();
        let mut next = from;
        loop {
            let head = *head_rx.borrow_and_update();
            while next < head {
                let reader = Arc::clone(&source);
                let start = next;
                let chunk = tokio::task::spawn_blocking(move || reader.read_from(start, READ_CHUNK))
                    .await
                    .map_err(|e| LogError::Unavailable(e.to_string()))
                    .and_then(|r| r);
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        log::error!("log read from {start} failed: {e}");
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                };
                if chunk.is_empty() {
                    break;
                }
                for (offset, payload) in chunk {
                    next = offset + 1;
                    if tx.send(Ok((offset, payload))).await.is_err() {
                        return;
                    }
                }
            }
            tokio::select! {
                changed = head_rx.changed() => {
                    if changed.is_err() {
                        log::debug!("log closed, tail-follow stopping at {next}");
                        return;
                    }
                }
                _ = tx.closed() => {
                    log::debug!("log consumer gone, tail-follow stopping at {next}");
                    return;
                }
            }
        }
    });
    rx
}

/// In-memory log for tests and single-process runs.
pub struct MemoryLog {
    entries: RwLock<Vec<Vec<u8>>>,
    head: watch::Sender<u64>,
    fail_appends: AtomicBool,
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLog {
    pub fn new() -> Self {
        let (head, _) = watch::channel(0);
        Self {
            entries: RwLock::new(Vec::new()),
            head,
            fail_appends: AtomicBool::new(false),
        }
    }

    /// Make subsequent appends fail until cleared.
    pub fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }
}

impl OrderedLog for MemoryLog {
    fn append(&self, payload: &[u8]) -> Result<u64, LogError> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(LogError::Unavailable("append rejected".into()));
        }
        let mut entries = self
            .entries
            .write()
            .map_err(|_| LogError::Storage("lock poisoned".into()))?;
        let offset = entries.len() as u64;
        entries.push(payload.to_vec());
        self.head.send_replace(offset + 1);
        Ok(offset)
    }

    fn read_from(&self, from: u64, limit: usize) -> Result<Vec<(u64, Vec<u8>)>, LogError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| LogError::Storage("lock poisoned".into()))?;
        Ok(entries
            .iter()
            .enumerate()
            .skip(from as usize)
            .take(limit)
            .map(|(i, p)| (i as u64, p.clone()))
            .collect())
    }

    fn head(&self) -> u64 {
        *self.head.borrow()
    }

    fn watch_head(&self) -> watch::Receiver<u64> {
        self.head.subscribe()
    }
}
