//! Batched fan-out of applied edits to live subscribers.
//!
//! The engine feeds every applied edit into a pending buffer. When the
//! fan-out window closes the buffer becomes one frame, stamped with the
//! newest version it contains, and goes out over a tokio broadcast channel.
//! Each subscriber has its own bounded receiver; one that falls a full
//! channel behind sees `Lagged` and is disconnected by its connection task,
//! never blocking the others.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::codec::{self, CodecError, Edit, EDIT_LEN};

/// Counters for monitoring fan-out health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanOutStats {
    pub frames_sent: u64,
    pub edits_sent: u64,
    pub subscribers: usize,
}

struct AtomicFanOutStats {
    frames_sent: AtomicU64,
    edits_sent: AtomicU64,
}

pub struct FanOut {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    pending: Vec<u8>,
    latest: Option<u64>,
    capacity: usize,
    stats: Arc<AtomicFanOutStats>,
}

impl FanOut {
    /// `capacity` is the number of frames a subscriber may fall behind
    /// before it is considered lagging.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            pending: Vec::new(),
            latest: None,
            capacity,
            stats: Arc::new(AtomicFanOutStats {
                frames_sent: AtomicU64::new(0),
                edits_sent: AtomicU64::new(0),
            }),
        }
    }

    /// Queue an applied edit. Returns `true` when this opens a new window,
    /// i.e. the caller should arm the flush deadline.
    pub fn on_applied(&mut self, version: u64, edit: &Edit) -> bool {
        let opened = self.pending.is_empty();
        edit.encode_into(&mut self.pending);
        self.latest = Some(version);
        opened
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Send everything pending as one frame. Returns the frame, or `None`
    /// when nothing was pending.
    pub fn flush(&mut self) -> Result<Option<Arc<Vec<u8>>>, CodecError> {
        let Some(version) = self.latest.take() else {
            return Ok(None);
        };
        if self.pending.is_empty() {
            return Ok(None);
        }
        let edits = self.pending.len() / EDIT_LEN;
        let framed = codec::frame(version, &self.pending);
        self.pending.clear();
        let framed = Arc::new(framed?);

        // no receivers is not an error
        let receivers = self.sender.send(Arc::clone(&framed)).unwrap_or(0);
        log::trace!("fan-out v{version}: {edits} edits to {receivers} subscribers");

        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.stats.edits_sent.fetch_add(edits as u64, Ordering::Relaxed);
        Ok(Some(framed))
    }

    /// Register a live subscriber. Only frames flushed after this call
    /// reach it.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> FanOutStats {
        FanOutStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            edits_sent: self.stats.edits_sent.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}
