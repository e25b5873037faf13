//! Per-source admission counter, cleared in bulk on a timer.
//!
//! This is a fixed-window approximation: a source gets `threshold` edits
//! between two resets, however those resets line up with its requests.

use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};

pub struct RateLimiter {
    counts: DashMap<IpAddr, u32>,
    threshold: u32,
}

impl RateLimiter {
    pub fn new(threshold: u32) -> Self {
        Self {
            counts: DashMap::new(),
            threshold,
        }
    }

    /// Count one edit from `source`. Returns `false` (and counts nothing)
    /// once the source already has `threshold` edits in this window.
    pub fn try_admit(&self, source: IpAddr) -> bool {
        let mut count = self.counts.entry(source).or_insert(0);
        if *count >= self.threshold {
            return false;
        }
        *count += 1;
        true
    }

    pub fn count(&self, source: IpAddr) -> u32 {
        self.counts.get(&source).map(|c| *c).unwrap_or(0)
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Forget every source.
    pub fn reset(&self) {
        self.counts.clear();
    }

    /// Reset every `period` until the limiter is dropped.
    pub fn spawn_reset(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let limiter: Weak<Self> = Arc::downgrade(self);
        // interval_at panics on a zero period
        let period = period.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(limiter) = limiter.upgrade() else {
                    break;
                };
                log::trace!("rate counters reset ({} sources)", limiter.counts.len());
                limiter.reset();
            }
        })
    }
}
