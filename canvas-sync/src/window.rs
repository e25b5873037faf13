//! Catch-up window: recent log entries kept in memory so reconnecting
//! clients can be brought up to date without a full reload.
//!
//! Addressed by `[opbase, opbase + len)`. Trimming uses two watermarks: each
//! trim drops everything below the tail recorded by the *previous* trim, so
//! an entry survives at least one full trim interval.

use std::collections::VecDeque;
use thiserror::Error;

use crate::entry::LogEntry;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WindowError {
    #[error("window append out of order: got {got}, expected {expected}")]
    OutOfOrder { got: u64, expected: u64 },
    #[error("version {requested} is below the window base {opbase}")]
    Exceeded { requested: u64, opbase: u64 },
}

#[derive(Debug, Clone, Default)]
pub struct CatchupWindow {
    opbase: u64,
    entries: VecDeque<LogEntry>,
    lasthead: Option<u64>,
}

impl CatchupWindow {
    /// An empty window whose first entry will be `opbase`.
    pub fn new(opbase: u64) -> Self {
        Self {
            opbase,
            entries: VecDeque::new(),
            lasthead: None,
        }
    }

    /// Oldest version still held.
    pub fn opbase(&self) -> u64 {
        self.opbase
    }

    /// The version the next append must carry.
    pub fn head(&self) -> u64 {
        self.opbase + self.entries.len() as u64
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn append(&mut self, version: u64, entry: LogEntry) -> Result<(), WindowError> {
        let expected = self.head();
        if version != expected {
            return Err(WindowError::OutOfOrder {
                got: version,
                expected,
            });
        }
        self.entries.push_back(entry);
        Ok(())
    }

    /// Advance the watermarks. Returns the number of entries dropped.
    pub fn trim(&mut self) -> usize {
        let head = self.head();
        let dropped = match self.lasthead {
            None => 0,
            Some(watermark) => {
                let n = (watermark - self.opbase) as usize;
                self.entries.drain(..n);
                self.opbase = watermark;
                n
            }
        };
        self.lasthead = Some(head);
        dropped
    }

    /// Entries from `version` to the tail, each with its own version.
    /// A version past the tail yields nothing.
    pub fn replay_from(
        &self,
        version: u64,
    ) -> Result<impl Iterator<Item = (u64, &LogEntry)> + '_, WindowError> {
        if version < self.opbase {
            return Err(WindowError::Exceeded {
                requested: version,
                opbase: self.opbase,
            });
        }
        let skip = (version - self.opbase) as usize;
        Ok(self
            .entries
            .iter()
            .enumerate()
            .skip(skip)
            .map(move |(i, entry)| (self.opbase + i as u64, entry)))
    }
}
