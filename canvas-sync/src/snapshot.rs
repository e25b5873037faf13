//! Snapshot manager: durable `(raster, version)` checkpoints for fast restart.
//!
//! Loading happens once at startup. Saving runs on a dedicated checkpoint
//! task fed through a latest-value channel, so the engine never waits on the
//! store and an older pair is never written after a newer one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::raster::{Raster, RasterError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    #[error("snapshot store error: {0}")]
    Store(String),
    #[error("corrupt snapshot: {0}")]
    Corrupt(#[from] RasterError),
}

/// Durable home of the single current snapshot.
///
/// `save` must replace raster and version together; `load` must never see
/// one without the other.
pub trait SnapshotStore: Send + Sync + 'static {
    fn load(&self) -> Result<Option<(Vec<u8>, u64)>, SnapshotError>;
    fn save(&self, raster: &[u8], version: u64) -> Result<(), SnapshotError>;
}

#[derive(Default)]
pub struct MemorySnapshotStore {
    current: Mutex<Option<(Vec<u8>, u64)>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self) -> Result<Option<(Vec<u8>, u64)>, SnapshotError> {
        let current = self
            .current
            .lock()
            .map_err(|_| SnapshotError::Store("lock poisoned".into()))?;
        Ok(current.clone())
    }

    fn save(&self, raster: &[u8], version: u64) -> Result<(), SnapshotError> {
        let mut current = self
            .current
            .lock()
            .map_err(|_| SnapshotError::Store("lock poisoned".into()))?;
        *current = Some((raster.to_vec(), version));
        Ok(())
    }
}

pub struct SnapshotManager {
    store: Arc<dyn SnapshotStore>,
}

impl SnapshotManager {
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self { store }
    }

    /// The latest snapshot, or a blank raster and `None` when there is none.
    pub fn load(&self) -> Result<(Raster, Option<u64>), SnapshotError> {
        match self.store.load()? {
            Some((bytes, version)) => {
                let raster = Raster::from_snapshot(&bytes)?;
                log::info!("loaded snapshot at version {version}");
                Ok((raster, Some(version)))
            }
            None => {
                log::info!("snapshot store empty, replaying entire log");
                Ok((Raster::new(), None))
            }
        }
    }

    /// Start the checkpoint task.
    pub fn spawn_checkpointer(&self) -> Checkpointer {
        let (tx, rx) = watch::channel(None);
        let written = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn(checkpoint_loop(Arc::clone(&self.store), rx, Arc::clone(&written)));
        Checkpointer { tx, written, task }
    }
}

type Pending = Option<(Arc<Vec<u8>>, u64)>;

async fn checkpoint_loop(
    store: Arc<dyn SnapshotStore>,
    mut rx: watch::Receiver<Pending>,
    written: Arc<AtomicU64>,
) {
    let mut last: Option<u64> = None;
    while rx.changed().await.is_ok() {
        let Some((bytes, version)) = rx.borrow_and_update().clone() else {
            continue;
        };
        if last.is_some_and(|l| l >= version) {
            continue;
        }
        let target = Arc::clone(&store);
        let result = tokio::task::spawn_blocking(move || target.save(&bytes, version)).await;
        match result {
            Ok(Ok(())) => {
                log::info!("committed snapshot at version {version}");
                last = Some(version);
                written.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => log::error!("snapshot at version {version} failed: {e}"),
            Err(e) => log::error!("snapshot task panicked at version {version}: {e}"),
        }
    }
    log::debug!("checkpoint task stopped");
}

/// Handle to the checkpoint task.
pub struct Checkpointer {
    tx: watch::Sender<Pending>,
    written: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl Checkpointer {
    /// Queue a checkpoint. Replaces any pair the task has not picked up yet.
    pub fn submit(&self, raster: Vec<u8>, version: u64) {
        self.tx.send_replace(Some((Arc::new(raster), version)));
    }

    /// Snapshots committed so far.
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Write whatever is still queued, then stop.
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(e) = self.task.await {
            log::error!("checkpoint task failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_empty_store() {
        let manager = SnapshotManager::new(Arc::new(MemorySnapshotStore::new()));
        let (raster, version) = manager.load().unwrap();
        assert_eq!(version, None);
        assert!(raster.snapshot_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_load_rejects_corrupt_snapshot() {
        let store = Arc::new(MemorySnapshotStore::new());
        store.save(&[1, 2, 3], 7).unwrap();
        let manager = SnapshotManager::new(store);
        assert!(matches!(manager.load(), Err(SnapshotError::Corrupt(_))));
    }

    #[tokio::test]
    async fn test_checkpoint_roundtrip() {
        let store = Arc::new(MemorySnapshotStore::new());
        let manager = SnapshotManager::new(store.clone());

        let mut raster = Raster::new();
        raster.set(5, 5, 7);
        let checkpointer = manager.spawn_checkpointer();
        checkpointer.submit(raster.snapshot_bytes().to_vec(), 500);
        checkpointer.shutdown().await;

        let (loaded, version) = manager.load().unwrap();
        assert_eq!(version, Some(500));
        assert_eq!(loaded, raster);
    }

    #[tokio::test]
    async fn test_newest_pair_wins() {
        let store = Arc::new(MemorySnapshotStore::new());
        let manager = SnapshotManager::new(store.clone());
        let checkpointer = manager.spawn_checkpointer();

        let mut raster = Raster::new();
        for version in [500u64, 1000, 1500] {
            raster.set(0, 0, (version / 500) as u8);
            checkpointer.submit(raster.snapshot_bytes().to_vec(), version);
        }
        checkpointer.shutdown().await;

        let (bytes, version) = store.load().unwrap().unwrap();
        assert_eq!(version, 1500);
        assert_eq!(bytes[0], 3);
    }
}
