//! Log ingestion engine: the single task that owns the raster, the applied
//! version, the catch-up window and the fan-out buffer.
//!
//! ```text
//!  Recovering ──snapshot loaded──► Replaying ──offset reaches startup head──► Live
//!
//!                 ┌───────────────────────── Engine task ─────────────────────────┐
//!  log stream ───►│ contiguity ─► window.append ─► raster.apply ─► fanout.enqueue │
//!                 │                                    │                          │
//!  commands ─────►│ subscribe / fetch raster / stats   └─► checkpoint (every N)   │
//!  timers ───────►│ window trim, fan-out flush                                    │
//!                 └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything that touches engine state goes through the task's `select!`
//! loop, so the subscribe handshake (flush, replay, register) happens in one
//! step and no entry can fall between replay and live delivery.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant};

use crate::broadcast::FanOut;
use crate::codec::CodecError;
use crate::entry::LogEntry;
use crate::oplog::{self, LogError, OrderedLog};
use crate::raster::Raster;
use crate::snapshot::{Checkpointer, SnapshotError, SnapshotManager, SnapshotStore};
use crate::window::{CatchupWindow, WindowError};

/// Floor for timer periods; a zero period would panic the interval.
const MIN_TIMER_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Checkpoint whenever the version is a multiple of this (default: 500)
    pub checkpoint_interval: u64,
    /// Catch-up window trim period (default: 20s)
    pub trim_interval: Duration,
    /// Entries before the snapshot version to reload into the window (default: 1000)
    pub window_preload: u64,
    /// Fan-out batching window (default: 500ms)
    pub fanout_window: Duration,
    /// Frames a subscriber may fall behind before it is dropped (default: 1024)
    pub subscriber_queue: usize,
    /// Pending engine commands (default: 256)
    pub command_queue: usize,
    /// Log entries buffered between the tail-follow task and the engine (default: 1024)
    pub log_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: 500,
            trim_interval: Duration::from_secs(20),
            window_preload: 1000,
            fanout_window: Duration::from_millis(500),
            subscriber_queue: 1024,
            command_queue: 256,
            log_buffer: 1024,
        }
    }
}

impl EngineConfig {
    pub fn for_testing() -> Self {
        Self {
            fanout_window: Duration::from_millis(100),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Recovering,
    Replaying,
    Live,
}

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("log offset {offset} does not follow window head {expected}")]
    Contiguity { offset: u64, expected: u64 },
    #[error("offset {offset} does not follow applied version {version:?}")]
    VersionGap { offset: u64, version: Option<u64> },
    #[error("catch-up window: {0}")]
    Window(#[from] WindowError),
    #[error("corrupt log entry: {0}")]
    Codec(#[from] CodecError),
    #[error("snapshot: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("log: {0}")]
    Log(#[from] LogError),
    #[error("engine stopped")]
    Stopped,
}

/// Engine counters and position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    pub state: EngineState,
    pub version: Option<u64>,
    pub opbase: u64,
    pub window_len: usize,
    pub applied_entries: u64,
    pub applied_edits: u64,
    pub subscribers: usize,
    pub frames_sent: u64,
    pub checkpoints_written: u64,
}

/// A consistent copy of the raster and the version it reflects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterCopy {
    pub version: Option<u64>,
    pub width: u16,
    pub height: u16,
    pub indices: Vec<u8>,
}

/// Outcome of a subscribe handshake.
#[derive(Debug)]
pub enum Subscription {
    /// The client is too far behind; it must refetch the raster.
    Reload { opbase: u64 },
    /// Send `replay` in order, then everything from `live`.
    Live {
        replay: Vec<Vec<u8>>,
        live: broadcast::Receiver<Arc<Vec<u8>>>,
    },
}

enum Command {
    Subscribe {
        from: Option<u64>,
        reply: oneshot::Sender<Result<Subscription, EngineError>>,
    },
    FetchRaster {
        reply: oneshot::Sender<RasterCopy>,
    },
    Stats {
        reply: oneshot::Sender<EngineStats>,
    },
}

pub struct Engine {
    config: EngineConfig,
    state: EngineState,
    raster: Raster,
    version: Option<u64>,
    window: CatchupWindow,
    fanout: FanOut,
    flush_deadline: Option<Instant>,
    checkpointer: Option<Checkpointer>,
    /// Log head when the engine started; reaching it means `Live`.
    live_at: u64,
    applied_entries: u64,
    applied_edits: u64,
    /// Subscriptions waiting for the window to reach the snapshot version.
    held: Vec<(Option<u64>, oneshot::Sender<Result<Subscription, EngineError>>)>,
}

impl Engine {
    /// Load the latest snapshot and prepare to consume the log from
    /// `snapshot_version - window_preload`. Must run inside a tokio runtime.
    pub fn recover(snapshots: &SnapshotManager, log_head: u64, config: EngineConfig) -> Result<Self, EngineError> {
        let (raster, version) = snapshots.load()?;
        let opbase = version.map_or(0, |v| v.saturating_sub(config.window_preload));
        let checkpointer = snapshots.spawn_checkpointer();

        let mut engine = Self {
            fanout: FanOut::new(config.subscriber_queue),
            config,
            state: EngineState::Recovering,
            raster,
            version,
            window: CatchupWindow::new(opbase),
            flush_deadline: None,
            checkpointer: Some(checkpointer),
            live_at: log_head,
            applied_entries: 0,
            applied_edits: 0,
            held: Vec::new(),
        };
        engine.set_state(EngineState::Replaying);
        engine.check_live();
        Ok(engine)
    }

    /// Recover, then run the engine on its own task.
    pub fn start(
        oplog: Arc<dyn OrderedLog>,
        snapshots: Arc<dyn SnapshotStore>,
        config: EngineConfig,
    ) -> Result<(EngineHandle, JoinHandle<Result<(), EngineError>>), EngineError> {
        let manager = SnapshotManager::new(snapshots);
        let engine = Self::recover(&manager, oplog.head(), config)?;
        let (tx, rx) = mpsc::channel(engine.config.command_queue.max(1));
        let task = tokio::spawn(engine.run(oplog, rx));
        Ok((EngineHandle { tx }, task))
    }

    fn set_state(&mut self, state: EngineState) {
        if self.state != state {
            log::info!("engine {:?} -> {:?} (version {:?})", self.state, state, self.version);
            self.state = state;
        }
    }

    fn check_live(&mut self) {
        if self.state == EngineState::Replaying && self.window.head() >= self.live_at {
            self.set_state(EngineState::Live);
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn version(&self) -> Option<u64> {
        self.version
    }

    pub fn raster(&self) -> &Raster {
        &self.raster
    }

    pub fn window(&self) -> &CatchupWindow {
        &self.window
    }

    pub fn fanout(&self) -> &FanOut {
        &self.fanout
    }

    /// Apply the log entry at `offset`.
    pub fn apply(&mut self, offset: u64, payload: &[u8]) -> Result<(), EngineError> {
        let expected = self.window.head();
        if offset != expected {
            return Err(EngineError::Contiguity { offset, expected });
        }
        let entry = LogEntry::decode(payload)?;
        let edits = entry.edits()?;
        self.window.append(offset, entry)?;

        if self.version.map_or(true, |v| offset > v) {
            let next = self.version.map_or(0, |v| v + 1);
            if offset != next {
                return Err(EngineError::VersionGap {
                    offset,
                    version: self.version,
                });
            }
            for edit in &edits {
                self.raster.apply(edit);
                if self.fanout.on_applied(offset, edit) && self.flush_deadline.is_none() {
                    self.flush_deadline = Some(Instant::now() + self.config.fanout_window);
                }
            }
            self.version = Some(offset);
            self.applied_entries += 1;
            self.applied_edits += edits.len() as u64;

            if offset % self.config.checkpoint_interval.max(1) == 0 {
                if let Some(checkpointer) = &self.checkpointer {
                    log::info!("committing version {offset}");
                    checkpointer.submit(self.raster.snapshot_bytes().to_vec(), offset);
                }
            }
        }

        self.check_live();
        self.release_held();
        Ok(())
    }

    /// True while the window still lacks entries in `first..=version` that
    /// are already in the raster. Those entries are never broadcast, so a
    /// subscriber registered now would miss them.
    fn replay_incomplete(&self, first: u64) -> bool {
        self.version
            .is_some_and(|v| first <= v && self.window.head() <= v)
    }

    fn release_held(&mut self) {
        if self.held.is_empty() {
            return;
        }
        let held = std::mem::take(&mut self.held);
        for (from, reply) in held {
            if self.replay_incomplete(from.map_or(0, |v| v + 1)) {
                self.held.push((from, reply));
            } else {
                let _ = reply.send(self.subscribe(from));
            }
        }
    }

    /// Send pending fan-out edits now.
    pub fn flush_fanout(&mut self) -> Result<(), EngineError> {
        self.flush_deadline = None;
        self.fanout.flush()?;
        Ok(())
    }

    /// Trim the catch-up window.
    pub fn trim_window(&mut self) {
        let dropped = self.window.trim();
        log::debug!(
            "window trimmed {dropped} entries, now [{}, {})",
            self.window.opbase(),
            self.window.head()
        );
    }

    /// Subscribe handshake. `from` is the last version the client holds.
    pub fn subscribe(&mut self, from: Option<u64>) -> Result<Subscription, EngineError> {
        let first = from.map_or(0, |v| v + 1);
        if first < self.window.opbase() {
            log::info!("subscriber at {from:?} is behind window base {}, reload", self.window.opbase());
            return Ok(Subscription::Reload {
                opbase: self.window.opbase(),
            });
        }
        if self.replay_incomplete(first) {
            log::info!(
                "subscriber at {from:?} needs entries the window has not reached yet (head {}), reload",
                self.window.head()
            );
            return Ok(Subscription::Reload {
                opbase: self.window.opbase(),
            });
        }

        // existing subscribers must not see pending edits after the newcomer
        self.flush_fanout()?;
        let replay = self
            .window
            .replay_from(first)?
            .map(|(version, entry)| entry.frame(version))
            .collect::<Result<Vec<_>, _>>()?;
        let live = self.fanout.subscribe();
        log::debug!("subscriber from {from:?}: {} catch-up frames", replay.len());
        Ok(Subscription::Live { replay, live })
    }

    pub fn raster_copy(&self) -> RasterCopy {
        RasterCopy {
            version: self.version,
            width: self.raster.width(),
            height: self.raster.height(),
            indices: self.raster.snapshot_bytes().to_vec(),
        }
    }

    pub fn stats(&self) -> EngineStats {
        let fanout = self.fanout.stats();
        EngineStats {
            state: self.state,
            version: self.version,
            opbase: self.window.opbase(),
            window_len: self.window.len(),
            applied_entries: self.applied_entries,
            applied_edits: self.applied_edits,
            subscribers: fanout.subscribers,
            frames_sent: fanout.frames_sent,
            checkpoints_written: self.checkpointer.as_ref().map_or(0, |c| c.written()),
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Subscribe { from, reply } => {
                let first = from.map_or(0, |v| v + 1);
                if first >= self.window.opbase() && self.replay_incomplete(first) {
                    log::debug!("holding subscriber at {from:?} until the window reaches {:?}", self.version);
                    self.held.push((from, reply));
                } else {
                    let _ = reply.send(self.subscribe(from));
                }
            }
            Command::FetchRaster { reply } => {
                let _ = reply.send(self.raster_copy());
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }

    /// Consume the log until it closes, every handle is dropped, or a
    /// consistency violation stops the engine.
    async fn run(mut self, oplog: Arc<dyn OrderedLog>, mut commands: mpsc::Receiver<Command>) -> Result<(), EngineError> {
        let from = self.window.head();
        log::info!("engine consuming log from offset {from} (startup head {})", self.live_at);
        let mut entries = oplog::subscribe(oplog, from, self.config.log_buffer);
        let period = self.config.trim_interval.max(MIN_TIMER_PERIOD);
        let mut trim = interval_at(Instant::now() + period, period);

        let result = loop {
            let deadline = self.flush_deadline;
            tokio::select! {
                item = entries.recv() => match item {
                    Some(Ok((offset, payload))) => {
                        if let Err(e) = self.apply(offset, &payload) {
                            break Err(e);
                        }
                    }
                    Some(Err(e)) => break Err(e.into()),
                    None => break Ok(()),
                },
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break Ok(()),
                },
                _ = trim.tick() => self.trim_window(),
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if let Err(e) = self.flush_fanout() {
                        break Err(e);
                    }
                }
            }
        };

        match &result {
            Ok(()) => {
                if let Err(e) = self.flush_fanout() {
                    log::warn!("final fan-out flush failed: {e}");
                }
                log::info!("engine stopped at version {:?}", self.version);
            }
            Err(e) => log::error!("engine halted at version {:?}: {e}", self.version),
        }
        if let Some(checkpointer) = self.checkpointer.take() {
            checkpointer.shutdown().await;
        }
        result
    }
}

/// Cloneable handle for talking to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Command>,
}

impl EngineHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await.map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)
    }

    /// Start a subscription. `from` is the last version the client already
    /// holds, `None` for an empty client.
    pub async fn subscribe(&self, from: Option<u64>) -> Result<Subscription, EngineError> {
        self.request(|reply| Command::Subscribe { from, reply }).await?
    }

    pub async fn fetch_raster(&self) -> Result<RasterCopy, EngineError> {
        self.request(|reply| Command::FetchRaster { reply }).await
    }

    pub async fn stats(&self) -> Result<EngineStats, EngineError> {
        self.request(|reply| Command::Stats { reply }).await
    }

    /// Whether the engine task is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{self, Edit};
    use crate::oplog::MemoryLog;
    use crate::snapshot::MemorySnapshotStore;

    fn payload(edits: &[(u16, u16, u8)]) -> Vec<u8> {
        let edits: Vec<Edit> = edits.iter().map(|&(x, y, c)| Edit::new(x, y, c).unwrap()).collect();
        LogEntry::from_edits(&edits).encode().unwrap()
    }

    fn fresh_engine(config: EngineConfig) -> (Arc<MemorySnapshotStore>, Engine) {
        let store = Arc::new(MemorySnapshotStore::new());
        let manager = SnapshotManager::new(store.clone());
        let engine = Engine::recover(&manager, 0, config).unwrap();
        (store, engine)
    }

    async fn wait_for_version(handle: &EngineHandle, version: u64) -> EngineStats {
        for _ in 0..200 {
            let stats = handle.stats().await.unwrap();
            if stats.version == Some(version) {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("engine never reached version {version}");
    }

    #[tokio::test]
    async fn test_two_edits_same_cell() {
        let (_store, mut engine) = fresh_engine(EngineConfig::for_testing());
        assert_eq!(engine.version(), None);

        engine.apply(0, &payload(&[(5, 5, 3)])).unwrap();
        engine.apply(1, &payload(&[(5, 5, 7)])).unwrap();
        assert_eq!(engine.raster().get(5, 5), Some(7));
        assert_eq!(engine.version(), Some(1));

        let Subscription::Live { replay, .. } = engine.subscribe(Some(0)).unwrap() else {
            panic!("expected live subscription");
        };
        assert_eq!(replay.len(), 1);
        let (version, edits) = codec::parse_frame(&replay[0]).unwrap();
        assert_eq!(version, 1);
        assert_eq!(edits, vec![Edit::new(5, 5, 7).unwrap()]);
    }

    #[tokio::test]
    async fn test_in_order_matches_direct_application() {
        let (_store, mut engine) = fresh_engine(EngineConfig::for_testing());
        let mut direct = Raster::new();
        for i in 0..50u16 {
            let batch = [(i * 7 % 1000, i * 13 % 1000, (i % 16) as u8), (i, i, 15 - (i % 16) as u8)];
            for &(x, y, c) in &batch {
                direct.set(x, y, c);
            }
            engine.apply(u64::from(i), &payload(&batch)).unwrap();
        }
        assert_eq!(engine.raster(), &direct);
        assert_eq!(engine.stats().applied_edits, 100);
    }

    #[tokio::test]
    async fn test_out_of_order_is_fatal() {
        let (_store, mut engine) = fresh_engine(EngineConfig::for_testing());
        engine.apply(0, &payload(&[(1, 1, 1)])).unwrap();

        let err = engine.apply(2, &payload(&[(2, 2, 2)])).unwrap_err();
        assert!(matches!(err, EngineError::Contiguity { offset: 2, expected: 1 }));
        let err = engine.apply(0, &payload(&[(2, 2, 2)])).unwrap_err();
        assert!(matches!(err, EngineError::Contiguity { offset: 0, expected: 1 }));

        assert_eq!(engine.version(), Some(0));
        assert_eq!(engine.raster().get(2, 2), Some(0));
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_fatal() {
        let (_store, mut engine) = fresh_engine(EngineConfig::for_testing());
        let bad = LogEntry::Batch(vec![0xE8, 0x03, 0x00]).encode().unwrap();
        assert!(matches!(engine.apply(0, &bad), Err(EngineError::Codec(_))));
        assert!(engine.window().is_empty());
        assert_eq!(engine.version(), None);
    }

    #[tokio::test]
    async fn test_subscribe_from_empty_replays_everything() {
        let (_store, mut engine) = fresh_engine(EngineConfig::for_testing());
        for i in 0..3u16 {
            engine.apply(u64::from(i), &payload(&[(i, 0, 1)])).unwrap();
        }
        let Subscription::Live { replay, .. } = engine.subscribe(None).unwrap() else {
            panic!("expected live subscription");
        };
        let versions: Vec<u64> = replay
            .iter()
            .map(|f| codec::parse_frame(f).unwrap().0)
            .collect();
        assert_eq!(versions, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_subscribe_behind_window_reloads() {
        let (_store, mut engine) = fresh_engine(EngineConfig::for_testing());
        for i in 0..4u64 {
            engine.apply(i, &payload(&[(1, 1, 1)])).unwrap();
        }
        engine.trim_window();
        engine.trim_window();
        assert_eq!(engine.window().opbase(), 4);

        assert!(matches!(engine.subscribe(Some(2)), Ok(Subscription::Reload { opbase: 4 })));
        // holding version 3 means it needs 4 onward, which is still available
        assert!(matches!(engine.subscribe(Some(3)), Ok(Subscription::Live { .. })));
    }

    #[tokio::test]
    async fn test_subscribe_flushes_pending_first() {
        let (_store, mut engine) = fresh_engine(EngineConfig::for_testing());
        let Subscription::Live { mut live, .. } = engine.subscribe(None).unwrap() else {
            panic!("expected live subscription");
        };
        engine.apply(0, &payload(&[(1, 2, 3)])).unwrap();
        assert!(engine.fanout().has_pending());

        let Subscription::Live { replay, live: mut newcomer } = engine.subscribe(None).unwrap() else {
            panic!("expected live subscription");
        };
        // old subscriber got the edit live, newcomer through replay only
        assert_eq!(codec::parse_frame(&live.try_recv().unwrap()).unwrap().0, 0);
        assert_eq!(replay.len(), 1);
        assert!(newcomer.try_recv().is_err());
        assert!(!engine.fanout().has_pending());
    }

    #[tokio::test]
    async fn test_preloaded_window_skips_applied_entries() {
        let store = Arc::new(MemorySnapshotStore::new());
        let mut snapshot = Raster::new();
        snapshot.set(9, 9, 9);
        store.save(snapshot.snapshot_bytes(), 2).unwrap();

        let manager = SnapshotManager::new(store.clone());
        let mut engine = Engine::recover(&manager, 5, EngineConfig::for_testing()).unwrap();
        assert_eq!(engine.version(), Some(2));
        assert_eq!(engine.window().opbase(), 0);
        assert_eq!(engine.state(), EngineState::Replaying);

        // entries up to the snapshot version are already in the raster
        for i in 0..3u64 {
            engine.apply(i, &payload(&[(0, 0, 4)])).unwrap();
        }
        assert_eq!(engine.raster().get(0, 0), Some(0));
        assert_eq!(engine.raster().get(9, 9), Some(9));
        assert_eq!(engine.stats().applied_entries, 0);

        engine.apply(3, &payload(&[(0, 0, 4)])).unwrap();
        assert_eq!(engine.raster().get(0, 0), Some(4));
        assert_eq!(engine.state(), EngineState::Replaying);
        engine.apply(4, &payload(&[(0, 0, 5)])).unwrap();
        assert_eq!(engine.state(), EngineState::Live);
        assert_eq!(engine.version(), Some(4));

        // preloaded entries are still served to clients that were close behind
        assert_eq!(engine.window().len(), 5);
    }

    fn preloading_engine() -> Engine {
        let store = Arc::new(MemorySnapshotStore::new());
        let mut snapshot = Raster::new();
        for x in 0..=3u16 {
            snapshot.set(x, 0, 1);
        }
        store.save(snapshot.snapshot_bytes(), 3).unwrap();
        let manager = SnapshotManager::new(store);
        Engine::recover(&manager, 6, EngineConfig::for_testing()).unwrap()
    }

    #[tokio::test]
    async fn test_subscribe_during_preload_reloads() {
        let mut engine = preloading_engine();
        engine.apply(0, &payload(&[(0, 0, 1)])).unwrap();
        assert!(matches!(engine.subscribe(Some(0)), Ok(Subscription::Reload { opbase: 0 })));

        for i in 1..=3u64 {
            engine.apply(i, &payload(&[(i as u16, 0, 1)])).unwrap();
        }
        assert!(matches!(engine.subscribe(Some(0)), Ok(Subscription::Live { .. })));
    }

    #[tokio::test]
    async fn test_subscriber_held_until_preload_covers_it() {
        let mut engine = preloading_engine();
        engine.apply(0, &payload(&[(0, 0, 1)])).unwrap();

        let (reply, mut rx) = oneshot::channel();
        engine.handle(Command::Subscribe { from: Some(0), reply });
        assert!(rx.try_recv().is_err());

        for i in 1..=5u64 {
            engine.apply(i, &payload(&[(i as u16, 0, 1)])).unwrap();
        }
        engine.flush_fanout().unwrap();

        let Subscription::Live { replay, mut live } = rx.try_recv().unwrap().unwrap() else {
            panic!("expected live subscription");
        };
        let mut versions = Vec::new();
        let mut xs = Vec::new();
        for frame in replay.iter().chain(std::iter::once(&live.try_recv().unwrap())) {
            let (version, edits) = codec::parse_frame(frame).unwrap();
            versions.push(version);
            xs.extend(edits.iter().map(|e| e.x()));
        }
        assert_eq!(versions, vec![1, 2, 3, 5]);
        assert_eq!(xs, vec![1, 2, 3, 4, 5]);
        assert!(live.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_checkpoint_on_interval() {
        let config = EngineConfig {
            checkpoint_interval: 2,
            ..EngineConfig::for_testing()
        };
        let (store, mut engine) = fresh_engine(config);
        for i in 0..4u64 {
            engine.apply(i, &payload(&[(i as u16, 0, 1)])).unwrap();
        }
        if let Some(checkpointer) = engine.checkpointer.take() {
            checkpointer.shutdown().await;
        }

        let (bytes, version) = store.load().unwrap().unwrap();
        assert_eq!(version, 2);
        let restored = Raster::from_snapshot(&bytes).unwrap();
        assert_eq!(restored.get(2, 0), Some(1));
        assert_eq!(restored.get(3, 0), Some(0));
    }

    #[tokio::test]
    async fn test_running_engine_follows_log() {
        let log = Arc::new(MemoryLog::new());
        log.append(&payload(&[(1, 1, 1)])).unwrap();
        log.append(&payload(&[(2, 2, 2)])).unwrap();

        let (handle, task) = Engine::start(
            log.clone(),
            Arc::new(MemorySnapshotStore::new()),
            EngineConfig::for_testing(),
        )
        .unwrap();

        let stats = wait_for_version(&handle, 1).await;
        assert_eq!(stats.state, EngineState::Live);

        log.append(&payload(&[(3, 3, 3), (4, 4, 4)])).unwrap();
        let stats = wait_for_version(&handle, 2).await;
        assert_eq!(stats.applied_edits, 4);

        let copy = handle.fetch_raster().await.unwrap();
        assert_eq!(copy.version, Some(2));
        assert_eq!(copy.indices[4 * 1000 + 4], 4);

        drop(handle);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_trim_timer_advances_window_base() {
        let log = Arc::new(MemoryLog::new());
        for i in 0..3u16 {
            log.append(&payload(&[(i, 0, 1)])).unwrap();
        }
        let config = EngineConfig {
            trim_interval: Duration::from_secs(1),
            ..EngineConfig::for_testing()
        };
        let (handle, _task) = Engine::start(log, Arc::new(MemorySnapshotStore::new()), config).unwrap();

        let stats = wait_for_version(&handle, 2).await;
        assert_eq!(stats.opbase, 0);

        // first tick records the head, the second drops everything below it
        tokio::time::sleep(Duration::from_millis(2500)).await;
        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.opbase, 3);
        assert_eq!(stats.window_len, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_trim_interval_keeps_running() {
        let log = Arc::new(MemoryLog::new());
        log.append(&payload(&[(1, 1, 1)])).unwrap();
        let config = EngineConfig {
            trim_interval: Duration::ZERO,
            ..EngineConfig::for_testing()
        };
        let (handle, task) = Engine::start(log.clone(), Arc::new(MemorySnapshotStore::new()), config).unwrap();

        wait_for_version(&handle, 0).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        log.append(&payload(&[(2, 2, 2)])).unwrap();
        wait_for_version(&handle, 1).await;
        assert!(!task.is_finished());
    }

    #[tokio::test]
    async fn test_fanout_batches_one_frame_per_window() {
        let log = Arc::new(MemoryLog::new());
        let (handle, _task) = Engine::start(
            log.clone(),
            Arc::new(MemorySnapshotStore::new()),
            EngineConfig::for_testing(),
        )
        .unwrap();

        let Subscription::Live { replay, mut live } = handle.subscribe(None).await.unwrap() else {
            panic!("expected live subscription");
        };
        assert!(replay.is_empty());

        for i in 0..3u16 {
            log.append(&payload(&[(i, i, 2)])).unwrap();
        }
        let frame = tokio::time::timeout(Duration::from_secs(2), live.recv())
            .await
            .unwrap()
            .unwrap();
        let (version, edits) = codec::parse_frame(&frame).unwrap();
        assert_eq!(version, 2);
        assert_eq!(edits.len(), 3);

        assert!(tokio::time::timeout(Duration::from_millis(300), live.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_fatal_violation_stops_engine() {
        struct Gappy(MemoryLog);
        impl OrderedLog for Gappy {
            fn append(&self, payload: &[u8]) -> Result<u64, LogError> {
                self.0.append(payload)
            }
            fn read_from(&self, from: u64, limit: usize) -> Result<Vec<(u64, Vec<u8>)>, LogError> {
                // skip offset 1
                Ok(self
                    .0
                    .read_from(from, limit)?
                    .into_iter()
                    .filter(|(o, _)| *o != 1)
                    .collect())
            }
            fn head(&self) -> u64 {
                self.0.head()
            }
            fn watch_head(&self) -> tokio::sync::watch::Receiver<u64> {
                self.0.watch_head()
            }
        }

        let log = Arc::new(Gappy(MemoryLog::new()));
        for i in 0..3u16 {
            log.append(&payload(&[(i, 0, 1)])).unwrap();
        }
        let (handle, task) = Engine::start(
            log,
            Arc::new(MemorySnapshotStore::new()),
            EngineConfig::for_testing(),
        )
        .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(matches!(result, Err(EngineError::Contiguity { offset: 2, expected: 1 })));
        assert!(matches!(handle.stats().await, Err(EngineError::Stopped)));
    }
}
