//! # canvas-sync: replicated pixel canvas over an ordered log
//!
//! A shared 1000×1000, 16-color grid. Clients submit single-cell edits; the
//! server appends them to an ordered log, applies them to an authoritative
//! raster in log order and fans compact binary frames out to subscribers.
//!
//! ## Architecture
//!
//! ```text
//!  ┌─────────────┐  /edit   ┌──────────────────┐ append ┌────────────┐
//!  │CanvasClient │ ───────► │ IngestAggregator │ ─────► │ OrderedLog │
//!  │ (mirror)    │          │ (rate, batching) │        └─────┬──────┘
//!  └──────▲──────┘          └──────────────────┘              │ tail
//!         │                                                   ▼
//!         │  /changes, /current                        ┌────────────┐ checkpoint ┌───────────────┐
//!         └─────────────────────────────────────────── │   Engine   │ ─────────► │ SnapshotStore │
//!                                                      │  (actor)   │            └───────────────┘
//!                                                      └─────┬──────┘
//!                                                 CatchupWindow + FanOut
//! ```
//!
//! ## Modules
//!
//! - [`codec`]: 3-byte edit encoding and update frames
//! - [`entry`]: log payloads (single edit or batch)
//! - [`raster`]: the palette-indexed grid
//! - [`window`]: bounded catch-up window with watermark trimming
//! - [`oplog`]: ordered-log contract, tail-follow stream, in-memory log
//! - [`snapshot`]: snapshot contract, recovery, background checkpointer
//! - [`engine`]: the log-consuming actor that owns raster and version
//! - [`broadcast`]: time-windowed fan-out to subscribers
//! - [`rate_limit`] / [`aggregator`]: the write path
//! - [`storage`]: RocksDB-backed log and snapshot store
//! - [`protocol`] / [`server`] / [`client`]: WebSocket surfaces

pub mod aggregator;
pub mod broadcast;
pub mod client;
pub mod codec;
pub mod engine;
pub mod entry;
pub mod oplog;
pub mod protocol;
pub mod raster;
pub mod rate_limit;
pub mod server;
pub mod snapshot;
pub mod storage;
pub mod window;

// Re-exports for convenience
pub use aggregator::{AggregatorConfig, IngestAggregator, SubmitError};
pub use broadcast::{FanOut, FanOutStats};
pub use client::{CanvasClient, ChangeEvent, ClientError, ConnectionState, EditSession};
pub use codec::{CodecError, Edit};
pub use engine::{
    Engine, EngineConfig, EngineError, EngineHandle, EngineState, EngineStats, RasterCopy, Subscription,
};
pub use entry::LogEntry;
pub use oplog::{LogError, MemoryLog, OrderedLog};
pub use protocol::{EditReply, EditRequest, ProtocolError, RasterState, Route};
pub use raster::{Raster, RasterError, PALETTE};
pub use rate_limit::RateLimiter;
pub use server::{CanvasServer, ServerConfig, ServerError, ServerStats};
pub use snapshot::{Checkpointer, MemorySnapshotStore, SnapshotError, SnapshotManager, SnapshotStore};
pub use storage::{CanvasStore, SnapshotMeta, StoreConfig, StoreError};
pub use window::{CatchupWindow, WindowError};
