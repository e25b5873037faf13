//! Persistent storage for the canvas.
//!
//! ```text
//! ┌──────────────┐  append/read   ┌──────────────────────────────────────┐
//! │ Aggregator / │ ─────────────► │ CanvasStore (RocksDB)                │
//! │ Engine       │                │  CF "log"      : ordered edit log    │
//! │ Checkpointer │ ─────────────► │  CF "snapshot" : raster + version    │
//! └──────────────┘  save/load     └──────────────────────────────────────┘
//! ```
//!
//! `CanvasStore` implements both [`OrderedLog`](crate::oplog::OrderedLog)
//! and [`SnapshotStore`](crate::snapshot::SnapshotStore), so one database
//! backs a whole server.

pub mod rocks;

pub use rocks::{CanvasStore, SnapshotMeta, StoreConfig, StoreError};
