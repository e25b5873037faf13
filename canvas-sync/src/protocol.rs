//! WebSocket surfaces and their control messages.
//!
//! Routes (chosen by request path):
//! ```text
//! /changes?from=N   server → client: update frames (see codec), N = last held version or -1
//! /edit             client → server: EditRequest, server → client: EditReply (one per request)
//! /current          server → client: one RasterState, then close
//! ```
//!
//! Control messages are bincode-encoded (standard config). Update frames are
//! raw binary and never wrapped.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::RasterCopy;
use crate::raster::{Raster, RasterError};

/// Close code instructing the client to refetch `/current` and resubscribe.
pub const CLOSE_RELOAD: u16 = 4000;
/// Close code for a malformed request (bad path or `from`).
pub const CLOSE_BAD_REQUEST: u16 = 4400;
/// Close code for a subscriber that fell too far behind the live stream.
pub const CLOSE_LAGGING: u16 = 4408;
/// Close reason sent with [`CLOSE_RELOAD`].
pub const RELOAD_REASON: &str = "reload";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unknown route: {0}")]
    UnknownRoute(String),
    #[error("invalid from= parameter: {0:?}")]
    InvalidFrom(String),
    #[error("version {0} out of range")]
    InvalidVersion(i64),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("bad raster: {0}")]
    Raster(#[from] RasterError),
}

fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(msg, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(msg)
}

/// One edit submitted over `/edit`. Values are unchecked until the
/// aggregator validates them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditRequest {
    pub x: i32,
    pub y: i32,
    pub color: i32,
}

impl EditRequest {
    pub fn new(x: i32, y: i32, color: i32) -> Self {
        Self { x, y, color }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EditReply {
    /// Appended; `offset` is the log offset of the carrying batch.
    Accepted { offset: u64 },
    RateLimited,
    Invalid(String),
    Failed(String),
}

impl EditReply {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

/// Full raster export. `version` is -1 for an empty canvas; a client
/// subscribes with `from=version` after applying it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RasterState {
    pub version: i64,
    pub width: u16,
    pub height: u16,
    /// LZ4 (size-prepended) palette indices, row-major
    pub raster: Vec<u8>,
}

impl RasterState {
    pub fn from_copy(copy: &RasterCopy) -> Self {
        Self {
            version: version_to_wire(copy.version),
            width: copy.width,
            height: copy.height,
            raster: lz4_flex::compress_prepend_size(&copy.indices),
        }
    }

    /// Decompress into a raster and its version.
    pub fn into_raster(self) -> Result<(Raster, Option<u64>), ProtocolError> {
        let version = version_from_wire(self.version)?;
        let indices = lz4_flex::decompress_size_prepended(&self.raster)
            .map_err(|e| ProtocolError::Compression(e.to_string()))?;
        let raster = Raster::from_snapshot_sized(&indices, self.width, self.height)?;
        Ok((raster, version))
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

/// `None` (nothing applied) is -1 on the wire.
pub fn version_to_wire(version: Option<u64>) -> i64 {
    version.map_or(-1, |v| v as i64)
}

pub fn version_from_wire(version: i64) -> Result<Option<u64>, ProtocolError> {
    match version {
        -1 => Ok(None),
        v if v >= 0 => Ok(Some(v as u64)),
        v => Err(ProtocolError::InvalidVersion(v)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Changes { from: Option<u64> },
    Edit,
    Current,
}

impl Route {
    /// Route a request target such as `/changes?from=12`.
    pub fn parse(target: &str) -> Result<Self, ProtocolError> {
        let (path, query) = target.split_once('?').unwrap_or((target, ""));
        match path {
            "/changes" => {
                let from = query
                    .split('&')
                    .find_map(|pair| pair.strip_prefix("from="))
                    .ok_or_else(|| ProtocolError::InvalidFrom(String::new()))?;
                Ok(Route::Changes {
                    from: parse_from(from)?,
                })
            }
            "/edit" => Ok(Route::Edit),
            "/current" => Ok(Route::Current),
            other => Err(ProtocolError::UnknownRoute(other.to_string())),
        }
    }

    /// Request path for this route.
    pub fn target(&self) -> String {
        match self {
            Route::Changes { from } => format!("/changes?from={}", version_to_wire(*from)),
            Route::Edit => "/edit".to_string(),
            Route::Current => "/current".to_string(),
        }
    }
}

/// Parse a `from` value: the last version a client holds, or -1.
pub fn parse_from(raw: &str) -> Result<Option<u64>, ProtocolError> {
    let value: i64 = raw
        .trim()
        .parse()
        .map_err(|_| ProtocolError::InvalidFrom(raw.to_string()))?;
    version_from_wire(value).map_err(|_| ProtocolError::InvalidFrom(raw.to_string()))
}
