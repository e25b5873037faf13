//! WebSocket client mirroring the canvas.
//!
//! Provides:
//! - Raster fetch over `/current`
//! - Subscription over `/changes`, resuming from the mirrored version
//! - Reload handling (refetch, then resubscribe)
//! - Edit submission over `/edit`

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::codec::{self, CodecError};
use crate::protocol::{
    EditReply, EditRequest, ProtocolError, RasterState, Route, CLOSE_LAGGING, CLOSE_RELOAD,
};
use crate::raster::Raster;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("bad frame: {0}")]
    Codec(#[from] CodecError),
    #[error("connection closed ({code}): {reason}")]
    Closed { code: u16, reason: String },
}

impl ClientError {
    fn closed(frame: Option<CloseFrame>) -> Self {
        match frame {
            Some(frame) => ClientError::Closed {
                code: u16::from(frame.code),
                reason: frame.reason.as_str().to_string(),
            },
            None => ClientError::Closed {
                code: u16::from(CloseCode::Abnormal),
                reason: String::new(),
            },
        }
    }
}

/// Subscription state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Subscribed,
}

/// What one call to [`CanvasClient::next_event`] did to the mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// A frame was applied; the mirror is now at `version`.
    Applied { version: u64, edits: usize },
    /// The server asked for a reload; the mirror was refetched.
    Reloaded { version: Option<u64> },
}

pub struct CanvasClient {
    server_url: String,
    raster: Raster,
    version: Option<u64>,
    changes: Option<WsStream>,
    reloads: u64,
}

impl CanvasClient {
    /// `server_url` is the WebSocket base, e.g. `ws://127.0.0.1:3211`.
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            raster: Raster::new(),
            version: None,
            changes: None,
            reloads: 0,
        }
    }

    async fn open(&self, route: Route) -> Result<WsStream, ClientError> {
        let url = format!("{}{}", self.server_url, route.target());
        let (ws_stream, _) = tokio_tungstenite::connect_async(&url).await?;
        Ok(ws_stream)
    }

    /// Replace the mirror with the server's current raster.
    pub async fn fetch_current(&mut self) -> Result<Option<u64>, ClientError> {
        let mut ws_stream = self.open(Route::Current).await?;
        loop {
            match ws_stream.next().await {
                Some(Ok(Message::Binary(data))) => {
                    let (raster, version) = RasterState::decode(&data)?.into_raster()?;
                    self.raster = raster;
                    self.version = version;
                    log::debug!("fetched raster at version {version:?}");
                    let _ = ws_stream.close(None).await;
                    return Ok(version);
                }
                Some(Ok(Message::Close(frame))) => return Err(ClientError::closed(frame)),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => return Err(ClientError::closed(None)),
            }
        }
    }

    /// Subscribe from the mirrored version, replacing any open subscription.
    pub async fn subscribe(&mut self) -> Result<(), ClientError> {
        if let Some(mut old) = self.changes.take() {
            let _ = old.close(None).await;
        }
        let ws_stream = self.open(Route::Changes { from: self.version }).await?;
        self.changes = Some(ws_stream);
        Ok(())
    }

    /// Wait for the next change and apply it. Subscribes first if needed.
    /// A reload instruction triggers a refetch and a fresh subscription; a
    /// lagging disconnect resumes from the mirrored version.
    pub async fn next_event(&mut self) -> Result<ChangeEvent, ClientError> {
        loop {
            if self.changes.is_none() {
                self.subscribe().await?;
            }
            let msg = match self.changes.as_mut() {
                Some(ws_stream) => ws_stream.next().await,
                None => continue,
            };
            match msg {
                Some(Ok(Message::Binary(data))) => {
                    let (version, edits) = self.apply_frame(&data)?;
                    return Ok(ChangeEvent::Applied { version, edits });
                }
                Some(Ok(Message::Close(frame))) => {
                    self.changes = None;
                    match frame.as_ref().map(|f| u16::from(f.code)) {
                        Some(CLOSE_RELOAD) => {
                            self.reloads += 1;
                            log::info!("server requested reload at {:?}", self.version);
                            let version = self.fetch_current().await?;
                            return Ok(ChangeEvent::Reloaded { version });
                        }
                        Some(CLOSE_LAGGING) => {
                            log::warn!("dropped for lagging, resuming from {:?}", self.version);
                        }
                        _ => return Err(ClientError::closed(frame)),
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    self.changes = None;
                    return Err(e.into());
                }
                None => {
                    self.changes = None;
                    return Err(ClientError::closed(None));
                }
            }
        }
    }

    /// Process events until the mirror holds at least `version`.
    pub async fn sync_to(&mut self, version: u64) -> Result<(), ClientError> {
        while self.version.is_none_or(|v| v < version) {
            self.next_event().await?;
        }
        Ok(())
    }

    /// Apply one update frame. Frames at or below the mirrored version are
    /// skipped.
    pub fn apply_frame(&mut self, bytes: &[u8]) -> Result<(u64, usize), CodecError> {
        let (version, edits) = codec::parse_frame(bytes)?;
        if self.version.is_some_and(|v| version <= v) {
            return Ok((version, 0));
        }
        for edit in &edits {
            self.raster.apply(edit);
        }
        self.version = Some(version);
        Ok((version, edits.len()))
    }

    /// Open a connection for submitting edits.
    pub async fn editor(&self) -> Result<EditSession, ClientError> {
        Ok(EditSession {
            ws_stream: self.open(Route::Edit).await?,
        })
    }

    pub async fn disconnect(&mut self) {
        if let Some(mut ws_stream) = self.changes.take() {
            let _ = ws_stream.close(None).await;
        }
    }

    pub fn state(&self) -> ConnectionState {
        if self.changes.is_some() {
            ConnectionState::Subscribed
        } else {
            ConnectionState::Disconnected
        }
    }

    pub fn raster(&self) -> &Raster {
        &self.raster
    }

    pub fn version(&self) -> Option<u64> {
        self.version
    }

    /// Reload instructions handled so far.
    pub fn reloads(&self) -> u64 {
        self.reloads
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

/// An open `/edit` connection. Requests are answered in order.
pub struct EditSession {
    ws_stream: WsStream,
}

impl EditSession {
    pub async fn submit(&mut self, x: i32, y: i32, color: i32) -> Result<EditReply, ClientError> {
        let request = EditRequest::new(x, y, color).encode()?;
        self.ws_stream.send(Message::Binary(request.into())).await?;
        loop {
            match self.ws_stream.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(EditReply::decode(&data)?),
                Some(Ok(Message::Close(frame))) => return Err(ClientError::closed(frame)),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => return Err(ClientError::closed(None)),
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.ws_stream.close(None).await;
    }
}
