//! WebSocket server exposing the canvas.
//!
//! Architecture:
//! ```text
//!  /edit ────► IngestAggregator ──append──► OrderedLog (RocksDB or memory)
//!                                              │
//!                                              ▼
//!  /current ◄── raster copy ───────────── Engine task ──checkpoint──► SnapshotStore
//!                                              │
//!  /changes ◄── catch-up frames, then ─────────┘ FanOut (broadcast)
//!               live frames
//! ```
//!
//! Each connection gets its own task. Connection tasks only ever talk to
//! the engine through its handle, so a slow or dead client never stalls
//! the apply path.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::aggregator::{AggregatorConfig, IngestAggregator, SubmitError};
use crate::engine::{Engine, EngineConfig, EngineError, EngineHandle, Subscription};
use crate::oplog::{MemoryLog, OrderedLog};
use crate::protocol::{
    EditReply, EditRequest, ProtocolError, RasterState, Route, CLOSE_BAD_REQUEST, CLOSE_LAGGING,
    CLOSE_RELOAD, RELOAD_REASON,
};
use crate::snapshot::{MemorySnapshotStore, SnapshotStore};
use crate::storage::{CanvasStore, StoreConfig, StoreError};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// RocksDB store (None = in-memory log and snapshots)
    pub storage: Option<StoreConfig>,
    pub engine: EngineConfig,
    pub aggregator: AggregatorConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3211".to_string(),
            storage: None,
            engine: EngineConfig::default(),
            aggregator: AggregatorConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            storage: None,
            engine: EngineConfig::for_testing(),
            aggregator: AggregatorConfig::for_testing(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Server counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub edits_accepted: u64,
    pub edits_rejected: u64,
    pub reloads: u64,
    pub lagging_disconnects: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    edits_accepted: AtomicU64,
    edits_rejected: AtomicU64,
    reloads: AtomicU64,
    lagging_disconnects: AtomicU64,
}

impl AtomicServerStats {
    fn snapshot(&self) -> ServerStats {
        ServerStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            edits_accepted: self.edits_accepted.load(Ordering::Relaxed),
            edits_rejected: self.edits_rejected.load(Ordering::Relaxed),
            reloads: self.reloads.load(Ordering::Relaxed),
            lagging_disconnects: self.lagging_disconnects.load(Ordering::Relaxed),
        }
    }
}

struct Shared {
    engine: EngineHandle,
    aggregator: IngestAggregator,
    stats: AtomicServerStats,
}

pub struct CanvasServer {
    config: ServerConfig,
    shared: Arc<Shared>,
    engine_task: JoinHandle<Result<(), EngineError>>,
    store: Option<Arc<CanvasStore>>,
}

impl CanvasServer {
    /// Open storage (if configured), recover the engine and start the
    /// write path. Must be called inside a tokio runtime.
    pub fn start(config: ServerConfig) -> Result<Self, ServerError> {
        match &config.storage {
            Some(store_config) => {
                let store = Arc::new(CanvasStore::open(store_config.clone())?);
                let mut server = Self::with_backends(config, store.clone(), store.clone())?;
                server.store = Some(store);
                Ok(server)
            }
            None => {
                log::warn!("no storage configured, canvas will not survive a restart");
                Self::with_backends(
                    config,
                    Arc::new(MemoryLog::new()),
                    Arc::new(MemorySnapshotStore::new()),
                )
            }
        }
    }

    /// Start on caller-provided log and snapshot backends.
    pub fn with_backends(
        config: ServerConfig,
        oplog: Arc<dyn OrderedLog>,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> Result<Self, ServerError> {
        let (engine, engine_task) = Engine::start(oplog.clone(), snapshots, config.engine.clone())?;
        let aggregator = IngestAggregator::spawn(oplog, config.aggregator.clone());
        Ok(Self {
            config,
            shared: Arc::new(Shared {
                engine,
                aggregator,
                stats: AtomicServerStats::default(),
            }),
            engine_task,
            store: None,
        })
    }

    /// Bind the configured address and serve until the engine stops.
    pub async fn run(self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from `listener` until the engine stops. An engine
    /// failure is returned as the server's error.
    pub async fn serve(self, listener: TcpListener) -> Result<(), ServerError> {
        log::info!("canvas server listening on {}", listener.local_addr()?);
        let Self {
            shared,
            mut engine_task,
            ..
        } = self;

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    log::debug!("new TCP connection from {addr}");
                    let shared = Arc::clone(&shared);
                    tokio::spawn(async move {
                        shared.stats.total_connections.fetch_add(1, Ordering::Relaxed);
                        shared.stats.active_connections.fetch_add(1, Ordering::Relaxed);
                        let conn_id = Uuid::new_v4();
                        if let Err(e) = handle_connection(stream, addr, conn_id, &shared).await {
                            log::warn!("connection {conn_id} ({addr}) error: {e}");
                        }
                        log::info!("connection {conn_id} ({addr}) closed");
                        shared.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
                    });
                }
                finished = &mut engine_task => {
                    return match finished {
                        Ok(Ok(())) => {
                            log::info!("engine finished, server stopping");
                            Ok(())
                        }
                        Ok(Err(e)) => Err(e.into()),
                        Err(e) => {
                            log::error!("engine task failed: {e}");
                            Err(EngineError::Stopped.into())
                        }
                    };
                }
            }
        }
    }

    pub fn engine(&self) -> &EngineHandle {
        &self.shared.engine
    }

    pub fn aggregator(&self) -> &IngestAggregator {
        &self.shared.aggregator
    }

    pub fn stats(&self) -> ServerStats {
        self.shared.stats.snapshot()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// The RocksDB store, when one is configured.
    pub fn store(&self) -> Option<&Arc<CanvasStore>> {
        self.store.as_ref()
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    conn_id: Uuid,
    shared: &Shared,
) -> Result<(), ServerError> {
    let mut target = String::new();
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        target = req
            .uri()
            .path_and_query()
            .map(|p| p.as_str().to_string())
            .unwrap_or_default();
        Ok(resp)
    })
    .await?;
    let (mut sender, receiver) = ws_stream.split();

    let route = match Route::parse(&target) {
        Ok(route) => route,
        Err(e) => {
            log::debug!("rejecting {target} from {addr}: {e}");
            send_close(&mut sender, CLOSE_BAD_REQUEST, &e.to_string()).await;
            return Ok(());
        }
    };
    log::info!("connection {conn_id} ({addr}) opened on {}", route.target());

    match route {
        Route::Changes { from } => serve_changes(sender, receiver, from, conn_id, shared).await,
        Route::Edit => serve_edits(sender, receiver, addr, shared).await,
        Route::Current => serve_current(sender, shared).await,
    }
}

async fn serve_changes(
    mut sender: WsSink,
    mut receiver: WsSource,
    from: Option<u64>,
    conn_id: Uuid,
    shared: &Shared,
) -> Result<(), ServerError> {
    let (replay, mut live) = match shared.engine.subscribe(from).await? {
        Subscription::Reload { opbase } => {
            log::info!("subscriber {conn_id} asked for {from:?}, window starts at {opbase}: reload");
            shared.stats.reloads.fetch_add(1, Ordering::Relaxed);
            send_close(&mut sender, CLOSE_RELOAD, RELOAD_REASON).await;
            return Ok(());
        }
        Subscription::Live { replay, live } => (replay, live),
    };

    for frame in replay {
        sender.send(Message::Binary(frame.into())).await?;
    }

    loop {
        tokio::select! {
            frame = live.recv() => match frame {
                Ok(frame) => sender.send(Message::Binary(frame.to_vec().into())).await?,
                Err(RecvError::Lagged(missed)) => {
                    log::warn!("subscriber {conn_id} lagged {missed} frames behind, disconnecting");
                    shared.stats.lagging_disconnects.fetch_add(1, Ordering::Relaxed);
                    send_close(&mut sender, CLOSE_LAGGING, "lagging").await;
                    break;
                }
                Err(RecvError::Closed) => {
                    send_close(&mut sender, u16::from(CloseCode::Away), "engine stopped").await;
                    break;
                }
            },
            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    log::debug!("subscriber {conn_id} read error: {e}");
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }
    log::debug!("subscriber {conn_id} done");
    Ok(())
}

async fn serve_edits(
    mut sender: WsSink,
    mut receiver: WsSource,
    addr: SocketAddr,
    shared: &Shared,
) -> Result<(), ServerError> {
    while let Some(msg) = receiver.next().await {
        let data = match msg? {
            Message::Binary(data) => data,
            Message::Close(_) => break,
            _ => continue,
        };
        let reply = match EditRequest::decode(&data) {
            Ok(req) => {
                let result = shared
                    .aggregator
                    .submit(addr.ip(), i64::from(req.x), i64::from(req.y), i64::from(req.color))
                    .await;
                match result {
                    Ok(offset) => {
                        shared.stats.edits_accepted.fetch_add(1, Ordering::Relaxed);
                        EditReply::Accepted { offset }
                    }
                    Err(e) => {
                        shared.stats.edits_rejected.fetch_add(1, Ordering::Relaxed);
                        match e {
                            SubmitError::RateLimited => EditReply::RateLimited,
                            SubmitError::Invalid(e) => EditReply::Invalid(e.to_string()),
                            other => EditReply::Failed(other.to_string()),
                        }
                    }
                }
            }
            Err(e) => EditReply::Invalid(e.to_string()),
        };
        sender.send(Message::Binary(reply.encode()?.into())).await?;
    }
    Ok(())
}

async fn serve_current(mut sender: WsSink, shared: &Shared) -> Result<(), ServerError> {
    let copy = shared.engine.fetch_raster().await?;
    let state = tokio::task::spawn_blocking(move || RasterState::from_copy(&copy).encode())
        .await
        .map_err(|_| EngineError::Stopped)??;
    sender.send(Message::Binary(state.into())).await?;
    send_close(&mut sender, u16::from(CloseCode::Normal), "").await;
    Ok(())
}

/// Best-effort close; the peer may already be gone.
async fn send_close(sender: &mut WsSink, code: u16, reason: &str) {
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    };
    if let Err(e) = sender.send(Message::Close(Some(frame))).await {
        log::debug!("close {code} not delivered: {e}");
    }
}
