//! WebSocket sync server.
//!
//! ```text
//! Client A ──┐  GET /room/<name>          ┌─ 403 when the identity may
//!            ├─ Authorization: Bearer t ──┤  not reach the room
//! Client B ──┘  (or ?token=t)             └─ upgrade otherwise
//!                        │
//!                        ▼
//!            RoomManager ── Room (room/<name>) ── DurableLog
//! ```
//!
//! Authorization runs inside the upgrade handshake, so a refused caller
//! never sees a frame and never causes a room to be created.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::StatusCode;

use crate::access::{AccessError, Authenticator};
use crate::channel::{ChannelError, WsChannel};
use crate::room::{normalize_room_id, RoomError, RoomManager};
use crate::storage::{StorageBackend, StoreError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Frames buffered per channel before a slow channel lags
    pub broadcast_capacity: usize,
    pub storage: StorageBackend,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            storage: StorageBackend::Memory,
        }
    }
}

impl ServerConfig {
    pub fn for_testing(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            broadcast_capacity: 64,
            storage: StorageBackend::Memory,
        }
    }
}

/// Connection counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_connections: AtomicU64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    auth: Arc<dyn Authenticator>,
    stats: Arc<AtomicServerStats>,
}

impl SyncServer {
    /// Create a server; opens the configured storage backend.
    pub fn new(config: ServerConfig, auth: Arc<dyn Authenticator>) -> Result<Self, StoreError> {
        let connector = config.storage.connect()?;
        let rooms = Arc::new(RoomManager::new(connector, config.broadcast_capacity));
        Ok(Self {
            config,
            rooms,
            auth,
            stats: Arc::new(AtomicServerStats::default()),
        })
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            rejected_connections: self.stats.rejected_connections.load(Ordering::Relaxed),
        }
    }

    /// Bind the configured address and serve until an accept error.
    pub async fn run(&self) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), std::io::Error> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let auth = self.auth.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, rooms, auth, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    rooms: Arc<RoomManager>,
    auth: Arc<dyn Authenticator>,
    stats: Arc<AtomicServerStats>,
) -> Result<(), RoomError> {
    stats.total_connections.fetch_add(1, Ordering::Relaxed);

    let mut target: Option<String> = None;
    let handshake = tokio_tungstenite::accept_hdr_async(
        stream,
        |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            match authorize(auth.as_ref(), request) {
                Ok(room_id) => {
                    target = Some(room_id);
                    Ok(response)
                }
                Err(e) => {
                    log::warn!("Rejected connection from {addr} to {}: {e}", request.uri().path());
                    Err(forbidden(&e))
                }
            }
        },
    )
    .await;

    let ws_stream = match handshake {
        Ok(ws_stream) => ws_stream,
        Err(e) => {
            stats.rejected_connections.fetch_add(1, Ordering::Relaxed);
            return match target {
                // Refused by policy; already logged.
                None => Ok(()),
                Some(_) => Err(ChannelError::from(e).into()),
            };
        }
    };
    let Some(room_id) = target else {
        return Ok(());
    };

    stats.active_connections.fetch_add(1, Ordering::Relaxed);
    let result = rooms.attach_channel(&room_id, WsChannel::new(ws_stream)).await;
    stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    result
}

/// Resolve the room a request asks for and check the caller may reach it.
fn authorize(auth: &dyn Authenticator, request: &Request) -> Result<String, AccessError> {
    let path = request.uri().path();
    let room_id = normalize_room_id(path);
    match room_id.strip_prefix("room/") {
        Some(name) if !name.is_empty() => {}
        _ => return Err(AccessError::Denied(path.to_string())),
    }

    let identity = auth.authenticate(request_token(request).as_deref())?;
    identity.check(room_id)?;
    log::debug!("{} may join {room_id}", identity.user);
    Ok(room_id.to_string())
}

/// Bearer token from the `Authorization` header, else the `token` query
/// parameter.
fn request_token(request: &Request) -> Option<String> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string());
    header.or_else(|| {
        request.uri().query().and_then(|query| {
            query
                .split('&')
                .find_map(|pair| pair.strip_prefix("token="))
                .map(str::to_string)
        })
    })
}

fn forbidden(error: &AccessError) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(error.to_string()));
    *response.status_mut() = StatusCode::FORBIDDEN;
    response
}
