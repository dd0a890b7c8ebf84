//! Binds a local store to a remote room.
//!
//! The client ships every local-origin delta of its [`Db`] as an `Update`
//! frame and merges every delta it receives, so remote changes fire the
//! store's remote-origin notifications. On attach both sides exchange
//! `SyncStep1`, which brings a reconnecting replica up to date in both
//! directions.

use std::sync::Arc;

use evcat_core::{Db, ListenerId, Origin};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use uuid::Uuid;

use crate::channel::{Channel, ChannelError, WsChannel};
use crate::protocol::{MessageType, SyncMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Keeps a [`Db`] in sync with one room.
pub struct SyncClient {
    peer_id: Uuid,
    db: Arc<Db>,
    state: Arc<RwLock<ConnectionState>>,
    task: Option<JoinHandle<()>>,
    listener: Option<ListenerId>,
}

impl SyncClient {
    pub fn new(db: Arc<Db>) -> Self {
        Self {
            peer_id: Uuid::new_v4(),
            db,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            task: None,
            listener: None,
        }
    }

    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    pub fn db(&self) -> &Arc<Db> {
        &self.db
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Connect to `ws://host:port/room/<name>`, presenting `token` as a
    /// bearer credential.
    pub async fn connect(&mut self, url: &str, token: Option<&str>) -> Result<(), ChannelError> {
        self.disconnect().await;
        *self.state.write().await = ConnectionState::Connecting;

        match open_websocket(url, token).await {
            Ok(channel) => {
                log::info!("Connected to {url}");
                self.attach(channel).await;
                Ok(())
            }
            Err(e) => {
                log::warn!("Cannot connect to {url}: {e}");
                *self.state.write().await = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    /// Start syncing over an already-open channel.
    pub async fn attach<C: Channel + 'static>(&mut self, channel: C) {
        self.disconnect().await;

        let (local_tx, local_rx) = mpsc::unbounded_channel();
        self.listener = Some(self.db.on_update(move |delta, origin| {
            if origin == Origin::Local {
                let _ = local_tx.send(delta.to_vec());
            }
        }));
        *self.state.write().await = ConnectionState::Connected;

        self.task = Some(tokio::spawn(run(
            self.peer_id,
            self.db.clone(),
            channel,
            local_rx,
            self.state.clone(),
        )));
    }

    /// Drop the connection. Local mutations keep accumulating in the store
    /// and are exchanged on the next attach.
    pub async fn disconnect(&mut self) {
        self.stop();
        *self.state.write().await = ConnectionState::Disconnected;
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(listener) = self.listener.take() {
            self.db.unsubscribe(listener);
        }
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn open_websocket(
    url: &str,
    token: Option<&str>,
) -> Result<WsChannel<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>, ChannelError> {
    let mut request = url.into_client_request()?;
    if let Some(token) = token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| ChannelError::Connect(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }
    match tokio_tungstenite::connect_async(request).await {
        Ok((stream, _)) => Ok(WsChannel::new(stream)),
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            Err(ChannelError::Rejected(response.status().as_u16()))
        }
        Err(e) => Err(e.into()),
    }
}

async fn run<C: Channel>(
    peer_id: Uuid,
    db: Arc<Db>,
    mut channel: C,
    local: mpsc::UnboundedReceiver<Vec<u8>>,
    state: Arc<RwLock<ConnectionState>>,
) {
    match drive(peer_id, &db, &mut channel, local).await {
        Ok(()) => log::info!("Sync channel {} closed", channel.id()),
        Err(e) => log::warn!("Sync channel {} failed: {e}", channel.id()),
    }
    *state.write().await = ConnectionState::Disconnected;
}

async fn drive<C: Channel>(
    peer_id: Uuid,
    db: &Db,
    channel: &mut C,
    mut local: mpsc::UnboundedReceiver<Vec<u8>>,
) -> Result<(), ChannelError> {
    let hello = SyncMessage::sync_step1(peer_id, db.state_vector());
    channel.send(hello.encode()?).await?;

    loop {
        tokio::select! {
            frame = channel.recv() => match frame {
                Some(bytes) => handle_frame(peer_id, db, channel, &bytes).await?,
                None => return Ok(()),
            },
            delta = local.recv() => match delta {
                Some(delta) => channel.send(SyncMessage::update(peer_id, delta).encode()?).await?,
                None => return Ok(()),
            },
        }
    }
}

async fn handle_frame<C: Channel>(
    peer_id: Uuid,
    db: &Db,
    channel: &mut C,
    bytes: &[u8],
) -> Result<(), ChannelError> {
    let msg = match SyncMessage::decode(bytes) {
        Ok(msg) => msg,
        Err(e) => {
            log::warn!("Dropping undecodable frame: {e}");
            return Ok(());
        }
    };
    match msg.msg_type {
        MessageType::SyncStep1 => match db.encode_delta(&msg.payload) {
            Ok(diff) => channel.send(SyncMessage::sync_step2(peer_id, diff).encode()?).await?,
            Err(e) => log::warn!("Bad state vector from room: {e}"),
        },
        MessageType::SyncStep2 | MessageType::Update => {
            if let Err(e) = db.merge_delta(&msg.payload) {
                log::warn!("Cannot merge delta from room: {e}");
            }
        }
    }
    Ok(())
}
