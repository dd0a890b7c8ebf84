//! Duplex frame channels between a room and a replica.
//!
//! A [`Channel`] moves opaque frames. [`MemoryChannel`] connects two ends
//! inside one process; [`WsChannel`] wraps a WebSocket stream.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::protocol::ProtocolError;

/// Transport errors.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The other end is gone.
    #[error("Channel closed")]
    Closed,

    #[error("Connection failed: {0}")]
    Connect(String),

    /// The server refused the upgrade with the given HTTP status.
    #[error("Connection rejected with status {0}")]
    Rejected(u16),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// A duplex frame stream.
#[async_trait]
pub trait Channel: Send {
    /// Identifier of this end, used to exclude it from its own fan-out.
    fn id(&self) -> Uuid;

    async fn send(&mut self, frame: Vec<u8>) -> Result<(), ChannelError>;

    /// Next incoming frame; `None` once the other end disconnects.
    ///
    /// Must be cancel safe: it is raced against other sources.
    async fn recv(&mut self) -> Option<Vec<u8>>;
}

/// One end of an in-process channel pair.
pub struct MemoryChannel {
    id: Uuid,
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
}

/// Create two connected ends, each buffering up to `capacity` frames.
pub fn memory_pair(capacity: usize) -> (MemoryChannel, MemoryChannel) {
    let (tx_a, rx_a) = mpsc::channel(capacity.max(1));
    let (tx_b, rx_b) = mpsc::channel(capacity.max(1));
    (
        MemoryChannel {
            id: Uuid::new_v4(),
            tx: tx_a,
            rx: rx_b,
        },
        MemoryChannel {
            id: Uuid::new_v4(),
            tx: tx_b,
            rx: rx_a,
        },
    )
}

#[async_trait]
impl Channel for MemoryChannel {
    fn id(&self) -> Uuid {
        self.id
    }

    async fn send(&mut self, frame: Vec<u8>) -> Result<(), ChannelError> {
        self.tx.send(frame).await.map_err(|_| ChannelError::Closed)
    }

    async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

/// A WebSocket stream carrying frames as binary messages.
pub struct WsChannel<S> {
    id: Uuid,
    stream: WebSocketStream<S>,
}

impl<S> WsChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: WebSocketStream<S>) -> Self {
        Self {
            id: Uuid::new_v4(),
            stream,
        }
    }
}

#[async_trait]
impl<S> Channel for WsChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn id(&self) -> Uuid {
        self.id
    }

    async fn send(&mut self, frame: Vec<u8>) -> Result<(), ChannelError> {
        self.stream.send(Message::Binary(frame.into())).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => return Some(data.to_vec()),
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    log::debug!("WebSocket channel {} failed: {e}", self.id);
                    return None;
                }
            }
        }
    }
}
