//! Binary frames exchanged between a room and its channels.
//!
//! Wire format (bincode, standard config):
//! ```text
//! ┌──────────┬───────────┬──────────┐
//! │ msg_type │ peer_id   │ payload  │
//! │ 1 byte   │ 16 bytes  │ variable │
//! └──────────┴───────────┴──────────┘
//! ```
//!
//! The payload is opaque to this layer: a state vector for `SyncStep1`,
//! a store delta for `SyncStep2` and `Update`.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Frame kinds of the sync handshake and steady-state updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// State vector; the receiver answers with the diff the sender lacks
    SyncStep1 = 1,
    /// Diff answering a `SyncStep1`
    SyncStep2 = 2,
    /// Incremental delta
    Update = 3,
}

/// A single frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    /// Originating peer; nil when the room itself speaks
    pub peer_id: Uuid,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    pub fn sync_step1(peer_id: Uuid, state_vector: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::SyncStep1,
            peer_id,
            payload: state_vector,
        }
    }

    pub fn sync_step2(peer_id: Uuid, diff: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::SyncStep2,
            peer_id,
            payload: diff,
        }
    }

    pub fn update(peer_id: Uuid, delta: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::Update,
            peer_id,
            payload: delta,
        }
    }

    /// Whether the payload is a delta to merge.
    pub fn carries_delta(&self) -> bool {
        matches!(self.msg_type, MessageType::SyncStep2 | MessageType::Update)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _): (Self, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }
}

/// Frame codec errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}
