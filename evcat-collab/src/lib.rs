//! # evcat-collab: Rooms and real-time sync for evcat stores
//!
//! Each room is one replicated catalogue store with a durable log. Channels
//! attached to a room exchange store deltas; the room merges, persists and
//! fans them out.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄────────────────► │ SyncServer  │
//! │ (local Db)  │   bincode frames   │ (auth gate)│
//! └─────────────┘                    └──────┬──────┘
//!                                           │
//!                                    ┌──────┴──────┐
//!                                    │ RoomManager │
//!                                    └──────┬──────┘
//!                                           │ one per room id
//!                              ┌────────────┼────────────┐
//!                              ▼            ▼            ▼
//!                           Db (yrs)  BroadcastGroup  DurableLog
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: SyncStep1 / SyncStep2 / Update frames
//! - [`broadcast`]: fan-out to the channels of a room
//! - [`channel`]: duplex frame channels (in-memory, WebSocket)
//! - [`room`]: Room and RoomManager
//! - [`access`]: access policy, membership registry, authenticators
//! - [`storage`]: durable logs (memory, file, RocksDB)
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket sync client

pub mod access;
pub mod broadcast;
pub mod channel;
pub mod client;
pub mod protocol;
pub mod room;
pub mod server;
pub mod storage;

pub use access::{
    membership_key, AccessError, Authenticator, Identity, MembershipRegistry, TokenAuthenticator,
};
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use channel::{memory_pair, Channel, ChannelError, MemoryChannel, WsChannel};
pub use client::{ConnectionState, SyncClient};
pub use protocol::{MessageType, ProtocolError, SyncMessage};
pub use room::{Room, RoomError, RoomManager};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use storage::{
    DurableLog, FileLog, FileLogConfig, FileLogConnector, LogConnector, MemoryConnector,
    RocksConnector, StorageBackend, StoreConfig, StoreError,
};
