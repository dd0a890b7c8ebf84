//! Rooms: named, durable stores shared by the channels attached to them.
//!
//! ```text
//! channel A ──┐  SyncStep1/2, Update          ┌── channel B
//!             ▼                               │
//!        Room::serve ── merge ──► Db ─────────┤ (excluding A)
//!             │                   │ local      │
//!             ▼                   ▼ deltas     │
//!        DurableLog ◄──────── commit ──► BroadcastGroup
//! ```
//!
//! Every delta is merged, appended to the room's log and only then fanned
//! out, one delta at a time per room. A log write failure stops the room.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use evcat_core::{Db, DbError, ListenerId, Origin};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio::sync::{mpsc, Mutex, OnceCell, RwLock};
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, BroadcastStats, Fanout, PeerHandle};
use crate::channel::{Channel, ChannelError};
use crate::protocol::{MessageType, ProtocolError, SyncMessage};
use crate::storage::{DurableLog, LogConnector, StoreError};

/// Room errors.
#[derive(Debug, Error)]
pub enum RoomError {
    /// Fatal for the room's session.
    #[error("Durable log of room {room} failed: {source}")]
    Log {
        room: String,
        #[source]
        source: StoreError,
    },

    #[error("Room {0} stopped after a durable log failure")]
    Failed(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Db(#[from] DbError),
}

/// Canonical form of a room identifier: no leading `/`.
pub fn normalize_room_id(room_id: &str) -> &str {
    room_id.trim_start_matches('/')
}

/// A store, its durable log and the channels attached to it.
pub struct Room {
    id: String,
    db: Db,
    log: Mutex<Box<dyn DurableLog>>,
    broadcast: BroadcastGroup,
    failed: AtomicBool,
    local_listener: ListenerId,
}

impl Room {
    /// Rebuild a room from its log and start forwarding local mutations.
    ///
    /// Must be called within a tokio runtime.
    pub async fn open(
        id: impl Into<String>,
        mut log: Box<dyn DurableLog>,
        broadcast_capacity: usize,
    ) -> Result<Arc<Self>, RoomError> {
        let id = id.into();
        let db = Db::new();
        let records = log.replay().await?;
        let mut skipped = 0;
        for record in &records {
            if let Err(e) = db.merge_delta(record) {
                log::warn!("Room {id}: skipping unreadable log record: {e}");
                skipped += 1;
            }
        }
        log::info!("Room {id} replayed {} log records ({skipped} skipped)", records.len());

        let (local_tx, local_rx) = mpsc::unbounded_channel();
        let local_listener = db.on_update(move |delta, origin| {
            if origin == Origin::Local {
                let _ = local_tx.send(delta.to_vec());
            }
        });

        let room = Arc::new(Self {
            id,
            db,
            log: Mutex::new(log),
            broadcast: BroadcastGroup::new(broadcast_capacity),
            failed: AtomicBool::new(false),
            local_listener,
        });
        tokio::spawn(forward_local(Arc::downgrade(&room), local_rx));
        Ok(room)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The room's store. Local mutations made through it reach every
    /// attached channel and the log.
    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub async fn peer_count(&self) -> usize {
        self.broadcast.peer_count().await
    }

    pub async fn stats(&self) -> BroadcastStats {
        self.broadcast.stats().await
    }

    /// Attach a channel and serve it until it disconnects or is detached.
    pub async fn serve<C: Channel>(&self, mut channel: C) -> Result<(), RoomError> {
        let peer_id = channel.id();
        let (handle, mut rx) = self.broadcast.add_peer(peer_id).await;
        log::info!("Channel {peer_id} joined room {}", self.id);

        let result = self.run_channel(&mut channel, &handle, &mut rx).await;

        self.broadcast.remove_peer(&peer_id).await;
        log::info!("Channel {peer_id} left room {}", self.id);
        match result {
            Err(RoomError::Channel(ChannelError::Closed)) => Ok(()),
            other => other,
        }
    }

    /// Stop serving a channel. Returns whether it was attached.
    pub async fn detach(&self, channel_id: Uuid) -> bool {
        self.broadcast.kick_peer(&channel_id).await
    }

    async fn run_channel<C: Channel>(
        &self,
        channel: &mut C,
        handle: &PeerHandle,
        rx: &mut Receiver<Fanout>,
    ) -> Result<(), RoomError> {
        let hello = SyncMessage::sync_step1(Uuid::nil(), self.db.state_vector());
        channel.send(hello.encode()?).await?;

        loop {
            tokio::select! {
                frame = channel.recv() => match frame {
                    Some(bytes) => self.handle_frame(channel, &bytes).await?,
                    None => return Ok(()),
                },
                fanout = rx.recv() => match fanout {
                    Ok(fanout) if fanout.from == handle.peer_id => {}
                    Ok(fanout) => channel.send(fanout.frame.to_vec()).await?,
                    Err(RecvError::Lagged(missed)) => {
                        self.broadcast.record_dropped(missed);
                        log::warn!(
                            "Channel {} lagged {missed} frames in room {}, resending state",
                            handle.peer_id,
                            self.id
                        );
                        let state = SyncMessage::sync_step2(Uuid::nil(), self.db.encode_state()?);
                        channel.send(state.encode()?).await?;
                    }
                    Err(RecvError::Closed) => return Ok(()),
                },
                _ = handle.kicked() => return Ok(()),
            }
            if self.is_failed() {
                return Err(RoomError::Failed(self.id.clone()));
            }
        }
    }

    async fn handle_frame<C: Channel>(&self, channel: &mut C, bytes: &[u8]) -> Result<(), RoomError> {
        let msg = match SyncMessage::decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Room {}: dropping frame from {}: {e}", self.id, channel.id());
                return Ok(());
            }
        };
        match msg.msg_type {
            MessageType::SyncStep1 => match self.db.encode_delta(&msg.payload) {
                Ok(diff) => {
                    let reply = SyncMessage::sync_step2(Uuid::nil(), diff);
                    channel.send(reply.encode()?).await?;
                }
                Err(e) => log::warn!("Room {}: bad state vector from {}: {e}", self.id, channel.id()),
            },
            MessageType::SyncStep2 | MessageType::Update => {
                match self.apply_remote(channel.id(), msg.payload).await {
                    Err(RoomError::Db(e)) => {
                        log::warn!("Room {}: rejected delta from {}: {e}", self.id, channel.id())
                    }
                    other => other?,
                }
            }
        }
        Ok(())
    }

    /// Merge a delta received from `from`, persist it and fan it out to
    /// every other channel.
    pub async fn apply_remote(&self, from: Uuid, delta: Vec<u8>) -> Result<(), RoomError> {
        let mut log = self.log.lock().await;
        self.ensure_running()?;
        self.db.merge_delta(&delta)?;
        self.persist_and_fan_out(&mut log, from, delta).await
    }

    /// Persist and fan out a delta already applied to the store.
    async fn commit_local(&self, delta: Vec<u8>) -> Result<(), RoomError> {
        let mut log = self.log.lock().await;
        self.ensure_running()?;
        self.persist_and_fan_out(&mut log, Uuid::nil(), delta).await
    }

    async fn persist_and_fan_out(
        &self,
        log: &mut Box<dyn DurableLog>,
        from: Uuid,
        delta: Vec<u8>,
    ) -> Result<(), RoomError> {
        if let Err(source) = log.append(&delta).await {
            self.failed.store(true, Ordering::Release);
            log::error!("Room {}: durable log write failed, stopping: {source}", self.id);
            return Err(RoomError::Log {
                room: self.id.clone(),
                source,
            });
        }
        let frame = SyncMessage::update(from, delta).encode()?;
        self.broadcast.broadcast(from, frame);
        Ok(())
    }

    fn ensure_running(&self) -> Result<(), RoomError> {
        if self.is_failed() {
            Err(RoomError::Failed(self.id.clone()))
        } else {
            Ok(())
        }
    }

    /// Fold the log into one snapshot of the current state.
    pub async fn compact(&self) -> Result<(), RoomError> {
        let mut log = self.log.lock().await;
        self.ensure_running()?;
        let state = self.db.encode_state()?;
        log.compact(&state).await?;
        Ok(())
    }
}

impl Drop for Room {
    fn drop(&mut self) {
        self.db.unsubscribe(self.local_listener);
    }
}

async fn forward_local(room: Weak<Room>, mut deltas: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(delta) = deltas.recv().await {
        let Some(room) = room.upgrade() else {
            break;
        };
        if let Err(e) = room.commit_local(delta).await {
            log::error!("Room {}: cannot commit local delta: {e}", room.id);
        }
    }
}

/// A room being opened, or open.
type Slot = Arc<OnceCell<Arc<Room>>>;

/// Maps room identifiers to live rooms.
///
/// Creating a room replays its durable log before any channel attaches.
/// The registry lock only guards claiming a slot; the replay runs inside
/// the slot, so other rooms open in parallel. A room is released, after
/// compacting its log, once no channel and no caller holds it.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Slot>>,
    connector: Arc<dyn LogConnector>,
    broadcast_capacity: usize,
}

impl RoomManager {
    pub fn new(connector: Arc<dyn LogConnector>, broadcast_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            connector,
            broadcast_capacity,
        }
    }

    /// Get the live room for `room_id`, or rebuild it from its log.
    pub async fn get_or_create(&self, room_id: &str) -> Result<Arc<Room>, RoomError> {
        let id = normalize_room_id(room_id);
        let existing = self.rooms.read().await.get(id).cloned();
        let slot = match existing {
            Some(slot) => slot,
            None => self.rooms.write().await.entry(id.to_string()).or_default().clone(),
        };

        let opened = slot
            .get_or_try_init(|| async {
                let log = self.connector.open(id)?;
                let room = Room::open(id, log, self.broadcast_capacity).await?;
                log::info!("Created room {id}");
                Ok::<_, RoomError>(room)
            })
            .await;
        match opened {
            Ok(room) => Ok(room.clone()),
            Err(e) => {
                let mut rooms = self.rooms.write().await;
                // Other callers still waiting on the slot will retry it.
                let abandoned = rooms.get(id).is_some_and(|s| {
                    Arc::ptr_eq(s, &slot) && !s.initialized() && Arc::strong_count(s) == 2
                });
                if abandoned {
                    rooms.remove(id);
                }
                Err(e)
            }
        }
    }

    pub async fn get(&self, room_id: &str) -> Option<Arc<Room>> {
        let rooms = self.rooms.read().await;
        rooms.get(normalize_room_id(room_id)).and_then(|slot| slot.get().cloned())
    }

    /// Serve `channel` in the room until it disconnects, then release the
    /// room if nothing else uses it.
    pub async fn attach_channel<C: Channel>(&self, room_id: &str, channel: C) -> Result<(), RoomError> {
        let room = self.get_or_create(room_id).await?;
        let result = room.serve(channel).await;
        self.release(room).await;
        result
    }

    /// Stop serving a channel. Returns whether it was attached to the room.
    pub async fn detach_channel(&self, room_id: &str, channel_id: Uuid) -> bool {
        match self.get(room_id).await {
            Some(room) => room.detach(channel_id).await,
            None => false,
        }
    }

    async fn release(&self, room: Arc<Room>) {
        let mut rooms = self.rooms.write().await;
        let Some(slot) = rooms.get(room.id()) else {
            return;
        };
        if !slot.get().is_some_and(|registered| Arc::ptr_eq(registered, &room)) {
            return;
        }
        // The registry and this caller are the only holders, and nobody is
        // between claiming the slot and taking the room out of it.
        if Arc::strong_count(slot) > 1 || Arc::strong_count(&room) > 2 {
            return;
        }
        if room.peer_count().await > 0 {
            return;
        }
        if room.is_failed() {
            log::warn!("Dropping failed room {} without compaction", room.id());
        } else if let Err(e) = room.compact().await {
            log::error!("Room {}: compaction failed: {e}", room.id());
        }
        rooms.remove(room.id());
        log::info!("Released room {}", room.id());
    }

    /// Identifiers of the rooms currently in memory, sorted.
    pub async fn active_rooms(&self) -> Vec<String> {
        let rooms = self.rooms.read().await;
        let mut ids: Vec<String> = rooms
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn room_count(&self) -> usize {
        let rooms = self.rooms.read().await;
        rooms.values().filter(|slot| slot.initialized()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::memory_pair;
    use crate::storage::MemoryConnector;
    use async_trait::async_trait;
    use evcat_core::{CatalogueDraft, EventDraft};
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next_frame(channel: &mut impl Channel) -> SyncMessage {
        let bytes = timeout(Duration::from_secs(2), channel.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("channel closed");
        SyncMessage::decode(&bytes).unwrap()
    }

    /// Skip frames until one of the given kind arrives.
    async fn frame_of(channel: &mut impl Channel, kind: MessageType) -> SyncMessage {
        loop {
            let frame = next_frame(channel).await;
            if frame.msg_type == kind {
                return frame;
            }
        }
    }

    fn manager() -> (Arc<RoomManager>, MemoryConnector) {
        let connector = MemoryConnector::new();
        (Arc::new(RoomManager::new(Arc::new(connector.clone()), 64)), connector)
    }

    #[test]
    fn test_normalize_room_id() {
        assert_eq!(normalize_room_id("/room/a"), "room/a");
        assert_eq!(normalize_room_id("room/a"), "room/a");
    }

    #[tokio::test]
    async fn test_get_or_create_returns_same_room() {
        let (manager, _) = manager();
        let a = manager.get_or_create("room/a").await.unwrap();
        let b = manager.get_or_create("/room/a").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        manager.get_or_create("room/b").await.unwrap();
        assert_eq!(manager.active_rooms().await, vec!["room/a", "room/b"]);
    }

    #[tokio::test]
    async fn test_concurrent_creation_yields_one_room() {
        let (manager, _) = manager();
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.get_or_create("room/race").await.unwrap() })
            })
            .collect();
        let mut rooms = Vec::new();
        for task in tasks {
            rooms.push(task.await.unwrap());
        }
        assert!(rooms.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(manager.room_count().await, 1);
    }

    /// Replays of `room/slow` block until the gate opens.
    struct GatedConnector {
        gate: Arc<tokio::sync::Notify>,
        inner: MemoryConnector,
    }

    struct GatedLog {
        gate: Arc<tokio::sync::Notify>,
        inner: Box<dyn DurableLog>,
    }

    impl LogConnector for GatedConnector {
        fn open(&self, room_id: &str) -> Result<Box<dyn DurableLog>, StoreError> {
            let inner = self.inner.open(room_id)?;
            if room_id != "room/slow" {
                return Ok(inner);
            }
            Ok(Box::new(GatedLog {
                gate: self.gate.clone(),
                inner,
            }))
        }
    }

    #[async_trait]
    impl DurableLog for GatedLog {
        async fn append(&mut self, delta: &[u8]) -> Result<(), StoreError> {
            self.inner.append(delta).await
        }

        async fn replay(&mut self) -> Result<Vec<Vec<u8>>, StoreError> {
            self.gate.notified().await;
            self.inner.replay().await
        }

        async fn compact(&mut self, snapshot: &[u8]) -> Result<(), StoreError> {
            self.inner.compact(snapshot).await
        }
    }

    #[tokio::test]
    async fn test_slow_replay_does_not_block_other_rooms() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let connector = GatedConnector {
            gate: gate.clone(),
            inner: MemoryConnector::new(),
        };
        let manager = Arc::new(RoomManager::new(Arc::new(connector), 16));

        let m = manager.clone();
        let slow = tokio::spawn(async move { m.get_or_create("room/slow").await.unwrap() });
        tokio::time::sleep(Duration::from_millis(50)).await;

        timeout(Duration::from_secs(2), manager.get_or_create("room/fast"))
            .await
            .expect("room/fast waited for room/slow")
            .unwrap();
        assert_eq!(manager.active_rooms().await, vec!["room/fast"]);
        assert!(manager.get("room/slow").await.is_none());

        gate.notify_one();
        let slow = timeout(Duration::from_secs(2), slow).await.unwrap().unwrap();
        let again = manager.get_or_create("room/slow").await.unwrap();
        assert!(Arc::ptr_eq(&slow, &again));
        assert_eq!(manager.active_rooms().await, vec!["room/fast", "room/slow"]);
    }

    #[tokio::test]
    async fn test_handshake_and_fan_out_excludes_origin() {
        let (manager, _) = manager();
        let (room_end_a, mut a) = memory_pair(16);
        let (room_end_b, mut b) = memory_pair(16);
        let m = manager.clone();
        tokio::spawn(async move { m.attach_channel("room/x", room_end_a).await });
        let m = manager.clone();
        tokio::spawn(async move { m.attach_channel("room/x", room_end_b).await });

        assert_eq!(next_frame(&mut a).await.msg_type, MessageType::SyncStep1);
        assert_eq!(next_frame(&mut b).await.msg_type, MessageType::SyncStep1);

        let replica = Db::new();
        let event = replica.create_event(EventDraft::new("2025-01-01", "2025-01-02", "a")).unwrap();
        let update = SyncMessage::update(a.id(), replica.encode_state().unwrap());
        a.send(update.encode().unwrap()).await.unwrap();

        let seen = next_frame(&mut b).await;
        assert_eq!(seen.msg_type, MessageType::Update);
        let peer = Db::new();
        peer.merge_delta(&seen.payload).unwrap();
        assert_eq!(peer.events(), vec![event.clone()]);

        // The originator never hears its own delta back.
        assert!(timeout(Duration::from_millis(100), a.recv()).await.is_err());

        let room = manager.get("room/x").await.unwrap();
        assert_eq!(room.db().events(), vec![event]);
        assert_eq!(room.peer_count().await, 2);
    }

    #[tokio::test]
    async fn test_sync_step1_answered_with_missing_state() {
        let (manager, _) = manager();
        let room = manager.get_or_create("room/y").await.unwrap();
        let event = room.db().create_event(EventDraft::new(0i64, 10i64, "server")).unwrap();

        let (room_end, mut client) = memory_pair(16);
        let served = room.clone();
        tokio::spawn(async move { served.serve(room_end).await });

        next_frame(&mut client).await;
        let ask = SyncMessage::sync_step1(client.id(), Db::new().state_vector());
        client.send(ask.encode().unwrap()).await.unwrap();

        let answer = frame_of(&mut client, MessageType::SyncStep2).await;
        let replica = Db::new();
        replica.merge_delta(&answer.payload).unwrap();
        assert_eq!(replica.events(), vec![event]);
    }

    #[tokio::test]
    async fn test_local_mutation_reaches_channels_and_log() {
        let (manager, connector) = manager();
        let room = manager.get_or_create("room/z").await.unwrap();
        let (room_end, mut client) = memory_pair(16);
        let served = room.clone();
        tokio::spawn(async move { served.serve(room_end).await });
        next_frame(&mut client).await;

        let cat = room.db().create_catalogue(CatalogueDraft::new("cat", "server")).unwrap();
        let update = next_frame(&mut client).await;
        assert_eq!(update.msg_type, MessageType::Update);
        assert_eq!(update.peer_id, Uuid::nil());

        let replica = Db::new();
        replica.merge_delta(&update.payload).unwrap();
        assert_eq!(replica.catalogues(), vec![cat]);
        assert_eq!(connector.record_count("room/z"), 1);
    }

    #[tokio::test]
    async fn test_detach_stops_serving() {
        let (manager, _) = manager();
        let (room_end, mut client) = memory_pair(16);
        let channel_id = room_end.id();
        let m = manager.clone();
        let task = tokio::spawn(async move { m.attach_channel("room/d", room_end).await });
        next_frame(&mut client).await;

        assert!(manager.detach_channel("room/d", channel_id).await);
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap().unwrap();
        assert_eq!(client.recv().await, None);
        assert!(manager.active_rooms().await.is_empty());
    }

    #[tokio::test]
    async fn test_release_compacts_and_rebuilds() {
        let (manager, connector) = manager();
        let (room_end, mut client) = memory_pair(16);
        let m = manager.clone();
        let task = tokio::spawn(async move { m.attach_channel("room/c", room_end).await });
        next_frame(&mut client).await;

        let replica = Db::new();
        for i in 0..3i64 {
            replica.create_event(EventDraft::new(i, i + 1, "c")).unwrap();
        }
        for event in replica.events() {
            let single = Db::new();
            single.create_event(EventDraft::new(event.start, event.stop, "c").id(event.uuid)).unwrap();
            let frame = SyncMessage::update(client.id(), single.encode_state().unwrap());
            client.send(frame.encode().unwrap()).await.unwrap();
        }
        let ask = SyncMessage::sync_step1(client.id(), Db::new().state_vector());
        client.send(ask.encode().unwrap()).await.unwrap();
        assert_eq!(next_frame(&mut client).await.msg_type, MessageType::SyncStep2);
        assert_eq!(connector.record_count("room/c"), 3);

        drop(client);
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap().unwrap();
        assert_eq!(manager.room_count().await, 0);
        assert_eq!(connector.record_count("room/c"), 1);

        let rebuilt = manager.get_or_create("room/c").await.unwrap();
        assert_eq!(rebuilt.db().events(), replica.events());
    }

    struct BrokenLog;

    #[async_trait]
    impl DurableLog for BrokenLog {
        async fn append(&mut self, _delta: &[u8]) -> Result<(), StoreError> {
            Err(StoreError::Io(std::io::Error::other("disk full")))
        }

        async fn replay(&mut self) -> Result<Vec<Vec<u8>>, StoreError> {
            Ok(Vec::new())
        }

        async fn compact(&mut self, _snapshot: &[u8]) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_log_failure_is_fatal_for_room() {
        let room = Room::open("room/broken", Box::new(BrokenLog), 16).await.unwrap();
        let replica = Db::new();
        replica.create_event(EventDraft::new(0i64, 1i64, "x")).unwrap();

        let err = room.apply_remote(Uuid::new_v4(), replica.encode_state().unwrap()).await.unwrap_err();
        assert!(matches!(err, RoomError::Log { .. }));
        assert!(room.is_failed());

        let (room_end, mut client) = memory_pair(16);
        let served = room.clone();
        let task = tokio::spawn(async move { served.serve(room_end).await });
        next_frame(&mut client).await;
        client
            .send(SyncMessage::update(client.id(), replica.encode_state().unwrap()).encode().unwrap())
            .await
            .unwrap();
        let result = timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(matches!(result, Err(RoomError::Failed(_))));
    }
}
