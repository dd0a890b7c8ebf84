//! Rooms driven by in-process clients, persisted in RocksDB.

use std::sync::Arc;

use evcat_collab::{memory_pair, RocksConnector, RoomManager, StoreConfig, SyncClient};
use evcat_core::{CatalogueDraft, Db, EventDraft};
use tokio::time::{sleep, timeout, Duration};

async fn eventually(mut done: impl FnMut() -> bool) {
    timeout(Duration::from_secs(2), async {
        while !done() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Attach a fresh client to `room_id`; the room side is served in a task.
async fn join(rooms: &Arc<RoomManager>, room_id: &str) -> (SyncClient, tokio::task::JoinHandle<()>) {
    let (client_end, room_end) = memory_pair(64);
    let mut client = SyncClient::new(Arc::new(Db::new()));
    client.attach(client_end).await;

    let rooms = rooms.clone();
    let room_id = room_id.to_string();
    let serving = tokio::spawn(async move {
        rooms.attach_channel(&room_id, room_end).await.unwrap();
    });
    (client, serving)
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let connector = RocksConnector::open(StoreConfig::for_testing(dir.path())).unwrap();
    let rooms = Arc::new(RoomManager::new(Arc::new(connector), 16));

    let (a, _) = join(&rooms, "room/a").await;
    let (b, _) = join(&rooms, "room/b").await;
    let (a2, _) = join(&rooms, "/room/a").await;

    a.db().create_event(EventDraft::new(0i64, 1i64, "a")).unwrap();
    eventually(|| a2.db().events().len() == 1).await;
    sleep(Duration::from_millis(50)).await;
    assert!(b.db().events().is_empty());
    assert_eq!(rooms.active_rooms().await, vec!["room/a", "room/b"]);
}

#[tokio::test]
async fn test_room_rebuilt_from_rocks_after_release() {
    let dir = tempfile::tempdir().unwrap();
    let connector = RocksConnector::open(StoreConfig::for_testing(dir.path())).unwrap();
    let store = connector.store().clone();
    let rooms = Arc::new(RoomManager::new(Arc::new(connector.clone()), 16));

    let (mut writer, serving) = join(&rooms, "room/persist").await;
    let event = writer.db().create_event(EventDraft::new(0i64, 1i64, "w")).unwrap();
    let cat = writer
        .db()
        .create_catalogue(CatalogueDraft::new("kept", "w").event(&event))
        .unwrap();
    eventually(|| store.deltas("room/persist").unwrap().0.len() >= 2).await;

    writer.disconnect().await;
    timeout(Duration::from_secs(2), serving).await.unwrap().unwrap();
    assert_eq!(rooms.room_count().await, 0);
    assert!(store.load_snapshot("room/persist").unwrap().is_some());
    assert!(store.deltas("room/persist").unwrap().0.is_empty());

    let reopened = Arc::new(RoomManager::new(Arc::new(connector), 16));
    let (reader, _) = join(&reopened, "room/persist").await;
    eventually(|| reader.db().catalogues().len() == 1).await;
    assert_eq!(reader.db().catalogues(), vec![cat.clone()]);
    assert_eq!(reader.db().catalogue_events(&cat).unwrap(), vec![event]);
}
