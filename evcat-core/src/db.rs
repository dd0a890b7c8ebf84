//! Local store over a replicated document.
//!
//! [`Db`] owns one [`ReplicatedDoc`] and exposes entity creation, lookup,
//! transaction batching, change notification, peer merge and the canonical
//! JSON dump. Entities are decoded from the document on every read; the
//! document is the only state.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crdt::{Mutation, RawSnapshot, ReplicatedDoc, YrsDocument};
use crate::error::DbError;
use crate::model::{AsCatalogueId, AsEventId, Catalogue, CatalogueDraft, CatalogueMeta, Event, EventDraft};
use crate::notify::{ListenerId, NotificationBus, Origin};

#[derive(Default)]
struct Batch {
    depth: usize,
    since: Vec<u8>,
    dirty: bool,
    /// What peers may see while a transaction is open: the state when it
    /// began plus every remote delta merged since.
    published: Option<Box<dyn ReplicatedDoc + Send>>,
}

/// Canonical dump layout. Field and collection order are fixed.
#[derive(Serialize, Deserialize)]
struct Dump {
    events: Vec<Event>,
    catalogues: Vec<Catalogue>,
}

/// A local replica of a catalogue store.
pub struct Db {
    doc: Mutex<Box<dyn ReplicatedDoc + Send>>,
    batch: Mutex<Batch>,
    bus: NotificationBus,
}

/// Batching scope returned by [`Db::transaction`].
///
/// Mutations made while any scope is alive are emitted as a single
/// local-origin delta when the outermost scope drops. Until then, deltas
/// and states encoded for peers leave the batch out.
#[must_use = "the batch ends as soon as the transaction is dropped"]
pub struct Transaction<'a> {
    db: &'a Db,
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.db.end_batch();
    }
}

impl Default for Db {
    fn default() -> Self {
        Self::new()
    }
}

impl Db {
    /// Create an empty store backed by a yrs document.
    pub fn new() -> Self {
        Self::with_document(Box::new(YrsDocument::new()))
    }

    pub fn with_document(doc: Box<dyn ReplicatedDoc + Send>) -> Self {
        Self {
            doc: Mutex::new(doc),
            batch: Mutex::new(Batch::default()),
            bus: NotificationBus::default(),
        }
    }

    fn doc(&self) -> MutexGuard<'_, Box<dyn ReplicatedDoc + Send>> {
        self.doc.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn batch(&self) -> MutexGuard<'_, Batch> {
        self.batch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ---- Transactions ----

    /// Open a batching scope. Scopes nest; only the outermost one emits.
    ///
    /// Opening the outermost scope copies the document once.
    pub fn transaction(&self) -> Transaction<'_> {
        self.open_batch(true)
    }

    /// A single mutation is applied under the document lock, so it needs
    /// no published copy.
    fn open_batch(&self, isolated: bool) -> Transaction<'_> {
        let mut batch = self.batch();
        let doc = self.doc();
        if batch.depth == 0 {
            batch.since = doc.state_vector();
            batch.dirty = false;
        }
        if isolated && batch.published.is_none() {
            match doc.fork() {
                Ok(published) => batch.published = Some(published),
                Err(e) => log::error!("Cannot isolate transaction: {}", e),
            }
        }
        batch.depth += 1;
        Transaction { db: self }
    }

    fn end_batch(&self) {
        let since = {
            let mut batch = self.batch();
            batch.depth = batch.depth.saturating_sub(1);
            if batch.depth > 0 {
                return;
            }
            batch.published = None;
            if !batch.dirty {
                return;
            }
            batch.dirty = false;
            std::mem::take(&mut batch.since)
        };
        let delta = self.doc().encode_delta(&since);
        match delta {
            Ok(delta) => self.bus.emit_update(&delta, Origin::Local),
            Err(e) => log::error!("Failed to encode local delta: {}", e),
        }
    }

    fn apply(&self, mutation: Mutation) -> Result<(), DbError> {
        let _scope = self.open_batch(false);
        let changed = self.doc().apply_local_mutation(&mutation)?;
        if changed {
            self.batch().dirty = true;
        }
        Ok(())
    }

    // ---- Creation ----

    pub fn create_event(&self, draft: EventDraft) -> Result<Event, DbError> {
        let event = draft.build()?;
        self.insert_event(&event)?;
        log::trace!("Created event {}", event.uuid);
        Ok(event)
    }

    pub fn create_catalogue(&self, draft: CatalogueDraft) -> Result<Catalogue, DbError> {
        let catalogue = draft.build()?;
        self.insert_catalogue(&catalogue)?;
        log::trace!("Created catalogue {} ({})", catalogue.name, catalogue.uuid);
        Ok(catalogue)
    }

    pub(crate) fn insert_event(&self, event: &Event) -> Result<(), DbError> {
        let payload = serde_json::to_string(event)?;
        self.apply(Mutation::InsertEvent { id: event.uuid.to_string(), payload })
    }

    pub(crate) fn insert_catalogue(&self, catalogue: &Catalogue) -> Result<(), DbError> {
        let payload = serde_json::to_string(&catalogue.meta())?;
        self.apply(Mutation::InsertCatalogue {
            id: catalogue.uuid.to_string(),
            payload,
            events: catalogue.events.iter().map(Uuid::to_string).collect(),
        })
    }

    /// Append events to a catalogue's reference list, skipping ones already present.
    ///
    /// Returns the catalogue as committed.
    pub fn add_events<I>(&self, catalogue: impl AsCatalogueId, events: I) -> Result<Catalogue, DbError>
    where
        I: IntoIterator,
        I::Item: AsEventId,
    {
        let id = catalogue.catalogue_id();
        self.apply(Mutation::AppendEvents {
            catalogue: id.to_string(),
            events: events.into_iter().map(|e| e.event_id().to_string()).collect(),
        })?;
        self.catalogue_by_id(&id).ok_or_else(|| DbError::CatalogueNotFound(id.to_string()))
    }

    // ---- Lookup ----

    /// Look a catalogue up by identifier, then by name.
    ///
    /// Names are not unique; the match with the lowest identifier wins.
    pub fn get_catalogue(&self, key: impl ToString) -> Result<Catalogue, DbError> {
        let key = key.to_string();
        let snapshot = self.doc().snapshot();
        let mut catalogues = decode_catalogues(&snapshot);
        if let Ok(id) = Uuid::parse_str(key.trim()) {
            if let Some(catalogue) = catalogues.remove(&id) {
                return Ok(catalogue);
            }
        }
        catalogues
            .into_values()
            .find(|c| c.name == key)
            .ok_or(DbError::CatalogueNotFound(key))
    }

    pub fn get_event(&self, key: impl ToString) -> Result<Event, DbError> {
        let key = key.to_string();
        let Ok(id) = Uuid::parse_str(key.trim()) else {
            return Err(DbError::EventNotFound(key));
        };
        let payload = self.doc().snapshot().events.remove(&id.to_string());
        payload.as_deref().and_then(decode_event).ok_or(DbError::EventNotFound(key))
    }

    fn catalogue_by_id(&self, id: &Uuid) -> Option<Catalogue> {
        decode_catalogues(&self.doc().snapshot()).remove(id)
    }

    /// All events known to this store, ordered by identifier.
    pub fn events(&self) -> Vec<Event> {
        decode_events(&self.doc().snapshot()).into_values().collect()
    }

    /// All catalogues known to this store, ordered by identifier.
    pub fn catalogues(&self) -> Vec<Catalogue> {
        decode_catalogues(&self.doc().snapshot()).into_values().collect()
    }

    /// Resolve a catalogue's references, in list order.
    ///
    /// References to events not merged yet are skipped.
    pub fn catalogue_events(&self, catalogue: impl AsCatalogueId) -> Result<Vec<Event>, DbError> {
        let id = catalogue.catalogue_id();
        let snapshot = self.doc().snapshot();
        let catalogue = decode_catalogues(&snapshot)
            .remove(&id)
            .ok_or_else(|| DbError::CatalogueNotFound(id.to_string()))?;
        let mut events = decode_events(&snapshot);
        Ok(catalogue.events.iter().filter_map(|id| events.remove(id)).collect())
    }

    // ---- Notification ----

    /// Register a listener for events that arrive through a remote merge.
    ///
    /// Events created through this store never reach it.
    pub fn on_create_event<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.bus.on_create(Arc::new(listener))
    }

    /// Register a listener for every delta applied to this store.
    pub fn on_update<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&[u8], Origin) + Send + Sync + 'static,
    {
        self.bus.on_update(Arc::new(listener))
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.bus.unsubscribe(id)
    }

    // ---- Merge ----

    pub fn state_vector(&self) -> Vec<u8> {
        self.doc().state_vector()
    }

    /// Delta covering everything a peer at `since` lacks. Empty `since` means the full state.
    ///
    /// Mutations of a transaction still open are not included.
    pub fn encode_delta(&self, since: &[u8]) -> Result<Vec<u8>, DbError> {
        let batch = self.batch();
        match batch.published.as_ref() {
            Some(published) => published.encode_delta(since),
            None => self.doc().encode_delta(since),
        }
    }

    pub fn encode_state(&self) -> Result<Vec<u8>, DbError> {
        self.encode_delta(&[])
    }

    /// Merge a delta produced by a peer and fire remote-origin notifications.
    pub fn merge_delta(&self, delta: &[u8]) -> Result<(), DbError> {
        let created = {
            let mut batch = self.batch();
            let mut doc = self.doc();
            let before = doc.event_ids();
            doc.merge_delta(delta)?;
            if let Some(published) = batch.published.as_mut() {
                published.merge_delta(delta)?;
            }
            let fresh: Vec<String> = doc.event_ids().difference(&before).cloned().collect();
            if fresh.is_empty() {
                Vec::new()
            } else {
                let snapshot = doc.snapshot();
                fresh
                    .iter()
                    .filter_map(|id| snapshot.events.get(id))
                    .filter_map(|payload| decode_event(payload))
                    .collect()
            }
        };
        self.bus.emit_created(&created, Origin::Remote);
        self.bus.emit_update(delta, Origin::Remote);
        Ok(())
    }

    /// Pull everything `other` has that this store lacks.
    pub fn pull_from(&self, other: &Db) -> Result<(), DbError> {
        if std::ptr::eq(self, other) {
            return Ok(());
        }
        let delta = other.encode_delta(&self.state_vector())?;
        self.merge_delta(&delta)
    }

    /// Exchange state with `other` in both directions.
    pub fn sync(&self, other: &Db) -> Result<(), DbError> {
        self.pull_from(other)?;
        other.pull_from(self)
    }

    // ---- Serialization ----

    /// Deterministic JSON dump: events then catalogues, each ordered by identifier.
    pub fn to_json(&self) -> Result<String, DbError> {
        let snapshot = self.doc().snapshot();
        let dump = Dump {
            events: decode_events(&snapshot).into_values().collect(),
            catalogues: decode_catalogues(&snapshot).into_values().collect(),
        };
        Ok(serde_json::to_string_pretty(&dump)?)
    }

    /// Build a fresh store from a [`Db::to_json`] dump.
    pub fn from_json(text: &str) -> Result<Db, DbError> {
        let dump: Dump = serde_json::from_str(text)?;
        let db = Db::new();
        {
            let _scope = db.transaction();
            for event in &dump.events {
                db.insert_event(event)?;
            }
            for catalogue in &dump.catalogues {
                db.insert_catalogue(catalogue)?;
            }
        }
        Ok(db)
    }

    pub(crate) fn snapshot(&self) -> RawSnapshot {
        self.doc().snapshot()
    }
}

pub(crate) fn decode_event(payload: &str) -> Option<Event> {
    match serde_json::from_str(payload) {
        Ok(event) => Some(event),
        Err(e) => {
            log::warn!("Skipping undecodable event payload: {}", e);
            None
        }
    }
}

pub(crate) fn decode_events(snapshot: &RawSnapshot) -> BTreeMap<Uuid, Event> {
    snapshot
        .events
        .values()
        .filter_map(|payload| decode_event(payload))
        .map(|event| (event.uuid, event))
        .collect()
}

pub(crate) fn decode_catalogues(snapshot: &RawSnapshot) -> BTreeMap<Uuid, Catalogue> {
    let mut catalogues = BTreeMap::new();
    for raw in snapshot.catalogues.values() {
        let meta: CatalogueMeta = match serde_json::from_str(&raw.payload) {
            Ok(meta) => meta,
            Err(e) => {
                log::warn!("Skipping undecodable catalogue payload: {}", e);
                continue;
            }
        };
        let events = raw.events.iter().filter_map(|id| Uuid::parse_str(id).ok()).collect();
        let catalogue = Catalogue::from_parts(meta, events);
        catalogues.insert(catalogue.uuid, catalogue);
    }
    catalogues
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(db: &Db, author: &str) -> Event {
        db.create_event(EventDraft::new("2025-01-31", "2026-01-31", author)).unwrap()
    }

    #[test]
    fn test_create_catalogue() {
        let db0 = Db::new();
        let cat0 = db0.create_catalogue(CatalogueDraft::new("cat0", "John")).unwrap();
        assert_eq!(db0.catalogues(), vec![cat0.clone()]);

        let db1 = Db::new();
        db1.sync(&db0).unwrap();
        assert_eq!(db1.catalogues(), vec![cat0]);
    }

    #[test]
    fn test_create_catalogue_with_events() {
        let db = Db::new();
        let e = event(&db, "John");
        let cat = db.create_catalogue(CatalogueDraft::new("cat0", "John").event(&e)).unwrap();
        assert_eq!(cat.events, vec![e.uuid]);
        assert_eq!(db.catalogue_events(&cat).unwrap(), vec![e]);
    }

    #[test]
    fn test_add_events_is_set_like() {
        let db = Db::new();
        let cat = db.create_catalogue(CatalogueDraft::new("cat", "John")).unwrap();
        let e0 = event(&db, "a");
        let e1 = event(&db, "b");
        db.add_events(&cat, [&e0]).unwrap();
        let cat = db.add_events(&cat, [&e1, &e0]).unwrap();
        assert_eq!(cat.events, vec![e0.uuid, e1.uuid]);
    }

    #[test]
    fn test_lookup_by_id_then_name() {
        let db = Db::new();
        let cat = db.create_catalogue(CatalogueDraft::new("mine", "John")).unwrap();
        assert_eq!(db.get_catalogue(cat.uuid).unwrap(), cat);
        assert_eq!(db.get_catalogue("mine").unwrap(), cat);

        let missing = Uuid::new_v4();
        let err = db.get_catalogue(missing).unwrap_err();
        assert!(err.to_string().starts_with("No catalogue found with name or UUID"));
        assert!(err.to_string().contains(&missing.to_string()));

        let err = db.get_event("not-a-uuid").unwrap_err();
        assert_eq!(err.to_string(), "No event found with UUID not-a-uuid");
    }

    #[test]
    fn test_dangling_reference_is_tolerated() {
        let db = Db::new();
        let ghost = Uuid::new_v4();
        let cat = db.create_catalogue(CatalogueDraft::new("cat", "John").event(ghost)).unwrap();
        assert_eq!(db.get_catalogue(cat.uuid).unwrap().events, vec![ghost]);
        assert!(db.catalogue_events(&cat).unwrap().is_empty());
    }

    #[test]
    fn test_transaction_emits_one_delta() {
        let db = Db::new();
        let deltas = Arc::new(AtomicUsize::new(0));
        let d = deltas.clone();
        db.on_update(move |_, origin| {
            assert_eq!(origin, Origin::Local);
            d.fetch_add(1, Ordering::SeqCst);
        });
        {
            let _tx = db.transaction();
            let e = event(&db, "a");
            let cat = db.create_catalogue(CatalogueDraft::new("cat", "a")).unwrap();
            db.add_events(&cat, [&e]).unwrap();
            assert_eq!(deltas.load(Ordering::SeqCst), 0);
        }
        assert_eq!(deltas.load(Ordering::SeqCst), 1);

        event(&db, "b");
        assert_eq!(deltas.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_open_transaction_is_hidden_from_peers() {
        let db = Db::new();
        let before = event(&db, "a");
        let remote = Db::new();
        let arrived = event(&remote, "r");
        let peer = Db::new();

        let batched = {
            let _tx = db.transaction();
            let batched = event(&db, "a");
            db.create_catalogue(CatalogueDraft::new("cat", "a").event(&batched)).unwrap();
            db.pull_from(&remote).unwrap();
            assert_eq!(db.events().len(), 3);

            peer.pull_from(&db).unwrap();
            let mut expected = vec![before.clone(), arrived.clone()];
            expected.sort_by_key(|e| e.uuid);
            assert_eq!(peer.events(), expected);
            assert!(peer.catalogues().is_empty());

            let fresh = Db::new();
            fresh.merge_delta(&db.encode_state().unwrap()).unwrap();
            assert_eq!(fresh.events().len(), 2);
            batched
        };

        peer.pull_from(&db).unwrap();
        assert_eq!(peer.events().len(), 3);
        assert_eq!(peer.get_catalogue("cat").unwrap().events, vec![batched.uuid]);
    }

    #[test]
    fn test_noop_append_emits_nothing() {
        let db = Db::new();
        let e = event(&db, "a");
        let cat = db.create_catalogue(CatalogueDraft::new("cat", "a").event(&e)).unwrap();
        let deltas = Arc::new(AtomicUsize::new(0));
        let d = deltas.clone();
        db.on_update(move |_, _| {
            d.fetch_add(1, Ordering::SeqCst);
        });
        db.add_events(&cat, [&e]).unwrap();
        assert_eq!(deltas.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_pull_from_is_unidirectional() {
        let a = Db::new();
        let b = Db::new();
        event(&a, "a");
        event(&b, "b");
        b.pull_from(&a).unwrap();
        assert_eq!(b.events().len(), 2);
        assert_eq!(a.events().len(), 1);
        a.pull_from(&a).unwrap();
    }

    #[test]
    fn test_json_is_canonical() {
        let db = Db::new();
        let e = event(&db, "Paul");
        let cat = db.create_catalogue(CatalogueDraft::new("cat", "John").attribute("k", 1.5)).unwrap();
        db.add_events(&cat, [&e]).unwrap();

        let text = db.to_json().unwrap();
        let copy = Db::from_json(&text).unwrap();
        assert_eq!(copy.events(), db.events());
        assert_eq!(copy.catalogues(), db.catalogues());
        assert_eq!(copy.to_json().unwrap(), text);
    }
}
