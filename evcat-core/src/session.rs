//! Client-side handle cache.
//!
//! A [`SessionCache`] remembers catalogues (by identifier and by name) and
//! events (by identifier) that a client created or fetched. It is not a
//! source of truth: entries go stale when the backing store merges remote
//! changes, until [`SessionCache::refresh`] is called.

use std::collections::{BTreeSet, HashMap};

use uuid::Uuid;

use crate::db::Db;
use crate::error::DbError;
use crate::model::{Catalogue, CatalogueDraft, Event, EventDraft};

#[derive(Debug, Default, Clone)]
pub struct SessionCache {
    catalogues: HashMap<String, Catalogue>,
    events: HashMap<String, Event>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remember_catalogue(&mut self, catalogue: &Catalogue) {
        self.catalogues.insert(catalogue.uuid.to_string(), catalogue.clone());
        self.catalogues.insert(catalogue.name.clone(), catalogue.clone());
    }

    pub fn remember_event(&mut self, event: &Event) {
        self.events.insert(event.uuid.to_string(), event.clone());
    }

    pub fn create_catalogue(&mut self, db: &Db, draft: CatalogueDraft) -> Result<Catalogue, DbError> {
        let catalogue = db.create_catalogue(draft)?;
        self.remember_catalogue(&catalogue);
        Ok(catalogue)
    }

    pub fn create_event(&mut self, db: &Db, draft: EventDraft) -> Result<Event, DbError> {
        let event = db.create_event(draft)?;
        self.remember_event(&event);
        Ok(event)
    }

    /// Cached catalogue by identifier or name, without touching any store.
    pub fn local_catalogue(&self, key: &str) -> Result<&Catalogue, DbError> {
        self.catalogues.get(key).ok_or_else(|| DbError::CatalogueNotFound(key.to_string()))
    }

    pub fn local_event(&self, key: &str) -> Result<&Event, DbError> {
        self.events.get(key).ok_or_else(|| DbError::EventNotFound(key.to_string()))
    }

    /// Look a catalogue up in `db` and remember the result.
    pub fn fetch_catalogue(&mut self, db: &Db, key: &str) -> Result<Catalogue, DbError> {
        let catalogue = db.get_catalogue(key)?;
        self.remember_catalogue(&catalogue);
        Ok(catalogue)
    }

    pub fn fetch_event(&mut self, db: &Db, key: &str) -> Result<Event, DbError> {
        let event = db.get_event(key)?;
        self.remember_event(&event);
        Ok(event)
    }

    /// Re-resolve every cached entity against `db`.
    ///
    /// Entities `db` does not know are dropped. Returns how many were dropped.
    pub fn refresh(&mut self, db: &Db) -> usize {
        let catalogue_ids: BTreeSet<Uuid> = self.catalogues.values().map(|c| c.uuid).collect();
        let event_ids: BTreeSet<Uuid> = self.events.values().map(|e| e.uuid).collect();
        self.invalidate();

        let mut dropped = 0;
        for id in catalogue_ids {
            match db.get_catalogue(id) {
                Ok(catalogue) => self.remember_catalogue(&catalogue),
                Err(_) => dropped += 1,
            }
        }
        for id in event_ids {
            match db.get_event(id) {
                Ok(event) => self.remember_event(&event),
                Err(_) => dropped += 1,
            }
        }
        if dropped > 0 {
            log::debug!("Session refresh dropped {} stale entries", dropped);
        }
        dropped
    }

    pub fn invalidate(&mut self) {
        self.catalogues.clear();
        self.events.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.catalogues.is_empty() && self.events.is_empty()
    }
}
