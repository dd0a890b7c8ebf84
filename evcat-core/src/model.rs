//! Entity model: events, catalogues and their creation drafts.
//!
//! Entities are plain values. Two handles compare equal when all fields are
//! equal, whichever replica produced them. They are created through
//! [`Db`](crate::Db) from a draft and never constructed piecemeal by callers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DbError;
use crate::time::{IntoTimestamp, Timestamp};
use crate::value::{non_finite_key, AttrValue, Attributes};

/// A time-bounded observation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub uuid: Uuid,
    pub start: Timestamp,
    pub stop: Timestamp,
    pub author: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub products: Vec<String>,
    #[serde(default)]
    pub rating: Option<i64>,
    #[serde(default)]
    pub attributes: Attributes,
}

/// A named grouping of events. Events are referenced by identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Catalogue {
    pub uuid: Uuid,
    pub name: String,
    pub author: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub events: Vec<Uuid>,
}

/// Catalogue fields that never change after creation.
///
/// Stored as one payload in the replicated document; the event reference
/// list lives next to it as a replicated sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct CatalogueMeta {
    pub uuid: Uuid,
    pub name: String,
    pub author: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub attributes: Attributes,
}

impl Catalogue {
    pub(crate) fn from_parts(meta: CatalogueMeta, events: Vec<Uuid>) -> Self {
        Self {
            uuid: meta.uuid,
            name: meta.name,
            author: meta.author,
            tags: meta.tags,
            attributes: meta.attributes,
            events: dedup_preserving_order(events),
        }
    }

    pub(crate) fn meta(&self) -> CatalogueMeta {
        CatalogueMeta {
            uuid: self.uuid,
            name: self.name.clone(),
            author: self.author.clone(),
            tags: self.tags.clone(),
            attributes: self.attributes.clone(),
        }
    }

    /// Whether the catalogue references the given event.
    pub fn contains(&self, event: impl AsEventId) -> bool {
        self.events.contains(&event.event_id())
    }
}

/// Anything that designates an event: an [`Event`] or its identifier.
pub trait AsEventId {
    fn event_id(&self) -> Uuid;
}

impl AsEventId for Uuid {
    fn event_id(&self) -> Uuid {
        *self
    }
}

impl AsEventId for Event {
    fn event_id(&self) -> Uuid {
        self.uuid
    }
}

impl<T: AsEventId + ?Sized> AsEventId for &T {
    fn event_id(&self) -> Uuid {
        (**self).event_id()
    }
}

/// Anything that designates a catalogue by identifier.
pub trait AsCatalogueId {
    fn catalogue_id(&self) -> Uuid;
}

impl AsCatalogueId for Uuid {
    fn catalogue_id(&self) -> Uuid {
        *self
    }
}

impl AsCatalogueId for Catalogue {
    fn catalogue_id(&self) -> Uuid {
        self.uuid
    }
}

impl<T: AsCatalogueId + ?Sized> AsCatalogueId for &T {
    fn catalogue_id(&self) -> Uuid {
        (**self).catalogue_id()
    }
}

/// Identifier inputs: a [`Uuid`], its hyphenated string, or 16 raw bytes.
pub trait IntoId {
    fn into_id(self) -> Result<Uuid, DbError>;
}

impl IntoId for Uuid {
    fn into_id(self) -> Result<Uuid, DbError> {
        Ok(self)
    }
}

impl IntoId for &str {
    fn into_id(self) -> Result<Uuid, DbError> {
        Uuid::parse_str(self.trim()).map_err(|_| DbError::InvalidId(self.to_string()))
    }
}

impl IntoId for String {
    fn into_id(self) -> Result<Uuid, DbError> {
        self.as_str().into_id()
    }
}

impl IntoId for [u8; 16] {
    fn into_id(self) -> Result<Uuid, DbError> {
        Ok(Uuid::from_bytes(self))
    }
}

impl IntoId for &[u8] {
    fn into_id(self) -> Result<Uuid, DbError> {
        Uuid::from_slice(self).map_err(|_| DbError::InvalidId(format!("{} raw bytes", self.len())))
    }
}

/// Creation parameters for an [`Event`].
///
/// Conversion failures (bad timestamp, bad identifier) are kept until
/// [`Db::create_event`](crate::Db::create_event) reports them.
#[derive(Debug)]
pub struct EventDraft {
    id: Option<Uuid>,
    start: Option<Timestamp>,
    stop: Option<Timestamp>,
    author: String,
    tags: Vec<String>,
    products: Vec<String>,
    rating: Option<i64>,
    attributes: Attributes,
    error: Option<DbError>,
}

impl EventDraft {
    pub fn new(start: impl IntoTimestamp, stop: impl IntoTimestamp, author: impl Into<String>) -> Self {
        let mut error = None;
        let start = start.into_timestamp().map_err(|e| error = Some(e)).ok();
        let stop = match stop.into_timestamp() {
            Ok(ts) => Some(ts),
            Err(e) => {
                error.get_or_insert(e);
                None
            }
        };
        Self {
            id: None,
            start,
            stop,
            author: author.into(),
            tags: Vec::new(),
            products: Vec::new(),
            rating: None,
            attributes: Attributes::new(),
            error,
        }
    }

    pub fn id(mut self, id: impl IntoId) -> Self {
        match id.into_id() {
            Ok(id) => self.id = Some(id),
            Err(e) => {
                self.error.get_or_insert(e);
            }
        }
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn products<I, S>(mut self, products: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.products = products.into_iter().map(Into::into).collect();
        self
    }

    pub fn rating(mut self, rating: i64) -> Self {
        self.rating = Some(rating);
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }

    /// Resolve the draft into an event, generating an identifier if none was given.
    pub fn build(self) -> Result<Event, DbError> {
        if let Some(e) = self.error {
            return Err(e);
        }
        if let Some(key) = non_finite_key(&self.attributes) {
            return Err(DbError::InvalidAttribute(key.to_string()));
        }
        let (Some(start), Some(stop)) = (self.start, self.stop) else {
            return Err(DbError::InvalidTimestamp("missing bound".into()));
        };
        Ok(Event {
            uuid: self.id.unwrap_or_else(Uuid::new_v4),
            start,
            stop,
            author: self.author,
            tags: self.tags,
            products: self.products,
            rating: self.rating,
            attributes: self.attributes,
        })
    }
}

/// Creation parameters for a [`Catalogue`].
#[derive(Debug)]
pub struct CatalogueDraft {
    id: Option<Uuid>,
    name: String,
    author: String,
    tags: Vec<String>,
    attributes: Attributes,
    events: Vec<Uuid>,
    error: Option<DbError>,
}

impl CatalogueDraft {
    pub fn new(name: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            author: author.into(),
            tags: Vec::new(),
            attributes: Attributes::new(),
            events: Vec::new(),
            error: None,
        }
    }

    pub fn id(mut self, id: impl IntoId) -> Self {
        match id.into_id() {
            Ok(id) => self.id = Some(id),
            Err(e) => {
                self.error.get_or_insert(e);
            }
        }
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }

    /// Reference a single event at creation time.
    pub fn event(mut self, event: impl AsEventId) -> Self {
        self.events.push(event.event_id());
        self
    }

    /// Reference several events at creation time.
    pub fn events<I>(mut self, events: I) -> Self
    where
        I: IntoIterator,
        I::Item: AsEventId,
    {
        self.events.extend(events.into_iter().map(|e| e.event_id()));
        self
    }

    pub fn build(self) -> Result<Catalogue, DbError> {
        if let Some(e) = self.error {
            return Err(e);
        }
        if let Some(key) = non_finite_key(&self.attributes) {
            return Err(DbError::InvalidAttribute(key.to_string()));
        }
        Ok(Catalogue {
            uuid: self.id.unwrap_or_else(Uuid::new_v4),
            name: self.name,
            author: self.author,
            tags: self.tags,
            attributes: self.attributes,
            events: dedup_preserving_order(self.events),
        })
    }
}

/// Keep the first occurrence of every identifier.
pub(crate) fn dedup_preserving_order(ids: Vec<Uuid>) -> Vec<Uuid> {
    let mut seen = std::collections::HashSet::with_capacity(ids.len());
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}
