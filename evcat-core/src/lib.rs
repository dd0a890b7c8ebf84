//! # evcat-core: Replicated catalogue and event store
//!
//! Catalogues group time-bounded events. Both live in one conflict-free
//! replicated document per store, so any number of replicas can be edited
//! concurrently and merged in any order.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  Mutation   ┌──────────────┐
//! │ Db           │ ──────────► │ ReplicatedDoc│
//! │ (entities,   │ ◄────────── │ (yrs)        │
//! │  batching)   │ RawSnapshot └──────┬───────┘
//! └──────┬───────┘                    │ delta
//!        │ (delta, Origin)            ▼
//!        ▼                     peer Db::merge_delta
//! ┌──────────────┐
//! │ listeners    │
//! └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`model`]: Event, Catalogue and their creation drafts
//! - [`value`]: tagged attribute values
//! - [`time`]: timestamp normalization
//! - [`crdt`]: replicated document capability and the yrs backend
//! - [`notify`]: origin-tagged change notification
//! - [`db`]: the local store
//! - [`session`]: client-side handle cache
//! - [`votable`]: VOTable export/import

pub mod crdt;
pub mod db;
pub mod error;
pub mod model;
pub mod notify;
mod repr;
pub mod session;
pub mod time;
pub mod value;
pub mod votable;

pub use crdt::{Mutation, RawCatalogue, RawSnapshot, ReplicatedDoc, YrsDocument};
pub use db::{Db, Transaction};
pub use error::{DbError, VoTableError};
pub use model::{AsCatalogueId, AsEventId, Catalogue, CatalogueDraft, Event, EventDraft, IntoId};
pub use notify::{ListenerId, Origin};
pub use session::SessionCache;
pub use time::{IntoTimestamp, Timestamp};
pub use value::{AttrValue, Attributes, ValueKind};
pub use votable::{export_votable_file, export_votable_str, import_votable_file, import_votable_str};
