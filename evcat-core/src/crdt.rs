//! Replicated document capability and its yrs implementation.
//!
//! The store never talks to yrs directly. It translates entity operations
//! into [`Mutation`]s and reads the document back as a [`RawSnapshot`], so
//! any conflict-free container offering the same capabilities can stand in
//! for [`YrsDocument`].

use std::collections::{BTreeMap, BTreeSet, HashSet};

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Any, Array, ArrayPrelim, Doc, Map, MapPrelim, Out, ReadTxn, StateVector, Transact, Update, WriteTxn};

use crate::error::DbError;

const EVENTS: &str = "events";
const CATALOGUES: &str = "catalogues";
const META: &str = "meta";
const REFS: &str = "events";

/// Primitive document operations the store is built from.
///
/// Identifiers and payloads are opaque strings at this level.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    InsertEvent { id: String, payload: String },
    InsertCatalogue { id: String, payload: String, events: Vec<String> },
    AppendEvents { catalogue: String, events: Vec<String> },
}

/// Catalogue as stored: metadata payload plus the replicated reference list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawCatalogue {
    pub payload: String,
    pub events: Vec<String>,
}

/// Full read-out of both top-level collections.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawSnapshot {
    pub events: BTreeMap<String, String>,
    pub catalogues: BTreeMap<String, RawCatalogue>,
}

/// A conflict-free replicated container holding `events` and `catalogues`.
///
/// State vectors and deltas are opaque bytes. An empty state vector stands
/// for "nothing known", so `encode_delta(&[])` yields the full state.
pub trait ReplicatedDoc {
    /// Apply a local mutation. Returns whether the document changed.
    fn apply_local_mutation(&mut self, mutation: &Mutation) -> Result<bool, DbError>;

    fn state_vector(&self) -> Vec<u8>;

    /// Everything this document holds that a peer at `since` lacks.
    fn encode_delta(&self, since: &[u8]) -> Result<Vec<u8>, DbError>;

    /// Merge a delta produced by any replica. Merging is commutative and idempotent.
    fn merge_delta(&mut self, delta: &[u8]) -> Result<(), DbError>;

    fn snapshot(&self) -> RawSnapshot;

    /// An independent replica holding the current state.
    fn fork(&self) -> Result<Box<dyn ReplicatedDoc + Send>, DbError>;

    fn event_ids(&self) -> BTreeSet<String> {
        self.snapshot().events.into_keys().collect()
    }
}

/// [`ReplicatedDoc`] backed by a yrs document.
///
/// `events` maps id to the event JSON. `catalogues` maps id to a nested map
/// holding the metadata JSON under `meta` and an array of event ids under
/// `events`.
pub struct YrsDocument {
    doc: Doc,
}

impl YrsDocument {
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }
}

impl Default for YrsDocument {
    fn default() -> Self {
        Self::new()
    }
}

fn out_string(value: Out) -> Option<String> {
    match value {
        Out::Any(Any::String(s)) => Some(s.to_string()),
        _ => None,
    }
}

impl ReplicatedDoc for YrsDocument {
    fn apply_local_mutation(&mut self, mutation: &Mutation) -> Result<bool, DbError> {
        let mut txn = self.doc.transact_mut();
        match mutation {
            Mutation::InsertEvent { id, payload } => {
                let events = txn.get_or_insert_map(EVENTS);
                events.insert(&mut txn, id.as_str(), payload.clone());
                Ok(true)
            }
            Mutation::InsertCatalogue { id, payload, events } => {
                let catalogues = txn.get_or_insert_map(CATALOGUES);
                let entry = catalogues.insert(&mut txn, id.as_str(), MapPrelim::default());
                entry.insert(&mut txn, META, payload.clone());
                let refs = entry.insert(&mut txn, REFS, ArrayPrelim::default());
                for event in events {
                    refs.push_back(&mut txn, event.clone());
                }
                Ok(true)
            }
            Mutation::AppendEvents { catalogue, events } => {
                let catalogues = txn.get_or_insert_map(CATALOGUES);
                let Some(Out::YMap(entry)) = catalogues.get(&txn, catalogue) else {
                    return Err(DbError::CatalogueNotFound(catalogue.clone()));
                };
                let refs = match entry.get(&txn, REFS) {
                    Some(Out::YArray(refs)) => refs,
                    _ => entry.insert(&mut txn, REFS, ArrayPrelim::default()),
                };
                let mut present: HashSet<String> = refs.iter(&txn).filter_map(out_string).collect();
                let mut changed = false;
                for event in events {
                    if present.insert(event.clone()) {
                        refs.push_back(&mut txn, event.clone());
                        changed = true;
                    }
                }
                Ok(changed)
            }
        }
    }

    fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    fn encode_delta(&self, since: &[u8]) -> Result<Vec<u8>, DbError> {
        let sv = if since.is_empty() {
            StateVector::default()
        } else {
            StateVector::decode_v1(since).map_err(|e| DbError::Merge(e.to_string()))?
        };
        Ok(self.doc.transact().encode_diff_v1(&sv))
    }

    fn merge_delta(&mut self, delta: &[u8]) -> Result<(), DbError> {
        let update = Update::decode_v1(delta).map_err(|e| DbError::Merge(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update).map_err(|e| DbError::Merge(e.to_string()))
    }

    fn snapshot(&self) -> RawSnapshot {
        let txn = self.doc.transact();
        let mut snapshot = RawSnapshot::default();
        if let Some(events) = txn.get_map(EVENTS) {
            for (id, value) in events.iter(&txn) {
                if let Some(payload) = out_string(value) {
                    snapshot.events.insert(id.to_string(), payload);
                }
            }
        }
        if let Some(catalogues) = txn.get_map(CATALOGUES) {
            for (id, value) in catalogues.iter(&txn) {
                let Out::YMap(entry) = value else { continue };
                let Some(payload) = entry.get(&txn, META).and_then(out_string) else {
                    continue;
                };
                let events = match entry.get(&txn, REFS) {
                    Some(Out::YArray(refs)) => refs.iter(&txn).filter_map(out_string).collect(),
                    _ => Vec::new(),
                };
                snapshot.catalogues.insert(id.to_string(), RawCatalogue { payload, events });
            }
        }
        snapshot
    }

    fn fork(&self) -> Result<Box<dyn ReplicatedDoc + Send>, DbError> {
        let mut copy = YrsDocument::new();
        copy.merge_delta(&self.encode_delta(&[])?)?;
        Ok(Box::new(copy))
    }

    fn event_ids(&self) -> BTreeSet<String> {
        let txn = self.doc.transact();
        match txn.get_map(EVENTS) {
            Some(events) => events.keys(&txn).map(str::to_string).collect(),
            None => BTreeSet::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert_event(doc: &mut YrsDocument, id: &str) {
        doc.apply_local_mutation(&Mutation::InsertEvent { id: id.into(), payload: format!("{{\"id\":\"{id}\"}}") })
            .unwrap();
    }

    #[test]
    fn test_local_mutation_generates_delta() {
        let mut doc = YrsDocument::new();
        insert_event(&mut doc, "e0");
        let delta = doc.encode_delta(&[]).unwrap();
        assert!(!delta.is_empty());
        assert_eq!(doc.event_ids().len(), 1);
    }

    #[test]
    fn test_merge_is_idempotent_and_commutative() {
        let mut a = YrsDocument::new();
        let mut b = YrsDocument::new();
        insert_event(&mut a, "a0");
        insert_event(&mut b, "b0");
        let da = a.encode_delta(&[]).unwrap();
        let db = b.encode_delta(&[]).unwrap();

        let mut x = YrsDocument::new();
        let mut y = YrsDocument::new();
        x.merge_delta(&da).unwrap();
        x.merge_delta(&db).unwrap();
        x.merge_delta(&da).unwrap();
        y.merge_delta(&db).unwrap();
        y.merge_delta(&da).unwrap();
        assert_eq!(x.snapshot(), y.snapshot());
        assert_eq!(x.snapshot().events.len(), 2);
    }

    #[test]
    fn test_append_events_skips_present_ids() {
        let mut doc = YrsDocument::new();
        doc.apply_local_mutation(&Mutation::InsertCatalogue {
            id: "c0".into(),
            payload: "{}".into(),
            events: vec!["e0".into()],
        })
        .unwrap();
        let changed = doc
            .apply_local_mutation(&Mutation::AppendEvents { catalogue: "c0".into(), events: vec!["e0".into(), "e1".into()] })
            .unwrap();
        assert!(changed);
        let unchanged = doc
            .apply_local_mutation(&Mutation::AppendEvents { catalogue: "c0".into(), events: vec!["e1".into()] })
            .unwrap();
        assert!(!unchanged);
        assert_eq!(doc.snapshot().catalogues["c0"].events, vec!["e0", "e1"]);
    }

    #[test]
    fn test_append_to_unknown_catalogue_fails() {
        let mut doc = YrsDocument::new();
        let err = doc
            .apply_local_mutation(&Mutation::AppendEvents { catalogue: "nope".into(), events: vec![] })
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_garbage_delta_is_rejected() {
        let mut doc = YrsDocument::new();
        assert!(matches!(doc.merge_delta(&[0xff, 0xff, 0xff]), Err(DbError::Merge(_))));
    }
}
