//! Change notification bus.
//!
//! Every delta that reaches a store is tagged with where it came from.
//! Creation listeners only hear about remotely originated events; update
//! listeners hear every delta together with its [`Origin`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::model::Event;

/// Where an applied delta was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// A mutation made through this store's own API.
    Local,
    /// A delta merged from a peer.
    Remote,
}

/// Handle returned on subscription, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

pub type CreateListener = Arc<dyn Fn(&Event) + Send + Sync>;
pub type UpdateListener = Arc<dyn Fn(&[u8], Origin) + Send + Sync>;

#[derive(Default)]
pub(crate) struct NotificationBus {
    next_id: AtomicU64,
    create: RwLock<Vec<(ListenerId, CreateListener)>>,
    update: RwLock<Vec<(ListenerId, UpdateListener)>>,
}

impl NotificationBus {
    fn next_id(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn on_create(&self, listener: CreateListener) -> ListenerId {
        let id = self.next_id();
        self.create.write().unwrap_or_else(PoisonError::into_inner).push((id, listener));
        id
    }

    pub fn on_update(&self, listener: UpdateListener) -> ListenerId {
        let id = self.next_id();
        self.update.write().unwrap_or_else(PoisonError::into_inner).push((id, listener));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        remove_listener(&self.create, id) | remove_listener(&self.update, id)
    }

    /// Fire creation listeners. Locally created events are never announced.
    pub fn emit_created(&self, events: &[Event], origin: Origin) {
        if origin == Origin::Local || events.is_empty() {
            return;
        }
        // Listeners run outside the lock so they may subscribe or query the store.
        let listeners: Vec<CreateListener> = self
            .create
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for event in events {
            for listener in &listeners {
                listener(event);
            }
        }
    }

    pub fn emit_update(&self, delta: &[u8], origin: Origin) {
        let listeners: Vec<UpdateListener> = self
            .update
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in &listeners {
            listener(delta, origin);
        }
    }
}

fn remove_listener<T>(list: &RwLock<Vec<(ListenerId, T)>>, id: ListenerId) -> bool {
    let mut list = list.write().unwrap_or_else(PoisonError::into_inner);
    let before = list.len();
    list.retain(|(lid, _)| *lid != id);
    list.len() != before
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EventDraft;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_local_creations_are_not_announced() {
        let bus = NotificationBus::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        bus.on_create(Arc::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        let event = EventDraft::new("2025-01-01", "2025-01-02", "a").build().unwrap();

        bus.emit_created(std::slice::from_ref(&event), Origin::Local);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        bus.emit_created(std::slice::from_ref(&event), Origin::Remote);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = NotificationBus::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let id = bus.on_update(Arc::new(move |_, _| {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        bus.emit_update(b"x", Origin::Local);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit_update(b"x", Origin::Remote);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
