//! Typed observer surface for upper layers.
//!
//! Replaces a dynamic event-emitter with a typed callback set and explicit
//! subscription/unsubscription. Observers are invoked synchronously from the
//! emitting task and must not block; anything slow belongs behind a channel
//! on the observer's side.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use alloy_primitives::B256;
use parking_lot::RwLock;

use crate::content::{RawContentKey, SubProtocolId};
use crate::enr::NodeId;

/// Callbacks exposed to upper layers. All methods default to no-ops so an
/// observer implements only what it consumes.
pub trait OverlayObserver: Send + Sync {
    fn on_node_added(&self, _node: NodeId, _protocol: SubProtocolId) {}
    fn on_node_removed(&self, _node: NodeId, _protocol: SubProtocolId) {}
    fn on_content_added(
        &self,
        _protocol: SubProtocolId,
        _key: &RawContentKey,
        _value: &[u8],
    ) {
    }
    fn on_verified(&self, _content_id: B256, _ok: bool) {}
}

/// Handle returned by [`ObserverSet::subscribe`]; pass it back to
/// [`ObserverSet::unsubscribe`] to detach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// A set of registered observers, shared across overlay components.
#[derive(Default)]
pub struct ObserverSet {
    next_id: AtomicU64,
    observers: RwLock<Vec<(u64, Arc<dyn OverlayObserver>)>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn OverlayObserver>) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers.write().push((id, observer));
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, subscription: SubscriptionId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(id, _)| *id != subscription.0);
        observers.len() != before
    }

    pub fn node_added(&self, node: NodeId, protocol: SubProtocolId) {
        for (_, obs) in self.observers.read().iter() {
            obs.on_node_added(node, protocol);
        }
    }

    pub fn node_removed(&self, node: NodeId, protocol: SubProtocolId) {
        for (_, obs) in self.observers.read().iter() {
            obs.on_node_removed(node, protocol);
        }
    }

    pub fn content_added(&self, protocol: SubProtocolId, key: &RawContentKey, value: &[u8]) {
        for (_, obs) in self.observers.read().iter() {
            obs.on_content_added(protocol, key, value);
        }
    }

    pub fn verified(&self, content_id: B256, ok: bool) {
        for (_, obs) in self.observers.read().iter() {
            obs.on_verified(content_id, ok);
        }
    }
}
