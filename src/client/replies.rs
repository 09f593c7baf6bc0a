//! Correlation-id keyed reply registry.
//!
//! One consumer on the shared reply queue fans in replies for every
//! in-flight request. Each request registers a listener under its
//! correlation id and removes it through the returned `ReplyHandle`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use tracing::debug;

use crate::broker::InboundReply;

/// Listener invoked with each reply frame for its correlation id.
pub type ReplyListener = Arc<dyn Fn(&InboundReply) + Send + Sync>;

type Slots = HashMap<String, Vec<(u64, ReplyListener)>>;

/// Registry of reply listeners, shared by the consumer and publishers.
///
/// There is no cap on the number of listeners.
#[derive(Clone, Default)]
pub struct ReplyRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    slots: RwLock<Slots>,
    next_id: AtomicU64,
}

impl ReplyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` under `correlation_id`.
    pub fn register(&self, correlation_id: &str, listener: ReplyListener) -> ReplyHandle {
        let listener_id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .write_slots()
            .entry(correlation_id.to_string())
            .or_default()
            .push((listener_id, listener));

        ReplyHandle {
            registry: Arc::downgrade(&self.inner),
            correlation_id: correlation_id.to_string(),
            listener_id,
        }
    }

    /// Route a reply frame to the listeners registered under its correlation id.
    ///
    /// Returns the number of listeners invoked. Frames without a match are
    /// dropped: the request may already have been cancelled by its caller.
    pub fn dispatch(&self, reply: &InboundReply) -> usize {
        let Some(correlation_id) = reply.correlation_id.as_deref() else {
            debug!("Dropping reply without correlation id");
            return 0;
        };

        // Snapshot under the read lock, invoke after releasing it
        let listeners: Vec<ReplyListener> = self
            .inner
            .read_slots()
            .get(correlation_id)
            .map(|entries| entries.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();

        if listeners.is_empty() {
            debug!(correlation_id = %correlation_id, "Dropping unmatched reply");
            return 0;
        }

        for listener in &listeners {
            listener(reply);
        }
        listeners.len()
    }

    /// Number of correlation ids with at least one live listener.
    pub fn pending(&self) -> usize {
        self.inner.read_slots().len()
    }

    /// Whether any listener is registered under `correlation_id`.
    #[cfg(test)]
    pub(crate) fn contains(&self, correlation_id: &str) -> bool {
        self.inner.read_slots().contains_key(correlation_id)
    }
}

impl RegistryInner {
    fn read_slots(&self) -> std::sync::RwLockReadGuard<'_, Slots> {
        // Listeners run outside the lock, so poisoning cannot leave the map torn
        self.slots.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_slots(&self) -> std::sync::RwLockWriteGuard<'_, Slots> {
        self.slots.write().unwrap_or_else(|e| e.into_inner())
    }

    fn remove(&self, correlation_id: &str, listener_id: u64) {
        let mut slots = self.write_slots();
        if let Some(entries) = slots.get_mut(correlation_id) {
            entries.retain(|(id, _)| *id != listener_id);
            if entries.is_empty() {
                slots.remove(correlation_id);
            }
        }
    }
}

/// Deregisters one listener. Cancelling twice is a no-op.
///
/// Dropping the handle does not cancel; call `cancel()` explicitly.
#[derive(Debug, Clone)]
pub struct ReplyHandle {
    registry: Weak<RegistryInner>,
    correlation_id: String,
    listener_id: u64,
}

impl ReplyHandle {
    /// Handle for a request that never registered a listener.
    pub(crate) fn inert(correlation_id: impl Into<String>) -> Self {
        Self {
            registry: Weak::new(),
            correlation_id: correlation_id.into(),
            listener_id: u64::MAX,
        }
    }

    /// Correlation id of the request.
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Remove the listener.
    pub fn cancel(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.correlation_id, self.listener_id);
        }
    }
}
