//! Session-scoped, append-only event store with derived views.
//!
//! One store per [`crate::session::Session`]; no two sessions share a store.
//! Appends come from the connection task, reads from the consumer side —
//! both are synchronous and non-blocking. Arrival order is the ordering
//! guarantee: producer timestamps may be skewed across channels and are
//! never used to reorder.
//!
//! Consumers that want to react to changes without polling can watch the
//! version counter from [`EventStore::changes`]; it bumps on every append
//! and clear.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;

use crate::event::{ProgressEvent, Visibility};

/// Append-only ordered log of received events plus derived views.
#[derive(Debug)]
pub struct EventStore {
    inner: Mutex<Inner>,
    version_tx: watch::Sender<u64>,
}

#[derive(Debug, Default)]
struct Inner {
    events: Vec<ProgressEvent>,
    /// Set on session close. A sealed store silently drops appends so
    /// late in-flight frames cannot resurrect a torn-down session.
    sealed: bool,
}

impl EventStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Arc<Self> {
        let (version_tx, _) = watch::channel(0);
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            version_tx,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump_version(&self) {
        self.version_tx.send_modify(|v| *v += 1);
    }

    /// Append an event, preserving arrival order.
    ///
    /// Returns `false` when the store is sealed and the event was dropped.
    pub fn append(&self, event: ProgressEvent) -> bool {
        {
            let mut inner = self.lock();
            if inner.sealed {
                return false;
            }
            inner.events.push(event);
        }
        self.bump_version();
        true
    }

    /// Full ordered sequence of events received this session.
    #[must_use]
    pub fn all(&self) -> Vec<ProgressEvent> {
        self.lock().events.clone()
    }

    /// Private events addressed to `user_id`, in arrival order.
    #[must_use]
    pub fn private_for(&self, user_id: &str) -> Vec<ProgressEvent> {
        self.lock()
            .events
            .iter()
            .filter(|e| e.visibility == Visibility::Private && e.user_id.as_deref() == Some(user_id))
            .cloned()
            .collect()
    }

    /// Public broadcast events, in arrival order.
    #[must_use]
    pub fn public_feed(&self) -> Vec<ProgressEvent> {
        self.lock()
            .events
            .iter()
            .filter(|e| e.visibility == Visibility::Public)
            .cloned()
            .collect()
    }

    /// Most recently arrived private event matching both `user_id` and
    /// `operation_id`, or `None`.
    #[must_use]
    pub fn latest_for(&self, user_id: &str, operation_id: &str) -> Option<ProgressEvent> {
        self.lock()
            .events
            .iter()
            .rev()
            .find(|e| {
                e.visibility == Visibility::Private
                    && e.user_id.as_deref() == Some(user_id)
                    && e.operation_id.as_deref() == Some(operation_id)
            })
            .cloned()
    }

    /// Empty the store. Idempotent; does not affect connection state or
    /// the sealed flag.
    pub fn clear(&self) {
        self.lock().events.clear();
        self.bump_version();
    }

    /// Stop accepting appends. Called on session close so frames that were
    /// already in flight are dropped rather than stored.
    pub fn seal(&self) {
        self.lock().sealed = true;
    }

    /// Number of stored events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().events.is_empty()
    }

    /// Watch receiver over the store's version counter; bumps on every
    /// append and clear.
    #[must_use]
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.version_tx.subscribe()
    }
}
