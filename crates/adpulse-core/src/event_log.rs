//! Bounded in-memory ring of blocking events backed by an optional
//! durable [`EventStore`].
//!
//! The durable store is authoritative when reachable. Every durable failure
//! is logged and absorbed here, so callers never repeat fallback logic.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use crate::blocking::{BlockingEvent, EventFilter};
use crate::error::AppError;
use crate::traits::{EventStore, NullEventStore};

/// Default number of events kept in memory.
pub const DEFAULT_RING_CAPACITY: usize = 1000;

pub struct EventLog<S = NullEventStore> {
    ring: Mutex<VecDeque<BlockingEvent>>,
    capacity: usize,
    store: Option<S>,
}

impl EventLog<NullEventStore> {
    /// A log with no durable backend.
    pub fn in_memory(capacity: usize) -> Self {
        Self::new(None, capacity)
    }
}

impl<S: EventStore> EventLog<S> {
    /// A ring of at most `capacity` events, persisted to `store` when given.
    pub fn new(store: Option<S>, capacity: usize) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_RING_CAPACITY))),
            capacity: capacity.max(1),
            store,
        }
    }

    pub fn with_store(store: S, capacity: usize) -> Self {
        Self::new(Some(store), capacity)
    }

    pub fn has_durable_store(&self) -> bool {
        self.store.is_some()
    }

    fn lock_ring(&self) -> MutexGuard<'_, VecDeque<BlockingEvent>> {
        self.ring.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned event ring mutex");
            poisoned.into_inner()
        })
    }

    /// Append to the ring (dropping the oldest past capacity), then make a
    /// best-effort durable write.
    pub async fn insert(&self, event: &BlockingEvent) {
        {
            let mut ring = self.lock_ring();
            ring.push_back(event.clone());
            while ring.len() > self.capacity {
                ring.pop_front();
            }
        }

        if let Some(store) = &self.store
            && let Err(e) = store.insert(event).await
        {
            tracing::warn!(
                event_id = %event.id,
                kind = %event.kind,
                error = %e,
                "Failed to persist blocking event; kept in memory only"
            );
        }
    }

    /// Events matching `filter`, oldest first. Reads the durable store and
    /// falls back to the ring when it fails.
    pub async fn query(&self, filter: &EventFilter) -> Vec<BlockingEvent> {
        if let Some(store) = &self.store {
            match store.find(filter).await {
                Ok(events) => return events,
                Err(e) => {
                    tracing::warn!(error = %e, "Event store unavailable; using in-memory events");
                }
            }
        }
        self.query_memory(filter)
    }

    fn query_memory(&self, filter: &EventFilter) -> Vec<BlockingEvent> {
        self.lock_ring()
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect()
    }

    /// Up to `limit` most recent in-memory events, newest first.
    pub fn recent(&self, limit: usize) -> Vec<BlockingEvent> {
        self.lock_ring().iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock_ring().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove matching events from memory and from the durable store.
    ///
    /// Returns the durable delete count when a store is configured, the
    /// in-memory count otherwise. A durable failure is returned to the caller.
    pub async fn purge(&self, filter: &EventFilter) -> Result<u64, AppError> {
        let removed_in_memory = {
            let mut ring = self.lock_ring();
            let before = ring.len();
            ring.retain(|e| !filter.matches(e));
            (before - ring.len()) as u64
        };

        match &self.store {
            Some(store) => store.delete_many(filter).await,
            None => Ok(removed_in_memory),
        }
    }
}
