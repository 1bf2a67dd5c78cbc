//! Counting gate for in-flight fetches with a ceiling that may change
//! between acquisitions.
//!
//! A fixed-size semaphore cannot follow the throttle knobs, so the gate
//! keeps its own counter and asks for the current ceiling on every attempt.
//! Waiters park on a [`Notify`]. A release wakes one of them, and a waiter
//! that is admitted while capacity remains wakes the next.

use std::future::Future;
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct AdmissionGate {
    active: Mutex<usize>,
    released: Notify,
}

/// A held slot. Dropping it frees the slot and wakes one waiter.
#[derive(Debug)]
pub struct AdmissionPermit {
    gate: Arc<AdmissionGate>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        {
            let mut active = self.gate.lock_active();
            *active = active.saturating_sub(1);
        }
        self.gate.released.notify_one();
    }
}

impl AdmissionGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock_active(&self) -> MutexGuard<'_, usize> {
        self.active.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned admission gate mutex");
            poisoned.into_inner()
        })
    }

    /// Number of permits currently held.
    pub fn active(&self) -> usize {
        *self.lock_active()
    }

    /// Take a slot if fewer than `ceiling` are held. A ceiling of 0 is
    /// treated as 1 so work can always make progress.
    pub fn try_acquire(self: &Arc<Self>, ceiling: usize) -> Option<AdmissionPermit> {
        let mut active = self.lock_active();
        if *active < ceiling.max(1) {
            *active += 1;
            Some(AdmissionPermit {
                gate: Arc::clone(self),
            })
        } else {
            None
        }
    }

    /// Wait for a slot, asking `ceiling` for the current limit before each
    /// attempt.
    pub async fn acquire<C, Fut>(self: &Arc<Self>, mut ceiling: C) -> AdmissionPermit
    where
        C: FnMut() -> Fut,
        Fut: Future<Output = usize>,
    {
        loop {
            let limit = ceiling().await;

            // Register before checking so a release between the check and
            // the await is not missed.
            let mut notified = pin!(self.released.notified());
            notified.as_mut().enable();

            if let Some(permit) = self.try_acquire(limit) {
                if self.active() < limit.max(1) {
                    self.released.notify_one();
                }
                return permit;
            }
            notified.await;
        }
    }
}
