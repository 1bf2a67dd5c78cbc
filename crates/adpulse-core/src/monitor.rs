use std::sync::Arc;

use chrono::TimeDelta;

use crate::blocking::{BlockingEvent, BlockingKind, BlockingStats, EventFilter, EventMetadata, Severity};
use crate::error::AppError;
use crate::event_log::EventLog;
use crate::traits::{Clock, EventStore, NullEventStore};

/// Default analysis window for [`BlockingMonitor::compute_stats`].
pub const DEFAULT_WINDOW_HOURS: u32 = 24;

/// Widest window accepted from configuration or the command line (one year).
pub const MAX_WINDOW_HOURS: u32 = 24 * 365;

/// Default retention for [`BlockingMonitor::purge_older_than`].
pub const DEFAULT_RETENTION_DAYS: i64 = 30;

/// Records blocking events and derives the current blocking pressure.
pub struct BlockingMonitor<S = NullEventStore> {
    log: EventLog<S>,
    clock: Arc<dyn Clock>,
}

impl<S: EventStore> BlockingMonitor<S> {
    pub fn new(log: EventLog<S>, clock: Arc<dyn Clock>) -> Self {
        Self { log, clock }
    }

    pub fn event_log(&self) -> &EventLog<S> {
        &self.log
    }

    /// Timestamp and record an event. Never fails: durable errors are
    /// logged by the event log.
    pub async fn record_event(
        &self,
        kind: BlockingKind,
        severity: Severity,
        metadata: EventMetadata,
    ) -> BlockingEvent {
        let event = BlockingEvent::new(kind, severity, metadata, self.clock.now());
        tracing::warn!(
            event_id = %event.id,
            %kind,
            %severity,
            subject_id = ?event.subject_id,
            retry_after = ?event.retry_after_seconds,
            "Blocking event recorded"
        );
        self.log.insert(&event).await;
        event
    }

    /// Aggregate the events of the last `window_hours`. A window reaching
    /// past the earliest representable instant covers every stored event.
    pub async fn compute_stats(&self, window_hours: u32) -> BlockingStats {
        let now = self.clock.now();
        let filter = TimeDelta::try_hours(i64::from(window_hours))
            .and_then(|window| now.checked_sub_signed(window))
            .map(EventFilter::since)
            .unwrap_or_default();
        let events = self.log.query(&filter).await;
        BlockingStats::from_events(&events, now, window_hours)
    }

    pub async fn current_severity(&self) -> Severity {
        self.compute_stats(DEFAULT_WINDOW_HOURS)
            .await
            .current_severity
    }

    /// Most recent in-memory events, newest first.
    pub fn recent_events(&self, limit: usize) -> Vec<BlockingEvent> {
        self.log.recent(limit)
    }

    /// Delete events older than `max_age`.
    pub async fn purge_older_than(&self, max_age: TimeDelta) -> Result<u64, AppError> {
        let cutoff = self.clock.now().checked_sub_signed(max_age).ok_or_else(|| {
            AppError::Generic(format!("retention of {max_age} reaches before the earliest date"))
        })?;
        let removed = self.log.purge(&EventFilter::older_than(cutoff)).await?;
        tracing::info!(%cutoff, removed, "Purged old blocking events");
        Ok(removed)
    }
}
