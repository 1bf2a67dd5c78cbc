use std::future::Future;

use chrono::{DateTime, Utc};

use crate::blocking::{BlockingEvent, BlockingKind, EventFilter, Severity};
use crate::error::AppError;

/// Fetches the raw HTML of a target page.
///
/// Implementations own their header set and hard timeout; a non-2xx
/// response must surface as [`AppError::HttpStatus`].
pub trait Fetcher: Send + Sync + Clone {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<String, AppError>> + Send;
}

/// Durable storage for blocking events.
///
/// Any call may fail. Callers treat failures as non-fatal for recording and
/// fall back to in-memory data for reads.
pub trait EventStore: Send + Sync + Clone {
    fn insert(&self, event: &BlockingEvent) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Events matching the filter, oldest first.
    fn find(
        &self,
        filter: &EventFilter,
    ) -> impl Future<Output = Result<Vec<BlockingEvent>, AppError>> + Send;

    /// Delete matching events. Returns the number removed.
    fn delete_many(&self, filter: &EventFilter)
    -> impl Future<Output = Result<u64, AppError>> + Send;
}

/// A no-op EventStore, used as the type parameter of a memory-only log.
#[derive(Debug, Clone)]
pub struct NullEventStore;

impl EventStore for NullEventStore {
    async fn insert(&self, _event: &BlockingEvent) -> Result<(), AppError> {
        Ok(())
    }

    async fn find(&self, _filter: &EventFilter) -> Result<Vec<BlockingEvent>, AppError> {
        Ok(vec![])
    }

    async fn delete_many(&self, _filter: &EventFilter) -> Result<u64, AppError> {
        Ok(0)
    }
}

/// What a classifier decided about a failed fetch or extraction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub kind: BlockingKind,
    pub severity: Severity,
    pub retry_after_seconds: Option<f64>,
}

/// Maps a failure to a blocking signal.
///
/// The core never infers blocking from HTTP details itself; whoever wires
/// the coordinator decides what counts as a block.
pub trait BlockingClassifier: Send + Sync {
    fn classify(&self, error: &AppError) -> Option<Classification>;
}

/// Classifier that never reports a block.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoClassification;

impl BlockingClassifier for NoClassification {
    fn classify(&self, _error: &AppError) -> Option<Classification> {
        None
    }
}

/// Source of wall-clock time for TTLs and analysis windows.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
