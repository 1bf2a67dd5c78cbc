//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use url::Url;

use crate::blocking::{BlockingEvent, BlockingKind, EventFilter, Severity};
use crate::error::AppError;
use crate::traits::{BlockingClassifier, Classification, Clock, EventStore, Fetcher};

/// Markup the extraction engine reads as `count` active ads.
pub fn page_html(name: &str, count: u64) -> String {
    format!(
        r#"<html><script>"{{\"page_name\":\"{name}\",\"search_results_connection\":{{\"count\":{count}}}}}"</script></html>"#
    )
}

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

/// Mock fetcher with a default response and per-subject overrides.
///
/// Subjects are matched on the `view_all_page_id` query parameter.
#[derive(Clone)]
pub struct MockFetcher {
    default: Result<String, AppError>,
    routes: Arc<Mutex<HashMap<String, Result<String, AppError>>>>,
    delay: Duration,
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl MockFetcher {
    pub fn new(html: &str) -> Self {
        Self {
            default: Ok(html.to_string()),
            routes: Arc::new(Mutex::new(HashMap::new())),
            delay: Duration::ZERO,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_error(error: AppError) -> Self {
        Self {
            default: Err(error),
            ..Self::new("")
        }
    }

    /// Respond to one subject with `response` instead of the default.
    pub fn route(self, subject_id: &str, response: Result<String, AppError>) -> Self {
        self.routes
            .lock()
            .unwrap()
            .insert(subject_id.to_string(), response);
        self
    }

    /// Sleep this long before every response.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl Fetcher for MockFetcher {
    async fn fetch(&self, url: &str) -> Result<String, AppError> {
        self.calls.lock().unwrap().push(url.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let subject = Url::parse(url).ok().and_then(|u| {
            u.query_pairs()
                .find(|(k, _)| k == "view_all_page_id")
                .map(|(_, v)| v.into_owned())
        });
        let routed = subject.and_then(|s| self.routes.lock().unwrap().get(&s).cloned());
        routed.unwrap_or_else(|| self.default.clone())
    }
}

// ---------------------------------------------------------------------------
// MockEventStore
// ---------------------------------------------------------------------------

/// In-memory event store that can be told to fail every call.
#[derive(Clone)]
pub struct MockEventStore {
    pub events: Arc<Mutex<Vec<BlockingEvent>>>,
    failing: bool,
}

impl MockEventStore {
    pub fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            failing: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::new()
        }
    }

    fn check(&self) -> Result<(), AppError> {
        if self.failing {
            Err(AppError::DatabaseError("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

impl EventStore for MockEventStore {
    async fn insert(&self, event: &BlockingEvent) -> Result<(), AppError> {
        self.check()?;
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }

    async fn find(&self, filter: &EventFilter) -> Result<Vec<BlockingEvent>, AppError> {
        self.check()?;
        let mut found: Vec<_> = self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        found.sort_by_key(|e| e.timestamp);
        Ok(found)
    }

    async fn delete_many(&self, filter: &EventFilter) -> Result<u64, AppError> {
        self.check()?;
        let mut events = self.events.lock().unwrap();
        let before = events.len();
        events.retain(|e| !filter.matches(e));
        Ok((before - events.len()) as u64)
    }
}

// ---------------------------------------------------------------------------
// ManualClock
// ---------------------------------------------------------------------------

/// Clock that only moves when told to. Clones share the same time.
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(
                Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap(),
            )),
        }
    }

    pub fn advance(&self, by: TimeDelta) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

// ---------------------------------------------------------------------------
// StaticClassifier
// ---------------------------------------------------------------------------

/// Classifies every error as the same blocking kind.
pub struct StaticClassifier {
    pub kind: BlockingKind,
    pub severity: Severity,
}

impl BlockingClassifier for StaticClassifier {
    fn classify(&self, _error: &AppError) -> Option<Classification> {
        Some(Classification {
            kind: self.kind,
            severity: self.severity,
            retry_after_seconds: None,
        })
    }
}
