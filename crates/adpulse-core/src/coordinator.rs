//! Admission and batching for advertiser stats lookups.
//!
//! # Request flow
//!
//! ```text
//! get_stats ──> cache hit? ──yes──> return cached
//!                  │ no
//!                  ├─> same key in flight? ──yes──> wait for its result
//!                  │ no
//!                  ├─> slot free under ceiling? ──yes──> fetch + extract
//!                  │ no
//!                  └─> enqueue ──[batch full | flush timer]──> drain
//!                                    each: wait for slot ──> fetch + extract
//! ```
//!
//! Failures the classifier recognises are recorded as blocking events,
//! which raise severity, which tightens the knobs used by the next
//! admission decision.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::TimeDelta;
use futures::future::join_all;
use tokio::sync::oneshot;

use crate::admission::{AdmissionGate, AdmissionPermit};
use crate::blocking::{BlockingEvent, BlockingKind, BlockingStats, EventMetadata, Severity};
use crate::cache::ResultCache;
use crate::config::CoordinatorConfig;
use crate::error::AppError;
use crate::event_log::EventLog;
use crate::extract::extract;
use crate::models::{ExtractedStats, PerformanceStats, StatsResult, SubjectKey, percentage};
use crate::monitor::BlockingMonitor;
use crate::throttle::ThrottleKnobs;
use crate::traits::{
    BlockingClassifier, Clock, EventStore, Fetcher, NoClassification, NullEventStore, SystemClock,
};

type Outcome = Result<ExtractedStats, AppError>;
type Completion = oneshot::Sender<Outcome>;

/// A queued lookup waiting for its batch to flush.
struct BatchRequest {
    key: SubjectKey,
    completion: Completion,
}

#[derive(Default)]
struct PendingQueue {
    requests: Vec<BatchRequest>,
    /// Bumped on every flush so a timer armed for an earlier window is ignored.
    generation: u64,
    timer_armed: bool,
}

impl PendingQueue {
    fn take_batch(&mut self) -> Vec<BatchRequest> {
        self.generation += 1;
        self.timer_armed = false;
        std::mem::take(&mut self.requests)
    }
}

#[derive(Default)]
struct Counters {
    total_requests: AtomicU64,
    cache_hits: AtomicU64,
    successful_scrapes: AtomicU64,
    errors: AtomicU64,
    coalesced: AtomicU64,
    /// Drained from the queue but still waiting for a slot.
    waiting_for_slot: AtomicUsize,
}

type InFlight = Mutex<HashMap<SubjectKey, Vec<Completion>>>;

/// Leadership over one key's extraction. Whoever holds it must publish the
/// outcome; dropping it unpublished fails the waiters instead of leaving
/// them hanging.
struct InFlightSlot<'a> {
    in_flight: &'a InFlight,
    key: Option<SubjectKey>,
}

impl InFlightSlot<'_> {
    fn publish(mut self, outcome: &Outcome) {
        if let Some(key) = self.key.take() {
            notify_waiters(self.in_flight, &key, outcome);
        }
    }
}

impl Drop for InFlightSlot<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            let abandoned = Err(AppError::Generic(format!(
                "extraction for {key} was abandoned"
            )));
            notify_waiters(self.in_flight, &key, &abandoned);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("Recovered from poisoned coordinator mutex");
        poisoned.into_inner()
    })
}

fn notify_waiters(in_flight: &InFlight, key: &SubjectKey, outcome: &Outcome) {
    let waiters = lock(in_flight).remove(key).unwrap_or_default();
    for waiter in waiters {
        let _ = waiter.send(outcome.clone());
    }
}

async fn await_completion(rx: oneshot::Receiver<Outcome>) -> Outcome {
    rx.await
        .unwrap_or_else(|_| Err(AppError::Generic("request dropped before completion".into())))
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

struct Inner<F, S> {
    fetcher: F,
    monitor: BlockingMonitor<S>,
    cache: ResultCache,
    classifier: Arc<dyn BlockingClassifier>,
    clock: Arc<dyn Clock>,
    config: CoordinatorConfig,
    gate: Arc<AdmissionGate>,
    queue: Mutex<PendingQueue>,
    in_flight: InFlight,
    counters: Counters,
}

/// Builds a [`StatsCoordinator`] with injected collaborators.
pub struct CoordinatorBuilder<F, S = NullEventStore> {
    fetcher: F,
    store: Option<S>,
    classifier: Arc<dyn BlockingClassifier>,
    clock: Arc<dyn Clock>,
    config: CoordinatorConfig,
}

impl<F: Fetcher + 'static> CoordinatorBuilder<F, NullEventStore> {
    pub fn new(fetcher: F) -> Self {
        Self {
            fetcher,
            store: None,
            classifier: Arc::new(NoClassification),
            clock: Arc::new(SystemClock),
            config: CoordinatorConfig::default(),
        }
    }
}

impl<F: Fetcher + 'static, S: EventStore + 'static> CoordinatorBuilder<F, S> {
    /// Persist blocking events to a durable store.
    pub fn with_store<S2: EventStore + 'static>(self, store: S2) -> CoordinatorBuilder<F, S2> {
        CoordinatorBuilder {
            fetcher: self.fetcher,
            store: Some(store),
            classifier: self.classifier,
            clock: self.clock,
            config: self.config,
        }
    }

    pub fn with_classifier(mut self, classifier: impl BlockingClassifier + 'static) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> StatsCoordinator<F, S> {
        let log = EventLog::new(self.store, self.config.event_capacity);
        let inner = Inner {
            fetcher: self.fetcher,
            monitor: BlockingMonitor::new(log, Arc::clone(&self.clock)),
            cache: ResultCache::new(self.config.cache_ttl, Arc::clone(&self.clock)),
            classifier: self.classifier,
            clock: self.clock,
            config: self.config,
            gate: AdmissionGate::new(),
            queue: Mutex::new(PendingQueue::default()),
            in_flight: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        };
        StatsCoordinator {
            inner: Arc::new(inner),
        }
    }
}

/// Serves advertiser stats under adaptive throttling.
///
/// Cheap to clone; clones share all state.
pub struct StatsCoordinator<F, S = NullEventStore> {
    inner: Arc<Inner<F, S>>,
}

impl<F, S> Clone for StatsCoordinator<F, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: Fetcher + 'static> StatsCoordinator<F, NullEventStore> {
    pub fn builder(fetcher: F) -> CoordinatorBuilder<F, NullEventStore> {
        CoordinatorBuilder::new(fetcher)
    }
}

impl<F: Fetcher + 'static, S: EventStore + 'static> StatsCoordinator<F, S> {
    /// Look up the active ad count of `subject_id` in `region`.
    ///
    /// Never fails: errors are reported in the result.
    pub async fn get_stats(&self, subject_id: &str, region: &str) -> StatsResult {
        let started = Instant::now();
        let key = SubjectKey::new(subject_id, region);
        let counters = &self.inner.counters;
        counters.total_requests.fetch_add(1, Ordering::Relaxed);

        if let Some(stats) = self.inner.cache.get(&key) {
            counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(%key, "Cache hit");
            return StatsResult::ok(stats, elapsed_ms(started), true);
        }

        let outcome = self.inner.resolve(key.clone()).await;
        let elapsed = elapsed_ms(started);

        match outcome {
            Ok(stats) => {
                counters.successful_scrapes.fetch_add(1, Ordering::Relaxed);
                StatsResult::ok(stats, elapsed, false)
            }
            Err(e) => {
                counters.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%key, error = %e, elapsed_ms = elapsed, "Stats lookup failed");
                StatsResult::failed(e.to_string(), elapsed)
            }
        }
    }

    /// Blocking pressure over the configured window.
    pub async fn blocking_stats(&self) -> BlockingStats {
        self.inner
            .monitor
            .compute_stats(self.inner.config.window_hours)
            .await
    }

    /// Knobs for the current severity. Recomputed on every call.
    pub async fn current_knobs(&self) -> ThrottleKnobs {
        self.inner.knobs().await
    }

    /// Delay a caller should wait before its next round, with jitter.
    pub async fn recommended_delay(&self) -> Duration {
        self.current_knobs().await.jittered_delay()
    }

    pub async fn recommended_batch_size(&self) -> usize {
        self.current_knobs().await.batch_size
    }

    pub async fn recommended_concurrency(&self) -> usize {
        self.current_knobs().await.concurrency
    }

    /// Record a blocking signal classified outside the coordinator.
    pub async fn record_blocking_event(
        &self,
        kind: BlockingKind,
        severity: Severity,
        metadata: EventMetadata,
    ) -> BlockingEvent {
        self.inner
            .monitor
            .record_event(kind, severity, metadata)
            .await
    }

    /// Delete blocking events older than `max_age`.
    pub async fn purge_events_older_than(&self, max_age: TimeDelta) -> Result<u64, AppError> {
        self.inner.monitor.purge_older_than(max_age).await
    }

    pub fn monitor(&self) -> &BlockingMonitor<S> {
        &self.inner.monitor
    }

    /// Operator reset of all cached results.
    pub fn clear_cache(&self) {
        self.inner.cache.invalidate_all();
    }

    pub fn performance_stats(&self) -> PerformanceStats {
        let c = &self.inner.counters;
        let total_requests = c.total_requests.load(Ordering::Relaxed);
        let cache_hits = c.cache_hits.load(Ordering::Relaxed);
        let successful_scrapes = c.successful_scrapes.load(Ordering::Relaxed);
        let queued = lock(&self.inner.queue).requests.len();

        PerformanceStats {
            total_requests,
            cache_hits,
            successful_scrapes,
            errors: c.errors.load(Ordering::Relaxed),
            coalesced_requests: c.coalesced.load(Ordering::Relaxed),
            cache_hit_rate: percentage(cache_hits, total_requests),
            cache_size: self.inner.cache.len(),
            active_requests: self.inner.gate.active(),
            queued_requests: queued + c.waiting_for_slot.load(Ordering::Relaxed),
            success_rate: percentage(
                successful_scrapes,
                total_requests.saturating_sub(cache_hits),
            ),
        }
    }
}

impl<F: Fetcher + 'static, S: EventStore + 'static> Inner<F, S> {
    async fn knobs(&self) -> ThrottleKnobs {
        let stats = self.monitor.compute_stats(self.config.window_hours).await;
        ThrottleKnobs::for_severity(stats.current_severity)
    }

    async fn resolve(self: &Arc<Self>, key: SubjectKey) -> Outcome {
        if let Some(rx) = self.attach(&key) {
            tracing::debug!(%key, "Joining in-flight extraction");
            return await_completion(rx).await;
        }

        let knobs = self.knobs().await;
        if let Some(permit) = self.gate.try_acquire(knobs.concurrency) {
            return self.run_extraction(key, permit).await;
        }

        let rx = self.enqueue(key, &knobs);
        await_completion(rx).await
    }

    /// Subscribe to an extraction already running for `key`.
    fn attach(&self, key: &SubjectKey) -> Option<oneshot::Receiver<Outcome>> {
        let mut in_flight = lock(&self.in_flight);
        self.subscribe(&mut in_flight, key)
    }

    fn subscribe(
        &self,
        in_flight: &mut HashMap<SubjectKey, Vec<Completion>>,
        key: &SubjectKey,
    ) -> Option<oneshot::Receiver<Outcome>> {
        let waiters = in_flight.get_mut(key)?;
        let (tx, rx) = oneshot::channel();
        waiters.push(tx);
        self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
        Some(rx)
    }

    /// Become the extractor for `key`, or subscribe if someone already is.
    fn lead_or_attach(
        &self,
        key: &SubjectKey,
    ) -> Result<InFlightSlot<'_>, oneshot::Receiver<Outcome>> {
        let mut in_flight = lock(&self.in_flight);
        if let Some(rx) = self.subscribe(&mut in_flight, key) {
            return Err(rx);
        }
        in_flight.insert(key.clone(), Vec::new());
        Ok(InFlightSlot {
            in_flight: &self.in_flight,
            key: Some(key.clone()),
        })
    }

    async fn run_extraction(&self, key: SubjectKey, permit: AdmissionPermit) -> Outcome {
        let slot = match self.lead_or_attach(&key) {
            Ok(slot) => slot,
            Err(rx) => {
                drop(permit);
                return await_completion(rx).await;
            }
        };

        // A sibling may have filled the cache while this one waited.
        let outcome = match self.cache.get(&key) {
            Some(stats) => Ok(stats),
            None => self.fetch_and_extract(&key).await,
        };
        drop(permit);
        slot.publish(&outcome);
        outcome
    }

    fn enqueue(
        self: &Arc<Self>,
        key: SubjectKey,
        knobs: &ThrottleKnobs,
    ) -> oneshot::Receiver<Outcome> {
        let (tx, rx) = oneshot::channel();
        let mut full_batch = None;
        let mut timer_generation = None;

        {
            let mut queue = lock(&self.queue);
            queue.requests.push(BatchRequest {
                key,
                completion: tx,
            });
            if queue.requests.len() >= knobs.batch_size.max(1) {
                full_batch = Some(queue.take_batch());
            } else if !queue.timer_armed {
                queue.timer_armed = true;
                timer_generation = Some(queue.generation);
            }
            tracing::debug!(
                queued = queue.requests.len(),
                batch_size = knobs.batch_size,
                "Request queued"
            );
        }

        if let Some(batch) = full_batch {
            tracing::debug!(size = batch.len(), "Batch full, flushing");
            self.spawn_drain(batch);
        }

        if let Some(generation) = timer_generation {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(this.config.flush_interval).await;
                let batch = {
                    let mut queue = lock(&this.queue);
                    (queue.generation == generation).then(|| queue.take_batch())
                };
                if let Some(batch) = batch.filter(|b| !b.is_empty()) {
                    tracing::debug!(size = batch.len(), "Flush timer fired");
                    this.spawn_drain(batch);
                }
            });
        }

        rx
    }

    /// Run every request of a flushed batch concurrently, each gated on a
    /// slot. One failure never affects its siblings.
    fn spawn_drain(self: &Arc<Self>, batch: Vec<BatchRequest>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let size = batch.len();
            this.counters
                .waiting_for_slot
                .fetch_add(size, Ordering::Relaxed);

            let drains = batch.into_iter().map(|request| {
                let this = Arc::clone(&this);
                async move {
                    let outcome = this.drain_one(request.key).await;
                    let _ = request.completion.send(outcome);
                }
            });
            join_all(drains).await;
            tracing::debug!(size, "Batch drained");
        });
    }

    async fn drain_one(self: Arc<Self>, key: SubjectKey) -> Outcome {
        let inner: &Self = &self;
        let permit = self
            .gate
            .acquire(move || async move { inner.knobs().await.concurrency })
            .await;
        self.counters
            .waiting_for_slot
            .fetch_sub(1, Ordering::Relaxed);
        self.run_extraction(key, permit).await
    }

    async fn fetch_and_extract(&self, key: &SubjectKey) -> Outcome {
        let started = Instant::now();
        let outcome = self.fetch_page(key).await.and_then(|html| {
            let extraction = extract(&html, &key.subject_id);
            let active_count = extraction.active_count.ok_or_else(|| {
                AppError::Extraction(format!(
                    "no active ad count found in {} bytes of markup",
                    html.len()
                ))
            })?;
            Ok(ExtractedStats {
                subject_id: key.subject_id.clone(),
                region: key.region.clone(),
                display_name: extraction.display_name,
                active_count,
                observed_at: self.clock.now(),
            })
        });

        match &outcome {
            Ok(stats) => {
                tracing::info!(
                    %key,
                    active_count = stats.active_count,
                    name = ?stats.display_name,
                    elapsed_ms = elapsed_ms(started),
                    "Extracted stats"
                );
                self.cache.put(key.clone(), stats.clone());
            }
            Err(e) => self.report_failure(key, e).await,
        }
        outcome
    }

    async fn fetch_page(&self, key: &SubjectKey) -> Result<String, AppError> {
        let url = self.config.target_url(key)?;
        tracing::debug!(%key, %url, "Fetching");
        match tokio::time::timeout(self.config.fetch_timeout, self.fetcher.fetch(&url)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout(self.config.fetch_timeout.as_secs())),
        }
    }

    async fn report_failure(&self, key: &SubjectKey, error: &AppError) {
        let Some(class) = self.classifier.classify(error) else {
            return;
        };
        let metadata = EventMetadata::for_subject(key.subject_id.clone())
            .with_message(error.to_string())
            .with_retry_after(class.retry_after_seconds);
        self.monitor
            .record_event(class.kind, class.severity, metadata)
            .await;
    }
}
