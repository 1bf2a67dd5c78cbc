use std::sync::Arc;

use adpulse_core::blocking::{BlockingEvent, BlockingKind, EventFilter, EventMetadata, Severity};
use adpulse_core::event_log::EventLog;
use adpulse_core::monitor::BlockingMonitor;
use adpulse_core::traits::SystemClock;
use adpulse_db::BlockingEventRepository;
use chrono::{TimeDelta, Utc};

use crate::common::setup_test_db;

fn event(kind: BlockingKind, severity: Severity, minutes_ago: i64) -> BlockingEvent {
    BlockingEvent::new(
        kind,
        severity,
        EventMetadata::for_subject("123").with_message("HTTP 429"),
        Utc::now() - TimeDelta::minutes(minutes_ago),
    )
}

#[tokio::test]
async fn insert_and_find_round_trips_fields() {
    let (pool, _container) = setup_test_db().await;
    let repo = BlockingEventRepository::new(pool);

    let original = BlockingEvent::new(
        BlockingKind::RateLimit,
        Severity::Medium,
        EventMetadata::for_subject("123")
            .with_message("HTTP 429")
            .with_retry_after(Some(30.0)),
        Utc::now(),
    );
    repo.insert(&original).await.unwrap();

    let found = repo.find(&EventFilter::default()).await.unwrap();
    assert_eq!(found.len(), 1);
    let stored = &found[0];
    assert_eq!(stored.id, original.id);
    assert_eq!(stored.kind, BlockingKind::RateLimit);
    assert_eq!(stored.severity, Severity::Medium);
    assert_eq!(stored.retry_after_seconds, Some(30.0));
    assert_eq!(stored.subject_id.as_deref(), Some("123"));
    assert_eq!(stored.message.as_deref(), Some("HTTP 429"));
    assert_eq!(stored.user_agent, None);
}

#[tokio::test]
async fn duplicate_insert_is_ignored() {
    let (pool, _container) = setup_test_db().await;
    let repo = BlockingEventRepository::new(pool);

    let e = event(BlockingKind::Captcha, Severity::High, 0);
    repo.insert(&e).await.unwrap();
    repo.insert(&e).await.unwrap();

    assert_eq!(repo.find(&EventFilter::default()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn find_applies_window_and_kind() {
    let (pool, _container) = setup_test_db().await;
    let repo = BlockingEventRepository::new(pool);

    repo.insert(&event(BlockingKind::RateLimit, Severity::Medium, 60 * 30))
        .await
        .unwrap();
    let recent_ip = event(BlockingKind::IpBlocked, Severity::High, 10);
    repo.insert(&recent_ip).await.unwrap();
    let recent_rate = event(BlockingKind::RateLimit, Severity::Medium, 5);
    repo.insert(&recent_rate).await.unwrap();

    let last_day = EventFilter::since(Utc::now() - TimeDelta::hours(24));
    let found = repo.find(&last_day).await.unwrap();
    let ids: Vec<_> = found.iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![recent_ip.id, recent_rate.id], "oldest first");

    let rate_only = repo
        .find(&last_day.with_kind(BlockingKind::RateLimit))
        .await
        .unwrap();
    assert_eq!(rate_only.len(), 1);
    assert_eq!(rate_only[0].id, recent_rate.id);
}

#[tokio::test]
async fn delete_many_removes_only_old_events() {
    let (pool, _container) = setup_test_db().await;
    let repo = BlockingEventRepository::new(pool);

    for days in [45, 40, 31] {
        repo.insert(&event(BlockingKind::Unknown, Severity::Low, days * 24 * 60))
            .await
            .unwrap();
    }
    let fresh = event(BlockingKind::Unknown, Severity::Low, 60);
    repo.insert(&fresh).await.unwrap();

    let cutoff = Utc::now() - TimeDelta::days(30);
    let removed = repo
        .delete_many(&EventFilter::older_than(cutoff))
        .await
        .unwrap();
    assert_eq!(removed, 3);

    let left = repo.find(&EventFilter::default()).await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].id, fresh.id);
}

#[tokio::test]
async fn monitor_reads_events_written_by_other_processes() {
    let (pool, _container) = setup_test_db().await;
    let repo = BlockingEventRepository::new(pool);

    // Another instance recorded these; this monitor's ring is empty.
    for minutes_ago in [200, 150, 100, 90, 80, 70] {
        repo.insert(&event(BlockingKind::IpBlocked, Severity::High, minutes_ago))
            .await
            .unwrap();
    }

    let monitor = BlockingMonitor::new(
        EventLog::with_store(repo.clone(), 1000),
        Arc::new(SystemClock),
    );
    assert!(monitor.recent_events(10).is_empty());

    let stats = monitor.compute_stats(24).await;
    assert_eq!(stats.total_events, 6);
    assert_eq!(stats.count(BlockingKind::IpBlocked), 6);
    assert_eq!(stats.current_severity, Severity::Critical);

    let purged = monitor.purge_older_than(TimeDelta::hours(2)).await.unwrap();
    assert_eq!(purged, 2);
}
