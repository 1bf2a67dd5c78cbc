//! Blocking events and the severity rules derived from them.
//!
//! A blocking event is any classified signal that the target throttled,
//! rejected, or challenged a request. Events are aggregated over a rolling
//! window into [`BlockingStats`], whose severity drives the throttle knobs.
//!
//! ```text
//! total > 10         -> medium   / reduce_frequency
//! total > 20         -> high     / reduce_frequency
//! total > 50         -> critical / pause
//! ip_blocked > 5     -> critical / change_strategy
//! captcha > 10       -> high     / change_strategy
//! rate_limit > 20    -> high     / reduce_frequency
//! last hour > 10     -> critical / pause            (always wins)
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Timelike, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const MEDIUM_TOTAL: u64 = 10;
const HIGH_TOTAL: u64 = 20;
const CRITICAL_TOTAL: u64 = 50;
const IP_BLOCK_LIMIT: u64 = 5;
const CAPTCHA_LIMIT: u64 = 10;
const RATE_LIMIT_LIMIT: u64 = 20;
const LAST_HOUR_LIMIT: u64 = 10;

/// Kind of blocking signal observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockingKind {
    RateLimit,
    IpBlocked,
    Captcha,
    UserAgentBlocked,
    Unknown,
}

impl BlockingKind {
    pub const ALL: [BlockingKind; 5] = [
        BlockingKind::RateLimit,
        BlockingKind::IpBlocked,
        BlockingKind::Captcha,
        BlockingKind::UserAgentBlocked,
        BlockingKind::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BlockingKind::RateLimit => "rate_limit",
            BlockingKind::IpBlocked => "ip_blocked",
            BlockingKind::Captcha => "captcha",
            BlockingKind::UserAgentBlocked => "user_agent_blocked",
            BlockingKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for BlockingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BlockingKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rate_limit" => Ok(BlockingKind::RateLimit),
            "ip_blocked" => Ok(BlockingKind::IpBlocked),
            "captcha" => Ok(BlockingKind::Captcha),
            "user_agent_blocked" => Ok(BlockingKind::UserAgentBlocked),
            "unknown" => Ok(BlockingKind::Unknown),
            _ => Err(format!("Unknown blocking kind: {s}")),
        }
    }
}

/// Four-level ordinal of blocking pressure.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            _ => Err(format!("Unknown severity: {s}")),
        }
    }
}

/// What the caller should do about the current blocking pressure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    #[default]
    Continue,
    ReduceFrequency,
    Pause,
    ChangeStrategy,
}

impl RecommendedAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecommendedAction::Continue => "continue",
            RecommendedAction::ReduceFrequency => "reduce_frequency",
            RecommendedAction::Pause => "pause",
            RecommendedAction::ChangeStrategy => "change_strategy",
        }
    }
}

impl fmt::Display for RecommendedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Optional context attached to a recorded event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventMetadata {
    pub retry_after_seconds: Option<f64>,
    pub user_agent: Option<String>,
    pub source_ip: Option<String>,
    pub subject_id: Option<String>,
    pub message: Option<String>,
}

impl EventMetadata {
    pub fn for_subject(subject_id: impl Into<String>) -> Self {
        Self {
            subject_id: Some(subject_id.into()),
            ..Default::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_retry_after(mut self, seconds: Option<f64>) -> Self {
        self.retry_after_seconds = seconds;
        self
    }
}

/// A single recorded blocking signal. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockingEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: BlockingKind,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl BlockingEvent {
    pub fn new(
        kind: BlockingKind,
        severity: Severity,
        metadata: EventMetadata,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp,
            kind,
            severity,
            retry_after_seconds: metadata.retry_after_seconds,
            user_agent: metadata.user_agent,
            source_ip: metadata.source_ip,
            subject_id: metadata.subject_id,
            message: metadata.message,
        }
    }
}

/// Selects events by time range and kind.
///
/// `since` is inclusive, `before` is exclusive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    pub since: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
    pub kind: Option<BlockingKind>,
}

impl EventFilter {
    pub fn since(since: DateTime<Utc>) -> Self {
        Self {
            since: Some(since),
            ..Default::default()
        }
    }

    pub fn older_than(before: DateTime<Utc>) -> Self {
        Self {
            before: Some(before),
            ..Default::default()
        }
    }

    pub fn with_kind(mut self, kind: BlockingKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn matches(&self, event: &BlockingEvent) -> bool {
        self.since.is_none_or(|since| event.timestamp >= since)
            && self.before.is_none_or(|before| event.timestamp < before)
            && self.kind.is_none_or(|kind| event.kind == kind)
    }
}

/// Aggregate of the events inside an analysis window. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockingStats {
    pub window_hours: u32,
    pub total_events: u64,
    pub events_by_kind: BTreeMap<BlockingKind, u64>,
    /// UTC hour of day (0-23) to event count. Hours without events are omitted.
    pub events_by_hour: BTreeMap<u32, u64>,
    pub events_last_hour: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_retry_after_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event: Option<BlockingEvent>,
    pub current_severity: Severity,
    pub recommended_action: RecommendedAction,
}

impl BlockingStats {
    /// Aggregate `events` (already restricted to the window) in one pass.
    pub fn from_events(events: &[BlockingEvent], now: DateTime<Utc>, window_hours: u32) -> Self {
        let hour_ago = now - TimeDelta::hours(1);

        let mut events_by_kind: BTreeMap<BlockingKind, u64> =
            BlockingKind::ALL.iter().map(|k| (*k, 0)).collect();
        let mut events_by_hour: BTreeMap<u32, u64> = BTreeMap::new();
        let mut events_last_hour = 0;
        let mut retry_sum = 0.0;
        let mut retry_samples = 0u32;
        let mut last_event: Option<&BlockingEvent> = None;

        for event in events {
            *events_by_kind.entry(event.kind).or_insert(0) += 1;
            *events_by_hour.entry(event.timestamp.hour()).or_insert(0) += 1;

            if event.timestamp >= hour_ago {
                events_last_hour += 1;
            }
            if let Some(retry) = event.retry_after_seconds {
                retry_sum += retry;
                retry_samples += 1;
            }
            if last_event.is_none_or(|last| event.timestamp >= last.timestamp) {
                last_event = Some(event);
            }
        }

        let total_events = events.len() as u64;
        let (current_severity, recommended_action) =
            assess(total_events, &events_by_kind, events_last_hour);

        Self {
            window_hours,
            total_events,
            events_by_kind,
            events_by_hour,
            events_last_hour,
            average_retry_after_seconds: (retry_samples > 0)
                .then(|| retry_sum / f64::from(retry_samples)),
            last_event: last_event.cloned(),
            current_severity,
            recommended_action,
        }
    }

    pub fn count(&self, kind: BlockingKind) -> u64 {
        self.events_by_kind.get(&kind).copied().unwrap_or(0)
    }
}

/// Apply the severity/action rules in order; later rules override earlier.
pub fn assess(
    total: u64,
    by_kind: &BTreeMap<BlockingKind, u64>,
    last_hour: u64,
) -> (Severity, RecommendedAction) {
    let count = |kind: BlockingKind| by_kind.get(&kind).copied().unwrap_or(0);

    let mut verdict = (Severity::Low, RecommendedAction::Continue);

    if total > MEDIUM_TOTAL {
        verdict = (Severity::Medium, RecommendedAction::ReduceFrequency);
    }
    if total > HIGH_TOTAL {
        verdict = (Severity::High, RecommendedAction::ReduceFrequency);
    }
    if total > CRITICAL_TOTAL {
        verdict = (Severity::Critical, RecommendedAction::Pause);
    }
    if count(BlockingKind::IpBlocked) > IP_BLOCK_LIMIT {
        verdict = (Severity::Critical, RecommendedAction::ChangeStrategy);
    }
    if count(BlockingKind::Captcha) > CAPTCHA_LIMIT {
        verdict = (Severity::High, RecommendedAction::ChangeStrategy);
    }
    if count(BlockingKind::RateLimit) > RATE_LIMIT_LIMIT {
        verdict = (Severity::High, RecommendedAction::ReduceFrequency);
    }
    if last_hour > LAST_HOUR_LIMIT {
        verdict = (Severity::Critical, RecommendedAction::Pause);
    }

    verdict
}
