use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifies one lookup: an advertiser page in a given country.
///
/// The region is upper-cased on construction so `us` and `US` share a
/// cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubjectKey {
    pub subject_id: String,
    pub region: String,
}

impl SubjectKey {
    pub fn new(subject_id: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into().trim().to_string(),
            region: region.into().trim().to_uppercase(),
        }
    }
}

impl fmt::Display for SubjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.subject_id, self.region)
    }
}

/// Counts read from one successful fetch of a subject's page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedStats {
    pub subject_id: String,
    pub region: String,
    /// Page name as shown on the target, when it could be read.
    pub display_name: Option<String>,
    pub active_count: u64,
    pub observed_at: DateTime<Utc>,
}

/// Outcome of a single `get_stats` call. Failures are reported here,
/// never as an `Err` across the public contract.
#[derive(Debug, Clone, Serialize)]
pub struct StatsResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<ExtractedStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub execution_time_ms: u64,
    pub from_cache: bool,
}

impl StatsResult {
    pub fn ok(stats: ExtractedStats, execution_time_ms: u64, from_cache: bool) -> Self {
        Self {
            success: true,
            stats: Some(stats),
            error: None,
            execution_time_ms,
            from_cache,
        }
    }

    pub fn failed(error: impl Into<String>, execution_time_ms: u64) -> Self {
        Self {
            success: false,
            stats: None,
            error: Some(error.into()),
            execution_time_ms,
            from_cache: false,
        }
    }
}

/// Operator-facing snapshot of the coordinator's running counters.
///
/// Rates are percentages. `success_rate` only considers requests that
/// actually needed a scrape (cache hits are excluded).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceStats {
    pub total_requests: u64,
    pub cache_hits: u64,
    pub successful_scrapes: u64,
    pub errors: u64,
    pub coalesced_requests: u64,
    pub cache_hit_rate: f64,
    pub cache_size: usize,
    pub active_requests: usize,
    pub queued_requests: usize,
    pub success_rate: f64,
}

/// Percentage of `part` in `whole`, 0 when `whole` is 0.
pub(crate) fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}
