use std::str::FromStr;
use std::time::Duration;

use chrono::TimeDelta;
use url::Url;

use crate::cache::DEFAULT_CACHE_TTL;
use crate::error::AppError;
use crate::event_log::DEFAULT_RING_CAPACITY;
use crate::models::SubjectKey;
use crate::monitor::{DEFAULT_WINDOW_HOURS, MAX_WINDOW_HOURS};

pub const DEFAULT_BASE_URL: &str = "https://www.facebook.com/ads/library/";
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(200);

/// Tunables for the stats coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Ad library page the per-subject query string is appended to.
    pub base_url: String,
    pub cache_ttl: TimeDelta,
    /// Hard limit on a single fetch.
    pub fetch_timeout: Duration,
    /// How long the first queued request waits for its batch to fill.
    pub flush_interval: Duration,
    /// In-memory blocking event capacity.
    pub event_capacity: usize,
    /// Window used to derive severity for admission decisions.
    pub window_hours: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            cache_ttl: DEFAULT_CACHE_TTL,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            event_capacity: DEFAULT_RING_CAPACITY,
            window_hours: DEFAULT_WINDOW_HOURS,
        }
    }
}

impl CoordinatorConfig {
    /// Read configuration from environment variables, falling back to
    /// defaults for anything unset.
    ///
    /// - `ADPULSE_BASE_URL`
    /// - `ADPULSE_CACHE_TTL_SECS`
    /// - `ADPULSE_FETCH_TIMEOUT_SECS`
    /// - `ADPULSE_FLUSH_INTERVAL_MS`
    /// - `ADPULSE_EVENT_CAPACITY`
    /// - `ADPULSE_WINDOW_HOURS`
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let defaults = Self::default();

        let base_url = lookup("ADPULSE_BASE_URL").unwrap_or(defaults.base_url);
        Url::parse(&base_url).map_err(|e| {
            AppError::ConfigError(format!("Invalid ADPULSE_BASE_URL '{base_url}': {e}"))
        })?;

        let cache_ttl = match positive::<i64>(&lookup, "ADPULSE_CACHE_TTL_SECS")? {
            Some(secs) => TimeDelta::try_seconds(secs).ok_or_else(|| {
                AppError::ConfigError(format!("ADPULSE_CACHE_TTL_SECS {secs} is out of range"))
            })?,
            None => defaults.cache_ttl,
        };
        let fetch_timeout = positive::<u64>(&lookup, "ADPULSE_FETCH_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.fetch_timeout);
        let flush_interval = positive::<u64>(&lookup, "ADPULSE_FLUSH_INTERVAL_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.flush_interval);
        let event_capacity =
            positive::<usize>(&lookup, "ADPULSE_EVENT_CAPACITY")?.unwrap_or(defaults.event_capacity);
        let window_hours =
            positive::<u32>(&lookup, "ADPULSE_WINDOW_HOURS")?.unwrap_or(defaults.window_hours);
        if window_hours > MAX_WINDOW_HOURS {
            return Err(AppError::ConfigError(format!(
                "ADPULSE_WINDOW_HOURS must be at most {MAX_WINDOW_HOURS}"
            )));
        }

        Ok(Self {
            base_url,
            cache_ttl,
            fetch_timeout,
            flush_interval,
            event_capacity,
            window_hours,
        })
    }

    /// Ad library URL listing the active ads of one page in one country.
    pub fn target_url(&self, key: &SubjectKey) -> Result<String, AppError> {
        let url = Url::parse_with_params(
            &self.base_url,
            &[
                ("active_status", "active"),
                ("ad_type", "all"),
                ("country", key.region.as_str()),
                ("view_all_page_id", key.subject_id.as_str()),
                ("search_type", "page"),
                ("media_type", "all"),
            ],
        )
        .map_err(|e| AppError::HttpError(format!("Invalid URL: {e}")))?;
        Ok(url.into())
    }
}

fn positive<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>, AppError>
where
    T: FromStr + PartialOrd + Default,
{
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    let parsed: T = raw.trim().parse().map_err(|_| {
        AppError::ConfigError(format!("Invalid {name} '{raw}': must be a positive integer"))
    })?;
    if parsed <= T::default() {
        return Err(AppError::ConfigError(format!("{name} must be at least 1")));
    }
    Ok(Some(parsed))
}
