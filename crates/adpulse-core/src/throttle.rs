//! Severity-driven throttle knobs.
//!
//! Maps the current blocking severity to the three operational knobs the
//! coordinator uses: a base delay callers should wait between rounds, the
//! batch size at which the pending queue flushes, and the concurrency
//! ceiling for in-flight fetches.
//!
//! | severity | base delay | batch size | concurrency |
//! |----------|-----------:|-----------:|------------:|
//! | low      |         2s |         50 |          10 |
//! | medium   |        10s |         25 |           5 |
//! | high     |        60s |         10 |           2 |
//! | critical |       300s |          5 |           1 |
//!
//! # Example
//!
//! ```rust
//! use adpulse_core::blocking::Severity;
//! use adpulse_core::throttle::ThrottleKnobs;
//!
//! let knobs = ThrottleKnobs::for_severity(Severity::High);
//! assert_eq!(knobs.batch_size, 10);
//! let wait = knobs.jittered_delay();
//! assert!(wait >= knobs.base_delay);
//! ```

use std::time::Duration;

use rand::Rng;
use serde::Serialize;

use crate::blocking::Severity;

/// Operational knobs for one severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ThrottleKnobs {
    pub severity: Severity,
    /// Delay before jitter.
    #[serde(serialize_with = "serialize_secs")]
    pub base_delay: Duration,
    pub batch_size: usize,
    pub concurrency: usize,
}

impl ThrottleKnobs {
    /// Pure mapping from severity to knobs.
    pub const fn for_severity(severity: Severity) -> Self {
        let (secs, batch_size, concurrency) = match severity {
            Severity::Low => (2, 50, 10),
            Severity::Medium => (10, 25, 5),
            Severity::High => (60, 10, 2),
            Severity::Critical => (300, 5, 1),
        };
        Self {
            severity,
            base_delay: Duration::from_secs(secs),
            batch_size,
            concurrency,
        }
    }

    /// Base delay plus uniform jitter in `[0, base/2)`.
    ///
    /// Keeps concurrent callers from retrying in lockstep.
    pub fn jittered_delay(&self) -> Duration {
        let max_jitter_ms = (self.base_delay.as_millis() / 2) as u64;
        if max_jitter_ms == 0 {
            return self.base_delay;
        }
        let jitter_ms = rand::rng().random_range(0..max_jitter_ms);
        self.base_delay + Duration::from_millis(jitter_ms)
    }
}

impl Default for ThrottleKnobs {
    fn default() -> Self {
        Self::for_severity(Severity::Low)
    }
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_secs())
}
