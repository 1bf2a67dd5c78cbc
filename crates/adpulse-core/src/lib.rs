pub mod admission;
pub mod blocking;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod event_log;
pub mod extract;
pub mod models;
pub mod monitor;
pub mod throttle;
pub mod traits;

#[cfg(test)]
pub(crate) mod testutil;

pub use blocking::{
    BlockingEvent, BlockingKind, BlockingStats, EventFilter, EventMetadata, RecommendedAction,
    Severity,
};
pub use config::CoordinatorConfig;
pub use coordinator::{CoordinatorBuilder, StatsCoordinator};
pub use error::AppError;
pub use event_log::EventLog;
pub use models::{ExtractedStats, PerformanceStats, StatsResult, SubjectKey};
pub use monitor::BlockingMonitor;
pub use throttle::ThrottleKnobs;
pub use traits::{
    BlockingClassifier, Classification, Clock, EventStore, Fetcher, NoClassification,
    NullEventStore, SystemClock,
};
