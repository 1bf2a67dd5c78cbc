use std::time::Duration;

use adpulse_core::AppError;

const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Admission waits on severity lookups, which fall back to memory only
/// after this elapses.
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(3);

/// Configuration for the database connection pool.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    /// How long a query waits for a pooled connection.
    pub acquire_timeout: Duration,
}

impl DatabaseConfig {
    /// Read configuration from environment variables.
    ///
    /// - `DATABASE_URL` (required)
    /// - `DATABASE_MAX_CONNECTIONS` (optional, defaults to 5)
    /// - `DATABASE_ACQUIRE_TIMEOUT_SECS` (optional, defaults to 3)
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|name| std::env::var(name).ok())?.ok_or_else(|| {
            AppError::ConfigError("DATABASE_URL not set. Required for database operations.".into())
        })
    }

    /// Like [`from_env`](Self::from_env), but `None` when `DATABASE_URL` is
    /// unset so callers can run without a durable store.
    pub fn from_env_if_set() -> Result<Option<Self>, AppError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Option<Self>, AppError> {
        let Some(url) = lookup("DATABASE_URL").filter(|u| !u.trim().is_empty()) else {
            return Ok(None);
        };

        let max_connections = positive(&lookup, "DATABASE_MAX_CONNECTIONS")?
            .unwrap_or(DEFAULT_MAX_CONNECTIONS);
        let acquire_timeout = positive(&lookup, "DATABASE_ACQUIRE_TIMEOUT_SECS")?
            .map_or(DEFAULT_ACQUIRE_TIMEOUT, |secs| Duration::from_secs(u64::from(secs)));

        Ok(Some(Self {
            url,
            max_connections,
            acquire_timeout,
        }))
    }
}

fn positive(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<u32>, AppError> {
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    let parsed: u32 = raw.trim().parse().map_err(|_| {
        AppError::ConfigError(format!("Invalid {name} '{raw}': must be a positive integer"))
    })?;
    if parsed == 0 {
        return Err(AppError::ConfigError(format!("{name} must be at least 1")));
    }
    Ok(Some(parsed))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| {
            pairs
                .iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn missing_url_means_no_database() {
        assert!(DatabaseConfig::from_lookup(lookup(&[])).unwrap().is_none());
        assert!(
            DatabaseConfig::from_lookup(lookup(&[("DATABASE_URL", " ")]))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn max_connections_defaults_to_five() {
        let config = DatabaseConfig::from_lookup(lookup(&[("DATABASE_URL", "postgres://localhost/adpulse")]))
            .unwrap()
            .unwrap();
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.acquire_timeout, Duration::from_secs(3));
    }

    #[test]
    fn acquire_timeout_is_configurable() {
        let config = DatabaseConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/adpulse"),
            ("DATABASE_ACQUIRE_TIMEOUT_SECS", "1"),
        ]))
        .unwrap()
        .unwrap();
        assert_eq!(config.acquire_timeout, Duration::from_secs(1));

        let err = DatabaseConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/adpulse"),
            ("DATABASE_ACQUIRE_TIMEOUT_SECS", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }

    #[test]
    fn zero_connections_is_rejected() {
        let err = DatabaseConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/adpulse"),
            ("DATABASE_MAX_CONNECTIONS", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }
}
