//! Configuration management for the agent.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Agent configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Status server host address
    pub host: String,
    /// Status server port
    pub port: u16,
    /// SQLite connection URL for the device-local store
    pub database_url: String,
    /// Base URL of the remote store; `None` runs against an in-memory remote
    pub remote_url: Option<String>,
    /// User whose recipes are synced
    pub owner_id: String,
    /// How often the scheduler wakes up
    pub sync_tick: Duration,
    /// A pass runs once the last successful sync is older than this
    pub stale_after: Duration,
    /// Per-call timeout for remote operations
    pub remote_timeout: Duration,
    /// Concurrent remote writes within one pass
    pub push_concurrency: usize,
    /// How often the retry worker polls the queue
    pub retry_poll: Duration,
    /// Consecutive failed passes before health is reported degraded
    pub failure_threshold: u32,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = parse_var("PORT", 4180)?;

        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://mise.db".to_string());

        let remote_url = env::var("REMOTE_URL").ok().filter(|s| !s.is_empty());

        let owner_id = env::var("OWNER_ID")
            .ok()
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::MissingOwner)?;

        let push_concurrency: usize = parse_var("PUSH_CONCURRENCY", 4)?;
        if push_concurrency == 0 {
            return Err(ConfigError::Invalid("PUSH_CONCURRENCY"));
        }

        Ok(Self {
            host,
            port,
            database_url,
            remote_url,
            owner_id,
            sync_tick: Duration::from_secs(parse_var("SYNC_TICK_SECS", 60)?),
            stale_after: Duration::from_secs(parse_var("SYNC_STALE_AFTER_SECS", 300)?),
            remote_timeout: Duration::from_secs(parse_var("REMOTE_TIMEOUT_SECS", 30)?),
            push_concurrency,
            retry_poll: Duration::from_secs(parse_var("RETRY_POLL_SECS", 30)?),
            failure_threshold: parse_var("FAILURE_THRESHOLD", 3)?,
        })
    }
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(name)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("OWNER_ID environment variable is required")]
    MissingOwner,

    #[error("Invalid {0} value")]
    Invalid(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    // Environment is process-global, so everything runs in one test.
    #[test]
    fn from_env_defaults_and_overrides() {
        env::remove_var("OWNER_ID");
        assert!(matches!(Config::from_env(), Err(ConfigError::MissingOwner)));

        env::set_var("OWNER_ID", "alice");
        env::set_var("PUSH_CONCURRENCY", "8");
        env::set_var("SYNC_TICK_SECS", "15");
        let config = Config::from_env().unwrap();
        assert_eq!(config.owner_id, "alice");
        assert_eq!(config.push_concurrency, 8);
        assert_eq!(config.sync_tick, Duration::from_secs(15));
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.remote_timeout, Duration::from_secs(30));

        env::set_var("PORT", "not-a-port");
        assert!(matches!(Config::from_env(), Err(ConfigError::Invalid("PORT"))));

        env::remove_var("PORT");
        env::set_var("PUSH_CONCURRENCY", "0");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid("PUSH_CONCURRENCY"))
        ));

        for var in ["OWNER_ID", "PUSH_CONCURRENCY", "SYNC_TICK_SECS"] {
            env::remove_var(var);
        }
    }
}
