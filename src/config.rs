//! Runtime configuration.
//!
//! ## Environment
//!
//! - `ARCHIVE_CHANNEL_ID`: channel selected at startup (optional)
//! - `ARCHIVE_BATCH_SIZE`: messages per page (default: 20)
//! - `FETCH_MAX_ATTEMPTS`: attempts per page request (default: 5)
//! - `FETCH_BASE_DELAY_MS`: first backoff delay (default: 500)
//! - `FETCH_MAX_DELAY_MS`: backoff cap (default: 30000)
//! - `FETCH_TIMEOUT_SECS`: timeout per client call (default: 30)
//! - `ARCHIVE_REPLAY_FILE`: JSONL export served by the in-memory client (optional)

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::sequencer::RetryPolicy;
use crate::types::ChannelId;

/// Error type for configuration loading.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A variable is set but does not parse.
    #[error("Invalid value for {var}: {value:?}")]
    InvalidValue {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
    },
    /// Values parse but are inconsistent.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Archive configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveConfig {
    /// Channel selected at startup.
    pub channel_id: Option<ChannelId>,
    /// Messages per page (default: 20).
    pub batch_size: usize,
    /// Attempts per page request (default: 5).
    pub max_attempts: u32,
    /// First backoff delay (default: 500ms).
    pub base_delay: Duration,
    /// Backoff cap (default: 30s).
    pub max_delay: Duration,
    /// Timeout per client call (default: 30s).
    pub request_timeout: Duration,
    /// JSONL export to seed the in-memory client from.
    pub replay_file: Option<PathBuf>,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            channel_id: None,
            batch_size: crate::DEFAULT_BATCH_SIZE,
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(30_000),
            request_timeout: Duration::from_secs(30),
            replay_file: None,
        }
    }
}

impl ArchiveConfig {
    /// Load configuration from environment variables with defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            channel_id: parse_var(&lookup, "ARCHIVE_CHANNEL_ID")?,
            batch_size: parse_var(&lookup, "ARCHIVE_BATCH_SIZE")?.unwrap_or(defaults.batch_size),
            max_attempts: parse_var(&lookup, "FETCH_MAX_ATTEMPTS")?.unwrap_or(defaults.max_attempts),
            base_delay: parse_var(&lookup, "FETCH_BASE_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
            max_delay: parse_var(&lookup, "FETCH_MAX_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
            request_timeout: parse_var(&lookup, "FETCH_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.request_timeout),
            replay_file: lookup("ARCHIVE_REPLAY_FILE")
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the sequencer cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch size must be at least 1".into()));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max attempts must be at least 1".into()));
        }
        if self.base_delay > self.max_delay {
            return Err(ConfigError::Invalid(format!(
                "base delay {}ms exceeds max delay {}ms",
                self.base_delay.as_millis(),
                self.max_delay.as_millis()
            )));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::Invalid("request timeout must be positive".into()));
        }
        Ok(())
    }

    /// Retry policy described by this configuration.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: self.base_delay,
            max_delay: self.max_delay,
        }
    }
}

fn parse_var<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { var, value: raw }),
    }
}
