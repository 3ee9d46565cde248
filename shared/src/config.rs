/// Process configuration, read once from the environment at startup.
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::errors::ConfigError;
use crate::models::{FetchMode, UpstreamCandidate};

/// Retry settings for upstream fetches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySettings {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
        }
    }
}

/// Immutable configuration shared by every request handler.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub candidates: Vec<UpstreamCandidate>,
    pub fetch_mode: FetchMode,
    pub host: String,
    pub port: u16,
    pub upload_dir: PathBuf,
    pub max_buffer_bytes: usize,
    pub max_chunk_bytes: usize,
    pub probe_timeout: Duration,
    /// Deadline for a whole proxy orchestration. `None` disables it.
    pub request_deadline: Option<Duration>,
    pub retry: RetrySettings,
    pub range_block_size: usize,
    pub transfer_ttl: Duration,
    pub cleanup_interval: Duration,
}

impl ProxyConfig {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let hosts = lookup("PROXY_HOSTS").ok_or(ConfigError::Missing("PROXY_HOSTS"))?;
        let candidates = hosts
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(UpstreamCandidate::parse)
            .collect::<Result<Vec<_>, _>>()?;
        if candidates.is_empty() {
            return Err(ConfigError::Missing("PROXY_HOSTS"));
        }

        let fetch_mode = match lookup("STREAM_FLAG").as_deref().map(str::trim) {
            Some("true") => FetchMode::Streamed,
            Some("false") | Some("") | None => FetchMode::Buffered,
            Some(other) => {
                warn!("Ignoring STREAM_FLAG={:?} (expected true or false)", other);
                FetchMode::Buffered
            }
        };

        let retry = RetrySettings {
            max_attempts: parse_or(&lookup, "FETCH_MAX_ATTEMPTS", 3u32)?.max(1),
            initial_backoff: Duration::from_millis(parse_or(&lookup, "FETCH_INITIAL_BACKOFF_MS", 1_000u64)?),
            max_backoff: Duration::from_millis(parse_or(&lookup, "FETCH_MAX_BACKOFF_MS", 10_000u64)?),
        };

        let deadline_secs: u64 = parse_or(&lookup, "PROXY_DEADLINE_SECS", 60)?;
        let block_size: usize = parse_or(&lookup, "RANGE_BLOCK_SIZE", 8192)?;
        if block_size == 0 {
            return Err(ConfigError::Invalid {
                var: "RANGE_BLOCK_SIZE",
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }

        Ok(Self {
            candidates,
            fetch_mode,
            host: lookup("SERVER_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_or(&lookup, "SERVER_PORT", 8080)?,
            upload_dir: PathBuf::from(lookup("UPLOAD_DIR").unwrap_or_else(|| "./uploads".to_string())),
            max_buffer_bytes: parse_or(&lookup, "MAX_BUFFER_BYTES", 50 * 1024 * 1024)?,
            max_chunk_bytes: parse_or(&lookup, "MAX_CHUNK_BYTES", 16 * 1024 * 1024)?,
            probe_timeout: Duration::from_secs(parse_or(&lookup, "PROBE_TIMEOUT_SECS", 5)?),
            request_deadline: (deadline_secs > 0).then(|| Duration::from_secs(deadline_secs)),
            retry,
            range_block_size: block_size,
            transfer_ttl: Duration::from_secs(parse_or(&lookup, "TRANSFER_TTL_SECS", 86_400)?),
            cleanup_interval: Duration::from_secs(parse_or(&lookup, "TRANSFER_CLEANUP_INTERVAL_SECS", 600)?),
        })
    }

    /// `host:port` to bind the listener on.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Parse an optional variable, falling back to `default` when unset or blank.
fn parse_or<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        Some(value) if !value.trim().is_empty() => match value.trim().parse::<T>() {
            Ok(parsed) => Ok(parsed),
            Err(e) => Err(ConfigError::Invalid {
                var,
                reason: e.to_string(),
                value,
            }),
        },
        _ => Ok(default),
    }
}
