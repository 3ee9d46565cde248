/// Unified error types for the Fetchgate system.
use std::time::Duration;
use thiserror::Error;

/// Top-level error type for the Fetchgate system.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Probe error: {0}")]
    Probe(#[from] ProbeError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Range error: {0}")]
    Range(#[from] RangeError),

    #[error("Assembly error: {0}")]
    Assembly(#[from] AssemblyError),

    #[error("Deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while building the process configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Failures reported by the HTTP client before any status is known.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("I/O failure: {0}")]
    Io(String),

    #[error("Client error: {0}")]
    Other(String),
}

impl TransportError {
    /// Transport-level I/O failures are worth another attempt; builder and
    /// protocol misuse are not.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::Other(_))
    }
}

/// Errors returned by the content fetcher.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("Upstream responded with HTTP {0}")]
    UpstreamStatus(u16),

    #[error("Transient network error: {0}")]
    Transient(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Body exceeds the {limit} byte buffer limit")]
    BodyTooLarge { limit: usize },

    #[error("Invalid upstream URL: {0}")]
    InvalidUrl(String),
}

impl FetchError {
    /// Whether another attempt may succeed.
    ///
    /// 429, 503, 504 and every other 5xx are retryable, as is any
    /// transport-level I/O failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::UpstreamStatus(status) => {
                matches!(*status, 429 | 503 | 504) || (500..600).contains(status)
            }
            FetchError::Transient(_) => true,
            FetchError::Transport(e) => e.is_retryable(),
            FetchError::BodyTooLarge { .. } | FetchError::InvalidUrl(_) => false,
        }
    }
}

/// Errors from the upstream host prober.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("No upstream available ({attempted} probed, {redirects} redirected)")]
    NoUpstreamAvailable { attempted: usize, redirects: usize },

    #[error("Probing was cancelled")]
    Cancelled,
}

/// Errors from range serving of local files.
#[derive(Debug, Error)]
pub enum RangeError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Range not satisfiable for a {file_size} byte file")]
    NotSatisfiable { file_size: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from chunked upload ingestion and merge.
#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("Invalid transfer id: {0:?}")]
    InvalidTransferId(String),

    #[error("Invalid file name: {0:?}")]
    InvalidFilename(String),

    #[error("Chunk index {index} out of range for {total} chunks")]
    InvalidIndex { index: u32, total: u32 },

    #[error("Transfer declared {expected} chunks, request says {got}")]
    TotalMismatch { expected: u32, got: u32 },

    #[error("Missing chunk {0}")]
    MissingChunk(u32),

    #[error("Unknown transfer: {0}")]
    UnknownTransfer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_statuses() {
        for status in [429, 500, 502, 503, 504, 599] {
            assert!(FetchError::UpstreamStatus(status).is_retryable(), "{status}");
        }
        for status in [400, 401, 403, 404, 410, 418] {
            assert!(!FetchError::UpstreamStatus(status).is_retryable(), "{status}");
        }
    }

    #[test]
    fn test_transport_retryable() {
        assert!(FetchError::from(TransportError::Io("reset".into())).is_retryable());
        assert!(FetchError::from(TransportError::Timeout("slow".into())).is_retryable());
        assert!(!FetchError::from(TransportError::Other("bad header".into())).is_retryable());
        assert!(!FetchError::BodyTooLarge { limit: 1 }.is_retryable());
    }

    #[test]
    fn test_missing_chunk_names_index() {
        let err = AssemblyError::MissingChunk(7);
        assert_eq!(err.to_string(), "Missing chunk 7");
    }
}
