/// Data model shared across all Fetchgate crates.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::errors::ConfigError;

/// A configured upstream base URL that may host the requested resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamCandidate(String);

impl UpstreamCandidate {
    /// Validate a base URL: it must be absolute http(s) with a host.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let trimmed = raw.trim().trim_end_matches('/');
        let rest = trimmed
            .strip_prefix("http://")
            .or_else(|| trimmed.strip_prefix("https://"))
            .ok_or_else(|| ConfigError::Invalid {
                var: "PROXY_HOSTS",
                value: raw.to_string(),
                reason: "candidate must start with http:// or https://".to_string(),
            })?;

        if rest.is_empty() || rest.starts_with('/') {
            return Err(ConfigError::Invalid {
                var: "PROXY_HOSTS",
                value: raw.to_string(),
                reason: "candidate has no host".to_string(),
            });
        }

        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Append an inbound path (and query) with exactly one separating slash.
    pub fn join(&self, path_and_query: &str) -> String {
        let path = path_and_query.trim_start_matches('/');
        format!("{}/{}", self.0, path)
    }
}

impl std::fmt::Display for UpstreamCandidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of a single probe. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub candidate_url: String,
    pub reachable: bool,
    pub rejected_as_redirect: bool,
}

impl ProbeOutcome {
    /// Classify a probe response status.
    pub fn from_status(candidate_url: impl Into<String>, status: u16) -> Self {
        Self {
            candidate_url: candidate_url.into(),
            reachable: (200..300).contains(&status),
            rejected_as_redirect: (300..400).contains(&status),
        }
    }

    /// A probe that never produced a status (timeout, connection error).
    pub fn unreachable(candidate_url: impl Into<String>) -> Self {
        Self {
            candidate_url: candidate_url.into(),
            reachable: false,
            rejected_as_redirect: false,
        }
    }

    pub fn is_winner(&self) -> bool {
        self.reachable && !self.rejected_as_redirect
    }
}

/// How the upstream body is delivered to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMode {
    Buffered,
    Streamed,
}

impl std::fmt::Display for FetchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchMode::Buffered => write!(f, "buffered"),
            FetchMode::Streamed => write!(f, "streamed"),
        }
    }
}

/// One fetch per inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub resolved_url: String,
    pub mode: FetchMode,
}

impl FetchRequest {
    pub fn new(resolved_url: impl Into<String>, mode: FetchMode) -> Self {
        Self {
            resolved_url: resolved_url.into(),
            mode,
        }
    }
}

/// A validated, inclusive byte range: `start <= end < file_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSpec {
    pub start: u64,
    pub end: u64,
    pub file_size: u64,
}

impl RangeSpec {
    /// Build a range, rejecting anything outside the file.
    pub fn new(start: u64, end: u64, file_size: u64) -> Option<Self> {
        if start > end || end >= file_size {
            return None;
        }
        Some(Self { start, end, file_size })
    }

    /// The whole file. `None` for an empty file, which has no valid range.
    pub fn full(file_size: u64) -> Option<Self> {
        let end = file_size.checked_sub(1)?;
        Self::new(0, end, file_size)
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Value for the `Content-Range` header.
    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, self.file_size)
    }
}

/// In-progress state of a chunked upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSession {
    pub transfer_id: String,
    pub original_filename: Option<String>,
    pub total_chunks: u32,
    pub received_indices: BTreeSet<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransferSession {
    pub fn new(transfer_id: impl Into<String>, total_chunks: u32, original_filename: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            transfer_id: transfer_id.into(),
            original_filename,
            total_chunks,
            received_indices: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// True when every index in `0..total_chunks` has been received.
    pub fn is_complete(&self) -> bool {
        self.received_indices.len() == self.total_chunks as usize
            && self.received_indices.iter().all(|i| *i < self.total_chunks)
    }

    /// Indices not yet received, ascending.
    pub fn missing(&self) -> Vec<u32> {
        (0..self.total_chunks)
            .filter(|i| !self.received_indices.contains(i))
            .collect()
    }

    pub fn status(&self) -> TransferStatus {
        TransferStatus {
            transfer_id: self.transfer_id.clone(),
            filename: self.original_filename.clone(),
            total: self.total_chunks,
            received: self.received_indices.iter().copied().collect(),
            missing: self.missing(),
            complete: self.is_complete(),
        }
    }
}

/// Snapshot of a transfer returned by the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStatus {
    pub transfer_id: String,
    pub filename: Option<String>,
    pub total: u32,
    pub received: Vec<u32>,
    pub missing: Vec<u32>,
    pub complete: bool,
}

/// A merged artifact stored flat in the uploads root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedArtifact {
    pub stored_name: String,
    pub size: u64,
}

/// A file stored by the direct upload route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredUpload {
    pub original_name: String,
    pub stored_name: String,
    pub size: u64,
}

/// Metadata for a file under the uploads root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub content_type: String,
}

/// Guess a MIME type from a file name's extension.
pub fn content_type_for(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "mp4" | "m4v" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mp3" => "audio/mpeg",
        "m4a" | "aac" => "audio/mp4",
        "opus" | "ogg" => "audio/ogg",
        "flac" => "audio/flac",
        "wav" => "audio/wav",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "json" => "application/json",
        "txt" | "log" => "text/plain; charset=utf-8",
        "html" | "htm" => "text/html; charset=utf-8",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_join_single_slash() {
        let c = UpstreamCandidate::parse("http://mirror-a:11250/").unwrap();
        assert_eq!(c.join("/img/cat.jpg"), "http://mirror-a:11250/img/cat.jpg");
        assert_eq!(c.join("img/cat.jpg?w=10"), "http://mirror-a:11250/img/cat.jpg?w=10");
    }

    #[test]
    fn test_candidate_rejects_relative() {
        assert!(UpstreamCandidate::parse("mirror-a:11250").is_err());
        assert!(UpstreamCandidate::parse("http://").is_err());
        assert!(UpstreamCandidate::parse("ftp://mirror").is_err());
    }

    #[test]
    fn test_probe_outcome_classification() {
        assert!(ProbeOutcome::from_status("u", 200).is_winner());
        assert!(ProbeOutcome::from_status("u", 204).is_winner());

        let redirect = ProbeOutcome::from_status("u", 302);
        assert!(!redirect.is_winner());
        assert!(redirect.rejected_as_redirect);

        assert!(!ProbeOutcome::from_status("u", 404).is_winner());
        assert!(!ProbeOutcome::unreachable("u").is_winner());
    }

    #[test]
    fn test_range_spec_bounds() {
        let r = RangeSpec::new(0, 1023, 2048).unwrap();
        assert_eq!(r.len(), 1024);
        assert_eq!(r.content_range(), "bytes 0-1023/2048");

        assert!(RangeSpec::new(2000, 3000, 2048).is_none());
        assert!(RangeSpec::new(10, 9, 2048).is_none());
        assert!(RangeSpec::full(0).is_none());
        assert_eq!(RangeSpec::full(5).unwrap().content_range(), "bytes 0-4/5");
    }

    #[test]
    fn test_session_missing_and_complete() {
        let mut s = TransferSession::new("abc", 3, Some("big.zip".into()));
        s.received_indices.insert(2);
        s.received_indices.insert(0);
        assert_eq!(s.missing(), vec![1]);
        assert!(!s.is_complete());

        s.received_indices.insert(1);
        assert!(s.is_complete());
        assert!(s.status().missing.is_empty());
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("cat.JPG"), "image/jpeg");
        assert_eq!(content_type_for("song.mp3"), "audio/mpeg");
        assert_eq!(content_type_for("noext"), "application/octet-stream");
    }

    #[test]
    fn test_fetch_mode_serde() {
        assert_eq!(serde_json::to_string(&FetchMode::Streamed).unwrap(), "\"streamed\"");
        assert_eq!(FetchMode::Buffered.to_string(), "buffered");
    }
}
