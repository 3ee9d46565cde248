/// Byte-range serving of files under the uploads root.
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, Take};
use tokio_util::io::ReaderStream;
use tracing::debug;

use fetchgate_shared::errors::RangeError;
use fetchgate_shared::models::{content_type_for, FileMetadata, RangeSpec};

/// Parse a `Range` header against a file size.
///
/// `Ok(None)` means the whole file: the header is absent or does not have the
/// `bytes=<start>-[<end>]` shape. A header of that shape with non-numeric
/// tokens or bounds outside the file is unsatisfiable.
pub fn parse_range(header: Option<&str>, file_size: u64) -> Result<Option<RangeSpec>, RangeError> {
    let Some(spec) = header.and_then(|h| h.trim().strip_prefix("bytes=")) else {
        return Ok(None);
    };
    let Some((start, end)) = spec.split_once('-') else {
        return Ok(None);
    };

    let unsatisfiable = || RangeError::NotSatisfiable { file_size };
    let start: u64 = start.trim().parse().map_err(|_| unsatisfiable())?;
    let end: u64 = match end.trim() {
        "" => file_size.checked_sub(1).ok_or_else(unsatisfiable)?,
        end => end.parse().map_err(|_| unsatisfiable())?,
    };

    RangeSpec::new(start, end, file_size)
        .map(Some)
        .ok_or_else(unsatisfiable)
}

/// Serves files from a fixed root, honoring an optional byte range.
#[derive(Debug, Clone)]
pub struct RangeServer {
    root: PathBuf,
    block_size: usize,
}

impl RangeServer {
    /// `root` must exist; it is canonicalized once so containment checks
    /// compare like with like.
    pub fn new(root: impl AsRef<Path>, block_size: usize) -> std::io::Result<Self> {
        Ok(Self {
            root: std::fs::canonicalize(root)?,
            block_size: block_size.max(1),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `name` to a regular file inside the root.
    async fn resolve(&self, name: &str) -> Result<PathBuf, RangeError> {
        let not_found = || RangeError::NotFound(name.to_string());
        if name.is_empty() {
            return Err(not_found());
        }

        let resolved = tokio::fs::canonicalize(self.root.join(name))
            .await
            .map_err(|_| not_found())?;
        if !resolved.starts_with(&self.root) {
            debug!("Rejected path outside uploads root: {}", name);
            return Err(not_found());
        }

        let meta = tokio::fs::metadata(&resolved).await.map_err(|_| not_found())?;
        if !meta.is_file() {
            return Err(not_found());
        }
        Ok(resolved)
    }

    /// Open a file under the root, returning it with its current size.
    pub async fn open(&self, name: &str) -> Result<(File, u64), RangeError> {
        let path = self.resolve(name).await?;
        let file = File::open(&path).await?;
        let size = file.metadata().await?.len();
        Ok((file, size))
    }

    /// Serve `name`, whole or the span named by `range_header`.
    pub async fn serve(&self, name: &str, range_header: Option<&str>) -> Result<RangeReply, RangeError> {
        let (mut file, file_size) = self.open(name).await?;
        let range = parse_range(range_header, file_size)?;

        let (start, len) = match range {
            Some(r) => (r.start, r.len()),
            None => (0, file_size),
        };
        if start > 0 {
            file.seek(SeekFrom::Start(start)).await?;
        }
        debug!("Serving {} bytes {}+{} of {}", name, start, len, file_size);

        Ok(RangeReply {
            file_name: display_name(name),
            file_size,
            range,
            body: ReaderStream::with_capacity(file.take(len), self.block_size),
        })
    }

    pub async fn metadata(&self, name: &str) -> Result<FileMetadata, RangeError> {
        let path = self.resolve(name).await?;
        let meta = tokio::fs::metadata(&path).await?;
        let file_name = display_name(name);

        Ok(FileMetadata {
            content_type: content_type_for(&file_name).to_string(),
            size: meta.len(),
            last_modified: meta.modified().ok().map(DateTime::<Utc>::from),
            name: file_name,
        })
    }
}

fn display_name(name: &str) -> String {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("download")
        .to_string()
}

/// A whole-file (200) or partial (206) response.
pub struct RangeReply {
    pub file_name: String,
    pub file_size: u64,
    pub range: Option<RangeSpec>,
    body: ReaderStream<Take<File>>,
}

impl RangeReply {
    pub fn content_length(&self) -> u64 {
        self.range.map_or(self.file_size, |r| r.len())
    }
}

impl IntoResponse for RangeReply {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(content_type_for(&self.file_name)),
        );
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(self.content_length()));
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

        let disposition = format!("attachment; filename=\"{}\"", self.file_name.replace('"', "_"));
        if let Ok(value) = HeaderValue::from_str(&disposition) {
            headers.insert(header::CONTENT_DISPOSITION, value);
        }

        let status = match self.range {
            Some(range) => {
                if let Ok(value) = HeaderValue::from_str(&range.content_range()) {
                    headers.insert(header::CONTENT_RANGE, value);
                }
                StatusCode::PARTIAL_CONTENT
            }
            None => StatusCode::OK,
        };

        (status, headers, Body::from_stream(self.body)).into_response()
    }
}
