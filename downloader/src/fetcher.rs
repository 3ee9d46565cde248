/// Upstream content retrieval in buffered or streamed mode.
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, StreamExt};
use tracing::{error, info};

use fetchgate_shared::errors::FetchError;
use fetchgate_shared::models::{FetchMode, FetchRequest};

use crate::client::{ByteStream, HttpClient, UpstreamResponse};
use crate::retry::RetryPolicy;

/// Body retrieved from the upstream, plus the content type it reported.
pub enum FetchResult {
    /// Whole body in memory.
    Buffered {
        body: Bytes,
        content_type: Option<String>,
    },
    /// Body delivered chunk by chunk as it arrives. Can be consumed once.
    Streamed {
        body: ByteStream,
        content_type: Option<String>,
    },
}

impl FetchResult {
    pub fn content_type(&self) -> Option<&str> {
        match self {
            FetchResult::Buffered { content_type, .. } | FetchResult::Streamed { content_type, .. } => {
                content_type.as_deref()
            }
        }
    }
}

impl std::fmt::Debug for FetchResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchResult::Buffered { body, content_type } => f
                .debug_struct("Buffered")
                .field("len", &body.len())
                .field("content_type", content_type)
                .finish(),
            FetchResult::Streamed { content_type, .. } => f
                .debug_struct("Streamed")
                .field("content_type", content_type)
                .finish_non_exhaustive(),
        }
    }
}

/// Reject anything that is not an absolute http(s) URL with a host.
pub fn validate_url(raw: &str) -> Result<reqwest::Url, FetchError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(FetchError::InvalidUrl("empty URL".to_string()));
    }
    let url = reqwest::Url::parse(trimmed).map_err(|e| FetchError::InvalidUrl(format!("{trimmed}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(FetchError::InvalidUrl(format!("{trimmed}: not an http(s) URL")));
    }
    Ok(url)
}

/// Retrieves resolved upstream URLs, retrying transient failures.
pub struct ContentFetcher<C> {
    client: Arc<C>,
    policy: RetryPolicy,
    max_buffer_bytes: usize,
}

impl<C: HttpClient> ContentFetcher<C> {
    pub fn new(client: Arc<C>, policy: RetryPolicy, max_buffer_bytes: usize) -> Self {
        Self {
            client,
            policy,
            max_buffer_bytes,
        }
    }

    /// Fetch `request.resolved_url` in the requested mode.
    ///
    /// The retry policy applies to both modes. In streamed mode it covers the
    /// request, the status check, and the first body chunk; after that the
    /// stream belongs to the caller and a failure ends it with an error.
    pub async fn fetch(&self, request: &FetchRequest) -> Result<FetchResult, FetchError> {
        let url = validate_url(&request.resolved_url)?.to_string();
        let url = url.as_str();
        info!("Fetching {} ({})", url, request.mode);

        let result = match request.mode {
            FetchMode::Buffered => self.policy.run(url, |_| self.fetch_buffered(url)).await,
            FetchMode::Streamed => self.policy.run(url, |_| self.open_stream(url)).await,
        };

        match &result {
            Ok(FetchResult::Buffered { body, .. }) => info!("Fetched {} ({} bytes)", url, body.len()),
            Ok(FetchResult::Streamed { .. }) => info!("Streaming {}", url),
            Err(e) => error!("Fetch of {} failed: {}", url, e),
        }
        result
    }

    /// Send the request and turn error statuses into errors before any body
    /// is read.
    async fn start(&self, url: &str) -> Result<UpstreamResponse, FetchError> {
        let response = self.client.get(url).await?;
        if response.status >= 400 {
            return Err(FetchError::UpstreamStatus(response.status));
        }
        Ok(response)
    }

    async fn fetch_buffered(&self, url: &str) -> Result<FetchResult, FetchError> {
        let limit = self.max_buffer_bytes;
        let mut response = self.start(url).await?;
        if response.content_length.is_some_and(|len| len > limit as u64) {
            return Err(FetchError::BodyTooLarge { limit });
        }

        let mut buf = BytesMut::with_capacity(
            response.content_length.map_or(0, |len| len as usize),
        );
        while let Some(chunk) = response.body.next().await {
            let chunk = chunk?;
            if buf.len() + chunk.len() > limit {
                return Err(FetchError::BodyTooLarge { limit });
            }
            buf.extend_from_slice(&chunk);
        }

        Ok(FetchResult::Buffered {
            body: buf.freeze(),
            content_type: response.content_type,
        })
    }

    async fn open_stream(&self, url: &str) -> Result<FetchResult, FetchError> {
        let mut response = self.start(url).await?;
        let first = response.body.next().await.transpose()?;
        let body = stream::iter(first.map(Ok)).chain(response.body).boxed();

        Ok(FetchResult::Streamed {
            body,
            content_type: response.content_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FetchReply, ScriptedClient};
    use futures_util::TryStreamExt;
    use std::time::Duration;
    use tokio::time::Instant;

    const URL: &str = "http://mirror-a:11250/img/cat.jpg";

    fn fetcher(client: ScriptedClient, limit: usize) -> (Arc<ScriptedClient>, ContentFetcher<ScriptedClient>) {
        let client = Arc::new(client);
        let fetcher = ContentFetcher::new(client.clone(), RetryPolicy::default(), limit);
        (client, fetcher)
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffered_retries_503_then_succeeds() {
        let client = ScriptedClient::new()
            .with_fetch(URL, FetchReply::Status(503))
            .with_fetch(URL, FetchReply::Status(503))
            .with_fetch(URL, FetchReply::body("image/jpeg", &[b"jpeg", b"data"]));
        let (client, fetcher) = fetcher(client, 1024);
        let started = Instant::now();

        let result = fetcher.fetch(&FetchRequest::new(URL, FetchMode::Buffered)).await.unwrap();

        assert_eq!(client.get_calls(URL), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        assert_eq!(result.content_type(), Some("image/jpeg"));
        match result {
            FetchResult::Buffered { body, .. } => assert_eq!(&body[..], b"jpegdata"),
            other => panic!("expected buffered, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffered_503_exhausts_after_three_attempts() {
        let client = ScriptedClient::new().with_fetch(URL, FetchReply::Status(503));
        let (client, fetcher) = fetcher(client, 1024);
        let started = Instant::now();

        let err = fetcher.fetch(&FetchRequest::new(URL, FetchMode::Buffered)).await.unwrap_err();

        assert!(matches!(err, FetchError::UpstreamStatus(503)));
        assert_eq!(client.get_calls(URL), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_404_is_not_retried() {
        let client = ScriptedClient::new().with_fetch(URL, FetchReply::Status(404));
        let (client, fetcher) = fetcher(client, 1024);

        let err = fetcher.fetch(&FetchRequest::new(URL, FetchMode::Streamed)).await.unwrap_err();

        assert!(matches!(err, FetchError::UpstreamStatus(404)));
        assert_eq!(client.get_calls(URL), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_is_retried() {
        let client = ScriptedClient::new()
            .with_fetch(URL, FetchReply::TransportFailure)
            .with_fetch(URL, FetchReply::body("text/plain", &[b"ok"]));
        let (client, fetcher) = fetcher(client, 1024);

        let result = fetcher.fetch(&FetchRequest::new(URL, FetchMode::Buffered)).await.unwrap();
        assert_eq!(client.get_calls(URL), 2);
        assert!(matches!(result, FetchResult::Buffered { .. }));
    }

    #[tokio::test]
    async fn test_buffered_rejects_oversized_body() {
        let client = ScriptedClient::new().with_fetch(URL, FetchReply::body("application/zip", &[b"12345", b"67890"]));
        let (client, fetcher) = fetcher(client, 8);

        let err = fetcher.fetch(&FetchRequest::new(URL, FetchMode::Buffered)).await.unwrap_err();
        assert!(matches!(err, FetchError::BodyTooLarge { limit: 8 }));
        assert_eq!(client.get_calls(URL), 1);
    }

    #[tokio::test]
    async fn test_streamed_yields_chunks_lazily() {
        let client = ScriptedClient::new().with_fetch(URL, FetchReply::body("video/mp4", &[b"aa", b"bb", b"cc"]));
        // The buffer limit does not apply to streamed bodies.
        let (_, fetcher) = fetcher(client, 1);

        let result = fetcher.fetch(&FetchRequest::new(URL, FetchMode::Streamed)).await.unwrap();
        assert_eq!(result.content_type(), Some("video/mp4"));

        let FetchResult::Streamed { body, .. } = result else {
            panic!("expected streamed");
        };
        let chunks: Vec<Bytes> = body.try_collect().await.unwrap();
        assert_eq!(chunks, vec![Bytes::from_static(b"aa"), Bytes::from_static(b"bb"), Bytes::from_static(b"cc")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_streamed_retries_failure_before_first_chunk() {
        let client = ScriptedClient::new()
            .with_fetch(URL, FetchReply::Broken { chunks: Vec::new() })
            .with_fetch(URL, FetchReply::body("image/png", &[b"png"]));
        let (client, fetcher) = fetcher(client, 1024);

        let result = fetcher.fetch(&FetchRequest::new(URL, FetchMode::Streamed)).await.unwrap();
        assert_eq!(client.get_calls(URL), 2);
        let FetchResult::Streamed { body, .. } = result else {
            panic!("expected streamed");
        };
        let chunks: Vec<Bytes> = body.try_collect().await.unwrap();
        assert_eq!(chunks.concat(), b"png");
    }

    #[tokio::test]
    async fn test_streamed_failure_after_first_chunk_surfaces_in_stream() {
        let client = ScriptedClient::new().with_fetch(URL, FetchReply::broken(&[b"partial"]));
        let (client, fetcher) = fetcher(client, 1024);

        let result = fetcher.fetch(&FetchRequest::new(URL, FetchMode::Streamed)).await.unwrap();
        let FetchResult::Streamed { mut body, .. } = result else {
            panic!("expected streamed");
        };
        assert_eq!(body.next().await.unwrap().unwrap(), Bytes::from_static(b"partial"));
        assert!(body.next().await.unwrap().is_err());
        assert_eq!(client.get_calls(URL), 1);
    }

    #[tokio::test]
    async fn test_invalid_url_rejected_before_request() {
        let (client, fetcher) = fetcher(ScriptedClient::new(), 1024);
        let err = fetcher
            .fetch(&FetchRequest::new("/relative/path", FetchMode::Buffered))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl(_)));
        assert_eq!(client.get_calls("/relative/path"), 0);
    }

    #[test]
    fn test_validate_url() {
        assert!(validate_url("https://example.com/a.png").is_ok());
        assert!(validate_url("  ").is_err());
        assert!(validate_url("ftp://example.com/a").is_err());
        assert!(validate_url("example.com/a").is_err());
    }
}
