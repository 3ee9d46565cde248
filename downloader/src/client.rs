/// HTTP client capability used by the prober and the fetcher.
///
/// The production implementation wraps reqwest; tests swap in
/// [`crate::testing::ScriptedClient`].
use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{BoxStream, StreamExt, TryStreamExt};
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::redirect::Policy;
use tracing::debug;

use fetchgate_shared::errors::TransportError;

/// Browser identity sent on every upstream GET.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Lazy, finite, non-restartable sequence of body chunks.
pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Status line, content metadata, and the unread body of an upstream response.
pub struct UpstreamResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

impl std::fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Outbound HTTP operations the proxy depends on.
pub trait HttpClient: Send + Sync + 'static {
    /// Existence check without a body. Redirects are never followed.
    fn head(&self, url: &str) -> impl Future<Output = Result<u16, TransportError>> + Send;

    /// Full request with the browser header profile applied.
    fn get(&self, url: &str) -> impl Future<Output = Result<UpstreamResponse, TransportError>> + Send;
}

/// Headers that make upstream fetches resemble a desktop browser.
///
/// `Accept-Encoding` is added by reqwest itself because it also decodes the
/// body; setting it by hand would disable decoding.
pub fn browser_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::ACCEPT,
        HeaderValue::from_static("image/webp,image/apng,image/*,*/*;q=0.8"),
    );
    headers.insert(
        header::ACCEPT_LANGUAGE,
        HeaderValue::from_static("zh-CN,zh;q=0.9,en;q=0.8"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers
}

/// reqwest-backed client with separate probe and fetch connection pools.
#[derive(Clone)]
pub struct ReqwestClient {
    probe: reqwest::Client,
    fetch: reqwest::Client,
}

impl ReqwestClient {
    pub fn new(probe_timeout: Duration) -> Result<Self, TransportError> {
        let probe = reqwest::Client::builder()
            .redirect(Policy::none())
            .timeout(probe_timeout)
            .connect_timeout(Duration::from_secs(10))
            .user_agent(BROWSER_USER_AGENT)
            .build()
            .map_err(map_error)?;

        let fetch = reqwest::Client::builder()
            .redirect(Policy::limited(10))
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(64)
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true)
            .user_agent(BROWSER_USER_AGENT)
            .default_headers(browser_headers())
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .build()
            .map_err(map_error)?;

        Ok(Self { probe, fetch })
    }
}

impl HttpClient for ReqwestClient {
    async fn head(&self, url: &str) -> Result<u16, TransportError> {
        let response = self.probe.head(url).send().await.map_err(map_error)?;
        Ok(response.status().as_u16())
    }

    async fn get(&self, url: &str) -> Result<UpstreamResponse, TransportError> {
        let response = self.fetch.get(url).send().await.map_err(map_error)?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let content_length = response.content_length();
        debug!("GET {} -> {} ({:?})", url, status, content_type);

        Ok(UpstreamResponse {
            status,
            content_type,
            content_length,
            body: response.bytes_stream().map_err(map_error).boxed(),
        })
    }
}

/// Classify a reqwest error into the transport taxonomy.
fn map_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(e.to_string())
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else if e.is_body() || e.is_decode() || e.is_request() {
        TransportError::Io(e.to_string())
    } else {
        TransportError::Other(e.to_string())
    }
}
