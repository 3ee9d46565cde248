/// Per-request composition of probing and fetching.
///
/// Stages run in order: probe the candidates, fetch from the winner, render
/// the reply. The first failing stage ends the request with its error.
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use fetchgate_downloader::{ContentFetcher, FetchResult, HostProber, HttpClient, RetryPolicy};
use fetchgate_shared::config::ProxyConfig;
use fetchgate_shared::errors::{ProbeError, ProxyError};
use fetchgate_shared::models::{content_type_for, FetchMode, FetchRequest, UpstreamCandidate};

const CACHE_CONTROL: &str = "max-age=3600, public";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Probing,
    Fetching,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Probing => write!(f, "probing"),
            Stage::Fetching => write!(f, "fetching"),
        }
    }
}

pub struct ProxyOrchestrator<C> {
    prober: HostProber<C>,
    fetcher: ContentFetcher<C>,
    candidates: Vec<UpstreamCandidate>,
    mode: FetchMode,
    deadline: Option<Duration>,
}

impl<C: HttpClient> ProxyOrchestrator<C> {
    pub fn new(client: Arc<C>, config: &ProxyConfig) -> Self {
        Self {
            prober: HostProber::new(client.clone()),
            fetcher: ContentFetcher::new(
                client,
                RetryPolicy::from(&config.retry),
                config.max_buffer_bytes,
            ),
            candidates: config.candidates.clone(),
            mode: config.fetch_mode,
            deadline: config.request_deadline,
        }
    }

    /// Resolve and fetch `path_and_query` from the first reachable upstream.
    ///
    /// The configured deadline bounds the whole run, retries included.
    /// Cancelling `cancel` stops the run at its next suspension point.
    pub async fn handle(&self, path_and_query: &str, cancel: &CancellationToken) -> Result<ProxyReply, ProxyError> {
        self.execute(path_and_query, false, cancel).await
    }

    /// Resolve `path_and_query` without fetching its body.
    pub async fn handle_head(&self, path_and_query: &str, cancel: &CancellationToken) -> Result<ProxyReply, ProxyError> {
        self.execute(path_and_query, true, cancel).await
    }

    async fn execute(
        &self,
        path_and_query: &str,
        head_only: bool,
        cancel: &CancellationToken,
    ) -> Result<ProxyReply, ProxyError> {
        let cancel = cancel.child_token();
        let run = self.run(path_and_query, head_only, &cancel);

        match self.deadline {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(reply) => reply,
                Err(_) => {
                    cancel.cancel();
                    warn!("Proxy {} exceeded its {:?} deadline", path_and_query, limit);
                    Err(ProxyError::DeadlineExceeded(limit))
                }
            },
            None => run.await,
        }
    }

    async fn run(&self, path_and_query: &str, head_only: bool, cancel: &CancellationToken) -> Result<ProxyReply, ProxyError> {
        debug!("Proxy {}: {}", path_and_query, Stage::Probing);
        let resolved = self
            .prober
            .probe(&self.candidates, path_and_query, cancel)
            .await
            .map_err(|e| failed(Stage::Probing, path_and_query, e.into()))?;

        if head_only {
            debug!("Proxy {}: located at {}", path_and_query, resolved);
            return Ok(ProxyReply::located(file_name_of(path_and_query)));
        }

        debug!("Proxy {}: {} {}", path_and_query, Stage::Fetching, resolved);
        let request = FetchRequest::new(resolved, self.mode);
        let fetched: Result<FetchResult, ProxyError> = tokio::select! {
            result = self.fetcher.fetch(&request) => result.map_err(ProxyError::from),
            _ = cancel.cancelled() => Err(ProbeError::Cancelled.into()),
        };
        let result = fetched.map_err(|e| failed(Stage::Fetching, path_and_query, e))?;

        Ok(ProxyReply::new(result, file_name_of(path_and_query)))
    }
}

fn failed(stage: Stage, path: &str, error: ProxyError) -> ProxyError {
    warn!("Proxy {} failed while {}: {}", path, stage, error);
    error
}

/// Last path segment, without the query, if it is non-empty.
fn file_name_of(path_and_query: &str) -> Option<String> {
    let path = path_and_query.split(['?', '#']).next().unwrap_or_default();
    path.rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
}

/// Successful proxy outcome, rendered into the outbound response.
#[derive(Debug)]
pub struct ProxyReply {
    payload: Payload,
    file_name: Option<String>,
}

#[derive(Debug)]
enum Payload {
    Fetched(FetchResult),
    /// Upstream found, body not requested.
    Located,
}

impl ProxyReply {
    pub fn new(result: FetchResult, file_name: Option<String>) -> Self {
        Self {
            payload: Payload::Fetched(result),
            file_name,
        }
    }

    pub fn located(file_name: Option<String>) -> Self {
        Self {
            payload: Payload::Located,
            file_name,
        }
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let content_type = match &self.payload {
            Payload::Fetched(result) => result.content_type().and_then(|ct| HeaderValue::from_str(ct).ok()),
            Payload::Located => self
                .file_name
                .as_deref()
                .map(|name| HeaderValue::from_static(content_type_for(name))),
        };
        headers.insert(
            header::CONTENT_TYPE,
            content_type.unwrap_or_else(|| HeaderValue::from_static("application/octet-stream")),
        );
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(CACHE_CONTROL));

        if let Some(name) = &self.file_name {
            let disposition = format!("inline; filename=\"{}\"", name.replace('"', "_"));
            if let Ok(value) = HeaderValue::from_str(&disposition) {
                headers.insert(header::CONTENT_DISPOSITION, value);
            }
        }
        headers
    }
}

impl IntoResponse for ProxyReply {
    fn into_response(self) -> Response {
        let mut headers = self.headers();
        // A buffered body has a known length; a streamed one goes out chunked.
        let body = match self.payload {
            Payload::Fetched(FetchResult::Buffered { body, .. }) => {
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
                Body::from(body)
            }
            Payload::Fetched(FetchResult::Streamed { body, .. }) => Body::from_stream(body),
            Payload::Located => Body::empty(),
        };
        (StatusCode::OK, headers, body).into_response()
    }
}
