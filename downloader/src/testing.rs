/// Scripted in-memory [`HttpClient`] for tests.
///
/// Probes and fetches are keyed by the exact URL requested. Unscripted URLs
/// fail with a connect error.
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{self, StreamExt};

use fetchgate_shared::errors::TransportError;

use crate::client::{HttpClient, UpstreamResponse};

/// Result of a scripted HEAD request.
#[derive(Debug, Clone, Copy)]
pub enum ProbeReply {
    Status(u16),
    Fail,
}

/// Result of a scripted GET request.
#[derive(Debug, Clone)]
pub enum FetchReply {
    /// Response with this status and an empty body.
    Status(u16),
    /// 200 response with a body split into the given chunks.
    Body {
        content_type: Option<String>,
        chunks: Vec<Bytes>,
    },
    /// 200 response whose body fails after yielding `chunks`.
    Broken { chunks: Vec<Bytes> },
    /// The request never gets a response.
    TransportFailure,
}

impl FetchReply {
    pub fn body<B: AsRef<[u8]>>(content_type: &str, chunks: &[B]) -> Self {
        FetchReply::Body {
            content_type: Some(content_type.to_string()),
            chunks: to_bytes(chunks),
        }
    }

    pub fn broken<B: AsRef<[u8]>>(chunks: &[B]) -> Self {
        FetchReply::Broken {
            chunks: to_bytes(chunks),
        }
    }
}

fn to_bytes<B: AsRef<[u8]>>(chunks: &[B]) -> Vec<Bytes> {
    chunks
        .iter()
        .map(|c| Bytes::copy_from_slice(c.as_ref()))
        .collect()
}

#[derive(Default)]
struct Calls {
    head: HashMap<String, usize>,
    head_completed: HashMap<String, usize>,
    get: HashMap<String, usize>,
}

#[derive(Default)]
pub struct ScriptedClient {
    probes: HashMap<String, (Duration, ProbeReply)>,
    fetches: Mutex<HashMap<String, VecDeque<FetchReply>>>,
    calls: Mutex<Calls>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer HEAD on `url` with `reply` after `delay`.
    pub fn with_probe(mut self, url: &str, delay: Duration, reply: ProbeReply) -> Self {
        self.probes.insert(url.to_string(), (delay, reply));
        self
    }

    /// Queue a GET reply for `url`. Replies are consumed in order and the
    /// last one repeats.
    pub fn with_fetch(self, url: &str, reply: FetchReply) -> Self {
        self.fetches
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    /// HEAD requests started for `url`.
    pub fn head_calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().head.get(url).copied().unwrap_or(0)
    }

    /// HEAD requests for `url` that ran to completion without being dropped.
    pub fn head_completions(&self, url: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .head_completed
            .get(url)
            .copied()
            .unwrap_or(0)
    }

    pub fn get_calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get.get(url).copied().unwrap_or(0)
    }

    fn next_fetch(&self, url: &str) -> Option<FetchReply> {
        let mut fetches = self.fetches.lock().unwrap();
        let queue = fetches.get_mut(url)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

fn unscripted(url: &str) -> TransportError {
    TransportError::Connect(format!("no route to {url}"))
}

impl HttpClient for ScriptedClient {
    async fn head(&self, url: &str) -> Result<u16, TransportError> {
        *self.calls.lock().unwrap().head.entry(url.to_string()).or_default() += 1;
        let (delay, reply) = *self.probes.get(url).ok_or_else(|| unscripted(url))?;

        tokio::time::sleep(delay).await;
        *self
            .calls
            .lock()
            .unwrap()
            .head_completed
            .entry(url.to_string())
            .or_default() += 1;

        match reply {
            ProbeReply::Status(status) => Ok(status),
            ProbeReply::Fail => Err(TransportError::Timeout(format!("probe of {url} timed out"))),
        }
    }

    async fn get(&self, url: &str) -> Result<UpstreamResponse, TransportError> {
        *self.calls.lock().unwrap().get.entry(url.to_string()).or_default() += 1;
        let reply = self.next_fetch(url).ok_or_else(|| unscripted(url))?;

        let response = match reply {
            FetchReply::Status(status) => UpstreamResponse {
                status,
                content_type: None,
                content_length: Some(0),
                body: stream::empty().boxed(),
            },
            FetchReply::Body {
                content_type,
                chunks,
            } => UpstreamResponse {
                status: 200,
                content_type,
                content_length: Some(chunks.iter().map(|c| c.len() as u64).sum()),
                body: stream::iter(chunks.into_iter().map(Ok)).boxed(),
            },
            FetchReply::Broken { chunks } => {
                let failure = Err(TransportError::Io("connection reset by peer".to_string()));
                UpstreamResponse {
                    status: 200,
                    content_type: None,
                    content_length: None,
                    body: stream::iter(chunks.into_iter().map(Ok).chain(std::iter::once(failure)))
                        .boxed(),
                }
            }
            FetchReply::TransportFailure => {
                return Err(TransportError::Connect(format!("connection refused: {url}")))
            }
        };
        Ok(response)
    }
}
