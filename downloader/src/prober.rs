/// Concurrent upstream host probing.
///
/// Every candidate is probed at the same time; the first candidate that
/// answers 2xx wins and the remaining probes are aborted.
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fetchgate_shared::errors::ProbeError;
use fetchgate_shared::models::{ProbeOutcome, UpstreamCandidate};

use crate::client::HttpClient;

pub struct HostProber<C> {
    client: Arc<C>,
}

impl<C: HttpClient> HostProber<C> {
    pub fn new(client: Arc<C>) -> Self {
        Self { client }
    }

    /// Resolve `path` against the first candidate that has it.
    ///
    /// Returns the full upstream URL of the winner. 3xx answers never win.
    /// Cancelling `cancel` aborts every in-flight probe.
    pub async fn probe(
        &self,
        candidates: &[UpstreamCandidate],
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<String, ProbeError> {
        let mut probes = JoinSet::new();
        for candidate in candidates {
            let client = self.client.clone();
            let url = candidate.join(path);
            probes.spawn(async move { probe_one(client.as_ref(), url).await });
        }

        let attempted = candidates.len();
        let mut redirects = 0;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    probes.abort_all();
                    debug!("Probing {} cancelled", path);
                    return Err(ProbeError::Cancelled);
                }
                joined = probes.join_next() => {
                    let Some(joined) = joined else { break };
                    let outcome = match joined {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            warn!("Probe task for {} failed: {}", path, e);
                            continue;
                        }
                    };
                    if outcome.is_winner() {
                        probes.abort_all();
                        info!("Resolved {} to {}", path, outcome.candidate_url);
                        return Ok(outcome.candidate_url);
                    }
                    if outcome.rejected_as_redirect {
                        redirects += 1;
                    }
                }
            }
        }

        warn!(
            "No upstream has {} ({} probed, {} redirected)",
            path, attempted, redirects
        );
        Err(ProbeError::NoUpstreamAvailable {
            attempted,
            redirects,
        })
    }
}

async fn probe_one<C: HttpClient>(client: &C, url: String) -> ProbeOutcome {
    match client.head(&url).await {
        Ok(status) => {
            debug!("Probe {} -> {}", url, status);
            ProbeOutcome::from_status(url, status)
        }
        Err(e) => {
            debug!("Probe {} failed: {}", url, e);
            ProbeOutcome::unreachable(url)
        }
    }
}
