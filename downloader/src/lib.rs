//! Upstream side of Fetchgate: the HTTP client seam, host probing, and
//! content fetching with retry.
pub mod client;
pub mod fetcher;
pub mod prober;
pub mod retry;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use client::{HttpClient, ReqwestClient};
pub use fetcher::{ContentFetcher, FetchResult};
pub use prober::HostProber;
pub use retry::RetryPolicy;
