//! The fetcher seam.
//!
//! The fetcher turns one (URL, leased proxy) pair into either parsed
//! listings or a classified error. The scraping internals are deliberately
//! opaque to the rest of the system; workers only ever see the
//! classification.

mod http;

pub use http::HttpFetcher;

use async_trait::async_trait;
#[cfg(any(test, feature = "test-helpers"))]
use mockall::automock;
use thiserror::Error;

use crate::models::{listing::Listing, proxy::ProxyLease};

/// Classified fetch failures.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The upstream rate-limited the leased proxy (HTTP 429).
    #[error("rate limited by upstream")]
    RateLimited,

    /// The upstream answered with a server error.
    #[error("upstream server error: status {0}")]
    Upstream(u16),

    /// Transport-level failure: connect, TLS, deadline, or an unexpected
    /// non-success status.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The response body could not be decoded into listings.
    #[error("listing payload could not be parsed: {0}")]
    Parse(String),
}

/// Fetches and extracts listings through a leased proxy.
#[cfg_attr(any(test, feature = "test-helpers"), automock)]
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetches the listing page at `url` through `proxy` and extracts its
    /// listings.
    async fn fetch_listings(
        &self,
        url: &str,
        proxy: &ProxyLease,
    ) -> Result<Vec<Listing>, FetchError>;
}
