use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{FetchError, Fetcher};
use crate::models::{listing::Listing, proxy::ProxyLease};

/// JSON envelope produced by the render endpoint.
#[derive(Deserialize)]
struct ListingsEnvelope {
    #[serde(default)]
    listings: Vec<Listing>,
}

/// HTTP fetcher routing every request through the leased proxy.
///
/// Clients are built per request because the proxy differs per lease;
/// connection reuse across leases would defeat the rotation.
pub struct HttpFetcher {
    timeout: Duration,
}

impl HttpFetcher {
    /// Creates a fetcher with the given per-request deadline.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch_listings(
        &self,
        url: &str,
        proxy: &ProxyLease,
    ) -> Result<Vec<Listing>, FetchError> {
        let proxy_config = reqwest::Proxy::all(&proxy.endpoint)
            .map_err(|e| FetchError::Transport(format!("invalid proxy endpoint: {e}")))?;
        let client = reqwest::Client::builder()
            .proxy(proxy_config)
            .timeout(self.timeout)
            .build()
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(FetchError::RateLimited);
        }
        if status.is_server_error() {
            return Err(FetchError::Upstream(status.as_u16()));
        }
        if !status.is_success() {
            return Err(FetchError::Transport(format!(
                "unexpected status {status}"
            )));
        }

        let envelope: ListingsEnvelope = response
            .json()
            .await
            .map_err(|e| FetchError::Parse(e.to_string()))?;
        Ok(envelope.listings)
    }
}
