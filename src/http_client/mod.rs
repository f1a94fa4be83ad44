//! Shared HTTP client construction for webhook delivery.
//!
//! Clients carry a retry middleware configured from [`HttpRetryConfig`] and
//! are pooled per policy so every notifier with the same policy shares one
//! connection pool.

use std::{collections::HashMap, sync::Arc, time::Duration};

use reqwest::Client as ReqwestClient;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, Jitter, RetryTransientMiddleware};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::{HttpRetryConfig, JitterSetting};

/// Errors from HTTP client construction.
#[derive(Debug, Error)]
pub enum HttpClientError {
    /// The underlying `reqwest` client could not be built.
    #[error("failed to build HTTP client: {0}")]
    Build(String),
}

/// Builds a client with exponential-backoff retry middleware.
pub fn create_retryable_http_client(
    config: &HttpRetryConfig,
    base_client: ReqwestClient,
) -> ClientWithMiddleware {
    let policy_builder = match config.jitter {
        JitterSetting::None => ExponentialBackoff::builder().jitter(Jitter::None),
        JitterSetting::Full => ExponentialBackoff::builder().jitter(Jitter::Full),
    };
    let retry_policy = policy_builder
        .base(config.base_for_backoff)
        .retry_bounds(config.initial_backoff_ms, config.max_backoff_secs)
        .build_with_max_retries(config.max_retries);

    ClientBuilder::new(base_client)
        .with(RetryTransientMiddleware::new_with_policy(retry_policy))
        .build()
}

/// A pool of retry-wrapped HTTP clients keyed by their retry policy.
pub struct HttpClientPool {
    clients: RwLock<HashMap<HttpRetryConfig, Arc<ClientWithMiddleware>>>,
}

impl HttpClientPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the pooled client for a policy, creating it on first use.
    pub async fn get_or_create(
        &self,
        retry_policy: &HttpRetryConfig,
    ) -> Result<Arc<ClientWithMiddleware>, HttpClientError> {
        if let Some(client) = self.clients.read().await.get(retry_policy) {
            return Ok(Arc::clone(client));
        }

        let mut clients = self.clients.write().await;
        // Another task may have created it while we waited for the lock.
        if let Some(client) = clients.get(retry_policy) {
            return Ok(Arc::clone(client));
        }

        let base_client = ReqwestClient::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| HttpClientError::Build(e.to_string()))?;
        let client = Arc::new(create_retryable_http_client(retry_policy, base_client));
        clients.insert(retry_policy.clone(), Arc::clone(&client));
        Ok(client)
    }
}

impl Default for HttpClientPool {
    fn default() -> Self {
        Self::new()
    }
}
