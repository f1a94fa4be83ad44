//! Webhook delivery of match notifications.

use std::sync::Arc;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use reqwest_middleware::ClientWithMiddleware;
use sha2::Sha256;

use super::{NotificationError, Notifier};
use crate::{config::WebhookSettings, models::messages::MatchNotification};

type HmacSha256 = Hmac<Sha256>;

/// Sends match events as JSON to a configured webhook endpoint, optionally
/// signing the payload with HMAC-SHA256.
pub struct WebhookNotifier {
    url: String,
    method: Method,
    secret: Option<String>,
    headers: HeaderMap,
    client: Arc<ClientWithMiddleware>,
}

impl WebhookNotifier {
    /// Builds a notifier from settings and a retry-wrapped client.
    pub fn new(
        settings: &WebhookSettings,
        client: Arc<ClientWithMiddleware>,
    ) -> Result<Self, NotificationError> {
        let method = settings
            .method
            .as_deref()
            .unwrap_or("POST")
            .parse::<Method>()
            .map_err(|e| NotificationError::Config(format!("invalid HTTP method: {e}")))?;

        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        for (name, value) in &settings.headers {
            let name = name
                .parse::<HeaderName>()
                .map_err(|e| NotificationError::Config(format!("invalid header name: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| NotificationError::Config(format!("invalid header value: {e}")))?;
            headers.insert(name, value);
        }

        Ok(Self {
            url: settings.url.clone(),
            method,
            secret: settings.secret.clone(),
            headers,
            client,
        })
    }

    fn sign_payload(&self, payload: &[u8]) -> Option<String> {
        let secret = self.secret.as_ref()?;
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
        mac.update(payload);
        let digest = mac.finalize().into_bytes();
        Some(digest.iter().fold(String::new(), |mut out, byte| {
            use std::fmt::Write;
            let _ = write!(out, "{byte:02x}");
            out
        }))
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify_match(&self, event: &MatchNotification) -> Result<(), NotificationError> {
        let payload = serde_json::to_vec(event)?;

        let mut headers = self.headers.clone();
        if let Some(signature) = self.sign_payload(&payload) {
            let value = HeaderValue::from_str(&signature)
                .map_err(|e| NotificationError::Config(format!("invalid signature value: {e}")))?;
            headers.insert(HeaderName::from_static("x-signature"), value);
        }

        let response = self
            .client
            .request(self.method.clone(), &self.url)
            .headers(headers)
            .body(payload)
            .send()
            .await
            .map_err(|e| NotificationError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(NotificationError::Request(format!(
                "webhook answered status {}",
                response.status()
            )));
        }
        Ok(())
    }
}
