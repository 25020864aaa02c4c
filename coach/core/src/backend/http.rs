//! HTTP Backend Implementation
//!
//! Chat transport for the coaching backend's REST API.
//!
//! # API
//!
//! - `POST /api/chat/stream` - Stream an answer as `data:` frames
//! - `GET /health` - Liveness probe
//!
//! Only the connect phase has a timeout here. A streamed answer can take
//! arbitrarily long; stalls are caught by the driver's idle timeout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::ACCEPT;
use tracing::{debug, error, warn};

use super::traits::{ByteStream, ChatRequest, ChatTransport, CredentialProvider, StaticToken};
use crate::config::ClientConfig;
use crate::streaming::StreamError;

/// Default connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest server error body echoed into an error
const MAX_DETAIL_CHARS: usize = 200;

/// HTTP chat backend client
#[derive(Clone)]
pub struct HttpChatBackend {
    /// Base URL without trailing slash
    base_url: String,
    /// HTTP client
    http_client: reqwest::Client,
    /// Bearer credential source
    credentials: Option<Arc<dyn CredentialProvider>>,
}

impl HttpChatBackend {
    /// Create a backend for `base_url` with the default connect timeout
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_connect_timeout(base_url, DEFAULT_CONNECT_TIMEOUT)
    }

    /// Create a backend with a custom connect timeout
    pub fn with_connect_timeout(base_url: impl Into<String>, connect_timeout: Duration) -> Self {
        let http_client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Falling back to default HTTP client");
                reqwest::Client::new()
            });

        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
            credentials: None,
        }
    }

    /// Create from `ClientConfig`
    #[must_use]
    pub fn from_config(config: &ClientConfig) -> Self {
        let backend = Self::with_connect_timeout(&config.base_url, config.connect_timeout);
        match &config.bearer_token {
            Some(token) => backend.with_credentials(Arc::new(StaticToken::new(token.clone()))),
            None => backend,
        }
    }

    /// Attach a credential provider
    #[must_use]
    pub fn with_credentials(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(provider);
        self
    }

    /// Get the base URL
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Get stream endpoint URL
    fn stream_url(&self) -> String {
        format!("{}/api/chat/stream", self.base_url)
    }

    /// Get health endpoint URL
    fn health_url(&self) -> String {
        format!("{}/health", self.base_url)
    }

    async fn bearer_token(&self) -> Option<String> {
        let provider = self.credentials.as_ref()?;
        match provider.access_token().await {
            Ok(token) => token,
            Err(reason) => {
                warn!(reason = %reason, "No access token; sending request unauthenticated");
                None
            }
        }
    }
}

impl std::fmt::Debug for HttpChatBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpChatBackend")
            .field("base_url", &self.base_url)
            .field("authenticated", &self.credentials.is_some())
            .finish()
    }
}

#[async_trait]
impl ChatTransport for HttpChatBackend {
    fn name(&self) -> &'static str {
        "HTTP"
    }

    async fn open(&self, request: &ChatRequest) -> Result<ByteStream, StreamError> {
        let mut builder = self
            .http_client
            .post(self.stream_url())
            .header(ACCEPT, "text/event-stream")
            .json(request);
        if let Some(token) = self.bearer_token().await {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|e| {
            error!(url = %self.stream_url(), error = %e, "Chat request failed");
            StreamError::from(e)
        })?;

        // Check for HTTP errors
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = error_detail(&body).unwrap_or_else(|| {
                status
                    .canonical_reason()
                    .unwrap_or("request rejected")
                    .to_string()
            });
            error!(status = status.as_u16(), detail = %detail, "Chat request rejected");
            return Err(StreamError::Transport {
                status: Some(status.as_u16()),
                detail,
            });
        }

        debug!(status = status.as_u16(), "Chat stream opened");
        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(StreamError::from))
            .boxed())
    }

    async fn health_check(&self) -> bool {
        self.http_client
            .get(self.health_url())
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .is_ok_and(|r| r.status().is_success())
    }
}

/// Human-readable detail from an error response body
///
/// Prefers the JSON `detail`, `message` or `error` field; falls back to the
/// start of a non-JSON body.
fn error_detail(body: &str) -> Option<String> {
    let body = body.trim();
    if body.is_empty() {
        return None;
    }

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        for key in ["detail", "message", "error"] {
            match value.get(key) {
                Some(serde_json::Value::String(text)) => return Some(text.clone()),
                Some(serde_json::Value::Null) | None => {}
                Some(other) => return Some(other.to_string()),
            }
        }
    }

    Some(body.chars().take(MAX_DETAIL_CHARS).collect())
}
