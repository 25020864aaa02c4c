//! Chat Transport Traits
//!
//! Trait definitions for the transport that carries a chat request to the
//! coaching backend and hands back the raw response body.
//!
//! # Design Philosophy
//!
//! The transport knows nothing about frames or events. It opens the request
//! and yields byte chunks exactly as the network delivers them; everything
//! above that is the streaming pipeline's job. This keeps the HTTP client
//! swappable and lets tests script byte-level fragmentation directly.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::Serialize;

use crate::messages::{AgentId, SessionId};
use crate::streaming::StreamError;

/// Maximum query length accepted by the backend, in characters
pub const MAX_QUERY_CHARS: usize = 2000;

/// Response body as it arrives from the network
pub type ByteStream = BoxStream<'static, Result<Bytes, StreamError>>;

/// Body of a streaming chat request
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChatRequest {
    /// The user's question
    pub query: String,
    /// Agent to route to
    pub agent_id: AgentId,
    /// Server session to continue, if any
    pub session_id: Option<SessionId>,
}

impl ChatRequest {
    /// Build a validated request
    ///
    /// # Errors
    ///
    /// Returns `StreamError::InvalidRequest` if the query is blank or longer
    /// than [`MAX_QUERY_CHARS`].
    pub fn new(
        query: &str,
        agent_id: AgentId,
        session_id: Option<SessionId>,
    ) -> Result<Self, StreamError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(StreamError::InvalidRequest("query is empty".to_string()));
        }
        let chars = query.chars().count();
        if chars > MAX_QUERY_CHARS {
            return Err(StreamError::InvalidRequest(format!(
                "query is {chars} characters (max {MAX_QUERY_CHARS})"
            )));
        }
        Ok(Self {
            query: query.to_string(),
            agent_id,
            session_id,
        })
    }
}

/// Source of the bearer credential attached to requests
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Current access token, or `None` to send the request unauthenticated
    ///
    /// # Errors
    ///
    /// Returns a description of why no token could be obtained.
    async fn access_token(&self) -> Result<Option<String>, String>;
}

/// Fixed token, e.g. from configuration
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    /// Wrap a token
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StaticToken(***)")
    }
}

#[async_trait]
impl CredentialProvider for StaticToken {
    async fn access_token(&self) -> Result<Option<String>, String> {
        Ok(Some(self.0.clone()))
    }
}

/// Chat transport trait
///
/// Implement this trait to carry requests over something other than HTTP.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Transport name for logging
    fn name(&self) -> &str;

    /// Open a streaming request
    ///
    /// Resolves once the server has accepted the request; the returned
    /// stream yields the response body. Dropping the stream closes the
    /// connection.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::Transport` if the connection fails or the
    /// server rejects the request.
    async fn open(&self, request: &ChatRequest) -> Result<ByteStream, StreamError>;

    /// Check if the backend is healthy and reachable
    async fn health_check(&self) -> bool;
}
