//! Chat Backend Integration
//!
//! This module provides access to the coaching backend through a common
//! transport trait.
//!
//! # Available Transports
//!
//! - **HTTP**: the backend's REST API (default)
//!
//! # Usage
//!
//! ```ignore
//! use coach_core::backend::{ChatRequest, ChatTransport, HttpChatBackend};
//! use coach_core::AgentId;
//!
//! let backend = HttpChatBackend::new("http://localhost:8000");
//! let request = ChatRequest::new("How do I structure a PLC meeting?", AgentId::default(), None)?;
//! let body = backend.open(&request).await?;
//! ```

mod http;
mod traits;

pub use http::{HttpChatBackend, DEFAULT_CONNECT_TIMEOUT};
pub use traits::{
    ByteStream, ChatRequest, ChatTransport, CredentialProvider, StaticToken, MAX_QUERY_CHARS,
};
