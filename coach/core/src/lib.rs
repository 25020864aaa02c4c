//! Coach Core - Response Streaming for the Coaching Chat Client
//!
//! This crate provides the client side of a conversation with the coaching
//! backend, independent of any UI. It sends a question, reassembles the
//! chunked, event-typed response as it arrives, and keeps a transcript with
//! grouped source citations.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     Presentation (CLI, UI)                       │
//! │          StreamUpdate (progress)      transcript (state)         │
//! └───────────────────────────┬──────────────────────────────────────┘
//!                             │
//! ┌───────────────────────────┼──────────────────────────────────────┐
//! │                       COACH CORE                                 │
//! │  ┌────────────────────────┴────────────────────────────────────┐ │
//! │  │                     StreamSession                            │ │
//! │  │  ┌────────────┐  ┌─────────────┐  ┌──────────────────────┐  │ │
//! │  │  │ Transcript │  │ Controller  │  │ CitationAggregator   │  │ │
//! │  │  └────────────┘  └──────┬──────┘  └──────────────────────┘  │ │
//! │  └─────────────────────────┼───────────────────────────────────┘ │
//! │             FrameReader ─▶ EventParser                           │
//! │                         ▲                                        │
//! │                ChatTransport (HTTP)                              │
//! └─────────────────────────┼────────────────────────────────────────┘
//!                           │  POST /api/chat/stream
//!                    coaching backend
//! ```
//!
//! # Key Types
//!
//! - [`StreamSession`]: One conversation: transcript, server session, agent
//! - [`ConversationStreamController`]: State machine for one request
//! - [`FrameReader`] / [`EventParser`]: Byte stream to typed [`StreamEvent`]s
//! - [`CitationAggregator`]: Citations grouped by source document
//! - [`HttpChatBackend`]: Transport for the backend's REST API
//! - [`ClientConfig`]: TOML + environment configuration
//!
//! # Quick Start
//!
//! ```ignore
//! use coach_core::{load_config, HttpChatBackend, StreamSession};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = load_config()?;
//! let backend = HttpChatBackend::from_config(&config);
//! let mut session = StreamSession::new(config.default_agent)
//!     .with_options(config.stream_options());
//!
//! let cancel = CancellationToken::new();
//! let outcome = session
//!     .send(&backend, "How can our PLC use common assessments?", &cancel, None)
//!     .await?;
//! println!("{:?}", outcome.turn);
//! ```
//!
//! # Module Overview
//!
//! - [`backend`]: Transport trait and HTTP implementation
//! - [`citations`]: Citation records and grouping
//! - [`config`]: Configuration loading
//! - [`messages`]: Identifiers, roles and agents
//! - [`session`]: Conversation session and transcript turns
//! - [`streaming`]: Framing, parsing, the request state machine and the driver

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod citations;
pub mod config;
pub mod messages;
pub mod session;
pub mod streaming;

// Re-exports for convenience
pub use backend::{
    ChatRequest, ChatTransport, CredentialProvider, HttpChatBackend, StaticToken,
    MAX_QUERY_CHARS,
};
pub use citations::{aggregate, sources_heading, CitationAggregator, CitationGroup, CitationRecord};
pub use messages::{AgentId, ConversationId, MessageId, MessageRole, SessionId};
pub use session::{ConversationTurn, StreamOptions, StreamSession};

// Streaming exports
pub use streaming::{
    Applied, CancelReason, ControllerState, ConversationStreamController, EventParser,
    FrameReader, Outcome, StreamError, StreamEvent, StreamStats, StreamUpdate, TurnOutcome,
    ERROR_TURN_MESSAGE,
};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ClientConfig, ClientToml,
    ConfigError, ConfigOverrides, ConfigSource,
};
