//! Response Streaming Pipeline
//!
//! Turns the chunked response body of a chat request into sealed
//! conversation turns.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   bytes   ┌─────────────┐  frames  ┌─────────────┐
//! │ ChatTransport│ ────────▶ │ FrameReader │ ───────▶ │ EventParser │
//! └──────────────┘           └─────────────┘          └──────┬──────┘
//!                                                            │ StreamEvent
//!                                                            ▼
//!                        ┌────────────────────────────────────────────┐
//!                        │        ConversationStreamController        │
//!                        │  Idle ─▶ Streaming ─▶ Sealed(outcome)      │
//!                        │              │                             │
//!                        │              └─▶ CitationAggregator        │
//!                        └────────────────────┬───────────────────────┘
//!                                             │ ConversationTurn
//!                                             ▼
//!                                       StreamSession
//! ```
//!
//! Data flows one way. Each stage is usable on its own; [`driver`] wires
//! them together behind [`StreamSession::send`](crate::StreamSession::send).
//!
//! # Features
//!
//! - **Fragmentation tolerant**: frames are reassembled from arbitrary splits
//! - **Resilient**: malformed frames are logged and skipped
//! - **Terminal exclusivity**: exactly one outcome per request
//! - **Immediate cancellation**: the connection is dropped, no terminal frame awaited

mod controller;
pub mod driver;
mod error;
mod event;
mod frame;

pub use controller::{
    Applied, ControllerState, ConversationStreamController, Outcome, StreamStats,
};
pub use driver::{StreamUpdate, TurnOutcome};
pub use error::{CancelReason, StreamError, ERROR_TURN_MESSAGE};
pub use event::{EventParser, ParserStats, StreamEvent};
pub use frame::{FrameReader, Frames, DEFAULT_MAX_FRAME_BYTES};
