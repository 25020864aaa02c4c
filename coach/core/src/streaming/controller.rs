//! Conversation Stream Controller
//!
//! Owns one in-flight request and folds its events into an assistant turn.
//!
//! # States
//!
//! ```text
//!            start()             Done
//!   Idle ──────────────▶ Streaming ─────────▶ Sealed(Completed)
//!                          │  ▲
//!         Citations/Content│  │               Error / transport failure
//!                          └──┘ ─────────────▶ Sealed(Failed)
//!                          │
//!                          └──── cancel() ───▶ Sealed(Cancelled)
//! ```
//!
//! Events are applied strictly in arrival order. Content may arrive before
//! citations and citations after content; neither discards the other. Each
//! request gets exactly one terminal transition and everything applied after
//! it is ignored.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::error::{CancelReason, StreamError};
use super::event::StreamEvent;
use crate::citations::{CitationAggregator, CitationGroup};
use crate::messages::{AgentId, MessageId, SessionId};
use crate::session::ConversationTurn;

// ============================================================================
// States
// ============================================================================

/// How a request ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// `done` received; the assistant turn was sealed
    Completed,
    /// Server error or transport failure; an error turn was produced
    Failed,
    /// Cancelled locally; no turn was produced
    Cancelled(CancelReason),
}

impl Outcome {
    /// Whether the request succeeded
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Controller lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerState {
    /// Not started
    Idle,
    /// Request in flight, scratch turn mutable
    Streaming,
    /// Terminal; nothing further is applied
    Sealed(Outcome),
}

/// Result of feeding an event or action to the controller
#[derive(Clone, Debug, PartialEq)]
pub enum Applied {
    /// No effect (not streaming, or sealed already)
    Ignored,
    /// Scratch state changed
    Updated,
    /// The request just ended; carries the turn to append, if any
    Sealed(Option<ConversationTurn>),
}

/// Statistics for one request
#[derive(Clone, Debug, Default)]
pub struct StreamStats {
    /// Content events applied
    pub content_deltas: u32,
    /// Bytes of assistant text received
    pub content_bytes: usize,
    /// Citation records received (before deduplication)
    pub citations_received: usize,
    /// Events ignored because the controller was not streaming
    pub events_ignored: u32,
    /// When streaming started
    pub started_at: Option<Instant>,
    /// Last event timestamp
    pub last_event_at: Option<Instant>,
    /// When the request was sealed
    pub sealed_at: Option<Instant>,
}

impl StreamStats {
    /// Time from start to seal (or to now while streaming)
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        match (self.started_at, self.sealed_at) {
            (Some(start), Some(end)) => end.duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }
}

// ============================================================================
// Controller
// ============================================================================

/// State machine for one request/response exchange
#[derive(Debug)]
pub struct ConversationStreamController {
    state: ControllerState,
    agent: AgentId,
    /// Server id announced by the stream (first one wins)
    message_id: Option<MessageId>,
    session_id: Option<SessionId>,
    content: String,
    citations: CitationAggregator,
    failure: Option<StreamError>,
    stats: StreamStats,
}

impl ConversationStreamController {
    /// Create an idle controller for a request to `agent`
    ///
    /// `session_id` is the server session the request continues, if any.
    #[must_use]
    pub fn new(agent: AgentId, session_id: Option<SessionId>) -> Self {
        Self {
            state: ControllerState::Idle,
            agent,
            message_id: None,
            session_id,
            content: String::new(),
            citations: CitationAggregator::new(),
            failure: None,
            stats: StreamStats::default(),
        }
    }

    /// Begin streaming, producing the user turn for `query`
    ///
    /// # Errors
    ///
    /// Returns `StreamError::InvalidState` unless the controller is idle.
    pub fn start(&mut self, query: &str) -> Result<ConversationTurn, StreamError> {
        if self.state != ControllerState::Idle {
            return Err(StreamError::InvalidState(format!(
                "cannot start from {:?}",
                self.state
            )));
        }

        self.content.clear();
        self.citations.clear();
        self.message_id = None;
        self.failure = None;
        self.stats = StreamStats {
            started_at: Some(Instant::now()),
            ..Default::default()
        };
        self.state = ControllerState::Streaming;

        info!(agent = %self.agent, query_len = query.len(), "Request started");
        Ok(ConversationTurn::user(query))
    }

    /// Apply one parsed event
    pub fn apply(&mut self, event: StreamEvent) -> Applied {
        if self.state != ControllerState::Streaming {
            self.stats.events_ignored += 1;
            debug!(kind = event.kind(), state = ?self.state, "Ignoring event outside streaming");
            return Applied::Ignored;
        }
        self.stats.last_event_at = Some(Instant::now());

        match event {
            StreamEvent::Citations {
                citations,
                message_id,
                session_id,
            } => {
                self.stats.citations_received += citations.len();
                let added = self.citations.extend(citations);
                if self.message_id.is_none() {
                    self.message_id = message_id.map(MessageId::from);
                }
                if self.session_id.is_none() {
                    self.session_id = session_id.map(SessionId::from);
                }
                debug!(
                    added,
                    sources = self.citations.source_count(),
                    "Citations applied"
                );
                Applied::Updated
            }
            StreamEvent::Content { delta } => {
                self.stats.content_deltas += 1;
                self.stats.content_bytes += delta.len();
                self.content.push_str(&delta);
                Applied::Updated
            }
            StreamEvent::Done => self.complete(),
            StreamEvent::Error { message } => self.fail(StreamError::Protocol(message)),
        }
    }

    /// Record a transport failure
    pub fn fail_transport(&mut self, error: StreamError) -> Applied {
        if self.state != ControllerState::Streaming {
            return Applied::Ignored;
        }
        self.fail(error)
    }

    /// End of input; a stream still open here ended prematurely
    pub fn finish_input(&mut self) -> Applied {
        if self.state != ControllerState::Streaming {
            return Applied::Ignored;
        }
        self.fail(StreamError::transport("stream ended before completion"))
    }

    /// Abandon the request without producing a turn
    pub fn cancel(&mut self, reason: CancelReason) -> Applied {
        if self.state != ControllerState::Streaming {
            return Applied::Ignored;
        }
        self.failure = Some(StreamError::Cancelled(reason));
        self.seal(Outcome::Cancelled(reason));
        Applied::Sealed(None)
    }

    fn complete(&mut self) -> Applied {
        let id = self.message_id.clone().unwrap_or_default();
        let turn = ConversationTurn::assistant(
            id,
            std::mem::take(&mut self.content),
            self.citations.records().to_vec(),
            self.agent,
        );
        self.seal(Outcome::Completed);
        Applied::Sealed(Some(turn))
    }

    fn fail(&mut self, error: StreamError) -> Applied {
        warn!(error = %error, partial_bytes = self.content.len(), "Request failed");
        self.failure = Some(error);
        self.seal(Outcome::Failed);
        Applied::Sealed(Some(ConversationTurn::error()))
    }

    fn seal(&mut self, outcome: Outcome) {
        self.content.clear();
        self.citations.clear();
        self.stats.sealed_at = Some(Instant::now());
        self.state = ControllerState::Sealed(outcome);
        info!(
            outcome = ?outcome,
            deltas = self.stats.content_deltas,
            elapsed_ms = self.stats.elapsed().as_millis() as u64,
            "Request sealed"
        );
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    /// Current state
    #[must_use]
    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Whether a request is in flight
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.state == ControllerState::Streaming
    }

    /// Terminal outcome, once sealed
    #[must_use]
    pub fn outcome(&self) -> Option<Outcome> {
        match self.state {
            ControllerState::Sealed(outcome) => Some(outcome),
            _ => None,
        }
    }

    /// Agent this request is routed to
    #[must_use]
    pub fn agent(&self) -> AgentId {
        self.agent
    }

    /// Assistant text received so far
    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Grouped citations received so far
    #[must_use]
    pub fn citation_groups(&self) -> &[CitationGroup] {
        self.citations.groups()
    }

    /// Server message id, once announced
    #[must_use]
    pub fn message_id(&self) -> Option<&MessageId> {
        self.message_id.as_ref()
    }

    /// Server session id
    #[must_use]
    pub fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    /// Raw failure detail of a failed or cancelled request
    #[must_use]
    pub fn failure(&self) -> Option<&StreamError> {
        self.failure.as_ref()
    }

    /// Request statistics
    #[must_use]
    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    /// Streaming view of the assistant turn in progress
    #[must_use]
    pub fn snapshot(&self) -> Option<ConversationTurn> {
        if !self.is_streaming() {
            return None;
        }
        let mut turn = ConversationTurn::assistant(
            self.message_id.clone().unwrap_or_default(),
            self.content.clone(),
            self.citations.records().to_vec(),
            self.agent,
        );
        turn.streaming = true;
        Some(turn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::citations::CitationRecord;
    use crate::messages::MessageRole;
    use crate::streaming::error::ERROR_TURN_MESSAGE;
    use pretty_assertions::assert_eq;

    fn content(text: &str) -> StreamEvent {
        StreamEvent::Content {
            delta: text.to_string(),
        }
    }

    fn citations(id: &str, records: Vec<CitationRecord>) -> StreamEvent {
        StreamEvent::Citations {
            citations: records,
            message_id: Some(id.to_string()),
            session_id: Some("s1".to_string()),
        }
    }

    fn started() -> ConversationStreamController {
        let mut controller = ConversationStreamController::new(AgentId::default(), None);
        controller.start("How do I run a PLC?").unwrap();
        controller
    }

    #[test]
    fn test_start_produces_user_turn() {
        let mut controller = ConversationStreamController::new(AgentId::default(), None);
        let turn = controller.start("hello").unwrap();
        assert_eq!(turn.role, MessageRole::User);
        assert_eq!(turn.content, "hello");
        assert!(controller.is_streaming());
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let mut controller = started();
        assert!(matches!(
            controller.start("again"),
            Err(StreamError::InvalidState(_))
        ));
    }

    #[test]
    fn test_done_seals_assistant_turn() {
        let mut controller = started();
        controller.apply(citations("m1", vec![CitationRecord::new("Guide").with_page(2)]));
        controller.apply(content("Hel"));
        controller.apply(content("lo"));

        let Applied::Sealed(Some(turn)) = controller.apply(StreamEvent::Done) else {
            panic!("expected sealed turn");
        };
        assert_eq!(turn.content, "Hello");
        assert_eq!(turn.id.as_str(), "m1");
        assert_eq!(turn.citations.len(), 1);
        assert_eq!(turn.agent_used.as_deref(), Some("professional_learning"));
        assert!(!turn.streaming);
        assert_eq!(controller.outcome(), Some(Outcome::Completed));
        assert_eq!(controller.session_id().map(SessionId::as_str), Some("s1"));
    }

    #[test]
    fn test_content_before_citations_is_kept() {
        let mut controller = started();
        controller.apply(content("Answer"));
        controller.apply(citations("m1", vec![CitationRecord::new("A")]));
        assert_eq!(controller.content(), "Answer");
        assert_eq!(controller.citation_groups().len(), 1);
    }

    #[test]
    fn test_first_message_id_wins() {
        let mut controller = started();
        controller.apply(citations("first", vec![]));
        controller.apply(citations("second", vec![]));
        assert_eq!(controller.message_id().map(MessageId::as_str), Some("first"));
    }

    #[test]
    fn test_error_event_produces_error_turn() {
        let mut controller = started();
        controller.apply(content("partial"));
        let applied = controller.apply(StreamEvent::Error {
            message: "model overloaded".into(),
        });

        let Applied::Sealed(Some(turn)) = applied else {
            panic!("expected error turn");
        };
        assert_eq!(turn.role, MessageRole::System);
        assert!(turn.error);
        assert_eq!(turn.content, ERROR_TURN_MESSAGE);
        assert_eq!(
            controller.failure(),
            Some(&StreamError::Protocol("model overloaded".into()))
        );
        assert_eq!(controller.content(), "");
    }

    #[test]
    fn test_terminal_exclusivity() {
        let mut controller = started();
        assert!(matches!(
            controller.apply(StreamEvent::Done),
            Applied::Sealed(Some(_))
        ));
        assert_eq!(controller.apply(content("late")), Applied::Ignored);
        assert_eq!(
            controller.apply(StreamEvent::Error {
                message: "late".into()
            }),
            Applied::Ignored
        );
        assert_eq!(controller.finish_input(), Applied::Ignored);
        assert_eq!(controller.cancel(CancelReason::User), Applied::Ignored);
        assert_eq!(controller.stats().events_ignored, 2);
        assert_eq!(controller.outcome(), Some(Outcome::Completed));
    }

    #[test]
    fn test_cancel_produces_no_turn() {
        let mut controller = started();
        controller.apply(content("partial"));
        assert_eq!(controller.cancel(CancelReason::User), Applied::Sealed(None));
        assert_eq!(
            controller.outcome(),
            Some(Outcome::Cancelled(CancelReason::User))
        );
        assert_eq!(controller.apply(StreamEvent::Done), Applied::Ignored);
    }

    #[test]
    fn test_premature_end_is_transport_failure() {
        let mut controller = started();
        controller.apply(content("partial"));
        assert!(matches!(
            controller.finish_input(),
            Applied::Sealed(Some(ref turn)) if turn.error
        ));
        assert!(matches!(
            controller.failure(),
            Some(StreamError::Transport { status: None, .. })
        ));
    }

    #[test]
    fn test_events_before_start_are_ignored() {
        let mut controller = ConversationStreamController::new(AgentId::default(), None);
        assert_eq!(controller.apply(content("x")), Applied::Ignored);
        assert_eq!(controller.state(), ControllerState::Idle);
    }

    #[test]
    fn test_stats_count_records_before_dedup() {
        let mut controller = started();
        controller.apply(citations(
            "m1",
            vec![
                CitationRecord::new("Guide").with_id("c1"),
                CitationRecord::new("Memo").with_id("c2"),
            ],
        ));
        controller.apply(citations("m1", vec![CitationRecord::new("Guide").with_id("c1")]));
        controller.apply(content("ok"));

        let stats = controller.stats();
        assert_eq!(stats.citations_received, 3_usize);
        assert_eq!(stats.content_deltas, 1);
        assert_eq!(stats.content_bytes, 2);
        assert_eq!(controller.citation_groups().len(), 2);
    }

    #[test]
    fn test_snapshot_tracks_scratch() {
        let mut controller = started();
        controller.apply(content("Work"));
        let snapshot = controller.snapshot().unwrap();
        assert!(snapshot.streaming);
        assert_eq!(snapshot.content, "Work");

        controller.apply(StreamEvent::Done);
        assert!(controller.snapshot().is_none());
    }
}
