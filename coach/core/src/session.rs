//! Session Management
//!
//! A [`StreamSession`] is one conversation with the coaching backend: the
//! transcript, the server session id, the selected agent and at most one
//! in-flight request.
//!
//! # Design Philosophy
//!
//! Sessions are plain values. Nothing is global, two sessions share no
//! mutable state, and every state change goes through the
//! [`ConversationStreamController`] of the current request. The async driver
//! ([`StreamSession::send`]) is a thin loop on top of the synchronous methods
//! here, so the whole state machine can be exercised without a network.
//!
//! # Rollback
//!
//! Starting a request appends the user turn immediately. Cancelling that
//! request removes it again, so the transcript is exactly what it was before
//! the request started. Failed requests keep the user turn and add an error
//! turn after it.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backend::ChatRequest;
use crate::citations::{aggregate, CitationGroup, CitationRecord};
use crate::messages::{now_ms, AgentId, ConversationId, MessageId, MessageRole, SessionId};
use crate::streaming::{
    Applied, CancelReason, ConversationStreamController, StreamError, StreamEvent,
    DEFAULT_MAX_FRAME_BYTES, ERROR_TURN_MESSAGE,
};

/// One entry of the transcript
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// Unique message ID
    pub id: MessageId,
    /// Who produced this turn
    pub role: MessageRole,
    /// Message content
    pub content: String,
    /// Sources backing an assistant turn
    #[serde(default)]
    pub citations: Vec<CitationRecord>,
    /// Agent that answered (assistant turns)
    #[serde(default)]
    pub agent_used: Option<String>,
    /// When the turn was created (Unix timestamp ms)
    pub timestamp: u64,
    /// Whether this is an error notice
    #[serde(default)]
    pub error: bool,
    /// Whether the turn is still being streamed
    #[serde(default)]
    pub streaming: bool,
}

impl ConversationTurn {
    /// Create a user turn
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            role: MessageRole::User,
            content: content.into(),
            citations: Vec::new(),
            agent_used: None,
            timestamp: now_ms(),
            error: false,
            streaming: false,
        }
    }

    /// Create a sealed assistant turn
    pub fn assistant(
        id: MessageId,
        content: String,
        citations: Vec<CitationRecord>,
        agent: AgentId,
    ) -> Self {
        Self {
            id,
            role: MessageRole::Assistant,
            content,
            citations,
            agent_used: Some(agent.as_str().to_string()),
            timestamp: now_ms(),
            error: false,
            streaming: false,
        }
    }

    /// Create the generic error notice shown after a failed request
    pub fn error() -> Self {
        Self {
            id: MessageId::new(),
            role: MessageRole::System,
            content: ERROR_TURN_MESSAGE.to_string(),
            citations: Vec::new(),
            agent_used: None,
            timestamp: now_ms(),
            error: true,
            streaming: false,
        }
    }

    /// Citations grouped by source
    #[must_use]
    pub fn citation_groups(&self) -> Vec<CitationGroup> {
        aggregate(&self.citations)
    }
}

/// Per-request limits applied by the driver
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamOptions {
    /// Bound on a single frame
    pub max_frame_bytes: usize,
    /// Cancel when no bytes arrive for this long (`None` disables)
    pub idle_timeout: Option<std::time::Duration>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            idle_timeout: Some(std::time::Duration::from_secs(60)),
        }
    }
}

/// A conversation with the coaching backend
#[derive(Debug)]
pub struct StreamSession {
    id: ConversationId,
    agent: AgentId,
    session_id: Option<SessionId>,
    transcript: Vec<ConversationTurn>,
    /// Controller of the current (or most recent) request
    controller: Option<ConversationStreamController>,
    /// Transcript length before the current request's user turn
    rollback_len: usize,
    last_failure: Option<StreamError>,
    pub(crate) options: StreamOptions,
}

impl StreamSession {
    /// Create an empty session for `agent`
    #[must_use]
    pub fn new(agent: AgentId) -> Self {
        Self {
            id: ConversationId::new(),
            agent,
            session_id: None,
            transcript: Vec::new(),
            controller: None,
            rollback_len: 0,
            last_failure: None,
            options: StreamOptions::default(),
        }
    }

    /// Replace the per-request limits
    #[must_use]
    pub fn with_options(mut self, options: StreamOptions) -> Self {
        self.options = options;
        self
    }

    // ------------------------------------------------------------------------
    // Request lifecycle
    // ------------------------------------------------------------------------

    /// Start a request for `query`
    ///
    /// Appends the user turn and returns the request to send.
    ///
    /// # Errors
    ///
    /// - `StreamError::RequestInFlight` if a request is already streaming
    /// - `StreamError::InvalidRequest` if the query is blank or too long
    pub fn begin(&mut self, query: &str) -> Result<ChatRequest, StreamError> {
        if self.is_streaming() {
            return Err(StreamError::RequestInFlight);
        }
        let request = ChatRequest::new(query, self.agent, self.session_id.clone())?;

        let mut controller = ConversationStreamController::new(self.agent, self.session_id.clone());
        let user_turn = controller.start(&request.query)?;

        self.rollback_len = self.transcript.len();
        self.transcript.push(user_turn);
        self.controller = Some(controller);
        self.last_failure = None;

        info!(
            conversation = %self.id,
            agent = %self.agent,
            resumed = self.session_id.is_some(),
            "Turn started"
        );
        Ok(request)
    }

    /// Apply one parsed event to the request in flight
    pub fn apply(&mut self, event: StreamEvent) -> Applied {
        let Some(controller) = self.controller.as_mut() else {
            debug!(kind = event.kind(), "Event with no request in flight");
            return Applied::Ignored;
        };
        let applied = controller.apply(event);

        if self.session_id.is_none() {
            if let Some(session_id) = controller.session_id() {
                info!(conversation = %self.id, session_id = %session_id, "Server session assigned");
                self.session_id = Some(session_id.clone());
            }
        }
        self.absorb(applied)
    }

    /// Fail the request in flight with a transport error
    pub fn fail(&mut self, error: StreamError) -> Applied {
        match self.controller.as_mut() {
            Some(controller) => {
                let applied = controller.fail_transport(error);
                self.absorb(applied)
            }
            None => Applied::Ignored,
        }
    }

    /// End of input for the request in flight
    pub fn finish_input(&mut self) -> Applied {
        match self.controller.as_mut() {
            Some(controller) => {
                let applied = controller.finish_input();
                self.absorb(applied)
            }
            None => Applied::Ignored,
        }
    }

    /// Cancel the request in flight and roll back its user turn
    pub fn cancel(&mut self, reason: CancelReason) -> Applied {
        match self.controller.as_mut() {
            Some(controller) => {
                let applied = controller.cancel(reason);
                self.absorb(applied)
            }
            None => Applied::Ignored,
        }
    }

    fn absorb(&mut self, applied: Applied) -> Applied {
        if let Applied::Sealed(turn) = &applied {
            let failure = self.controller.as_ref().and_then(|c| c.failure().cloned());
            match turn {
                Some(turn) => self.transcript.push(turn.clone()),
                None => {
                    // Cancelled: drop the user turn of this request
                    self.transcript.truncate(self.rollback_len);
                }
            }
            self.last_failure = failure;
        }
        applied
    }

    // ------------------------------------------------------------------------
    // Conversation management
    // ------------------------------------------------------------------------

    /// Route further requests to another agent
    ///
    /// Switching to a different agent starts a fresh conversation.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::RequestInFlight` while a request is streaming.
    pub fn switch_agent(&mut self, agent: AgentId) -> Result<(), StreamError> {
        if agent == self.agent {
            return Ok(());
        }
        self.clear()?;
        info!(conversation = %self.id, from = %self.agent, to = %agent, "Agent switched");
        self.agent = agent;
        Ok(())
    }

    /// Drop the transcript and the server session
    ///
    /// # Errors
    ///
    /// Returns `StreamError::RequestInFlight` while a request is streaming.
    pub fn clear(&mut self) -> Result<(), StreamError> {
        if self.is_streaming() {
            return Err(StreamError::RequestInFlight);
        }
        self.transcript.clear();
        self.session_id = None;
        self.controller = None;
        self.rollback_len = 0;
        self.last_failure = None;
        Ok(())
    }

    /// Seed the session from a stored transcript
    ///
    /// # Errors
    ///
    /// Returns `StreamError::RequestInFlight` while a request is streaming.
    pub fn load_history(
        &mut self,
        turns: Vec<ConversationTurn>,
        session_id: Option<SessionId>,
    ) -> Result<(), StreamError> {
        if self.is_streaming() {
            return Err(StreamError::RequestInFlight);
        }
        self.transcript = turns
            .into_iter()
            .map(|mut turn| {
                turn.streaming = false;
                turn
            })
            .collect();
        self.session_id = session_id;
        self.controller = None;
        self.rollback_len = self.transcript.len();
        debug!(conversation = %self.id, turns = self.transcript.len(), "History loaded");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    /// Local conversation id
    #[must_use]
    pub fn id(&self) -> ConversationId {
        self.id
    }

    /// Selected agent
    #[must_use]
    pub fn agent(&self) -> AgentId {
        self.agent
    }

    /// Server session id, once assigned
    #[must_use]
    pub fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    /// Sealed turns, oldest first
    #[must_use]
    pub fn transcript(&self) -> &[ConversationTurn] {
        &self.transcript
    }

    /// Whether a request is in flight
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.controller
            .as_ref()
            .is_some_and(ConversationStreamController::is_streaming)
    }

    /// Controller of the current or most recent request
    #[must_use]
    pub fn controller(&self) -> Option<&ConversationStreamController> {
        self.controller.as_ref()
    }

    /// Assistant turn being streamed, if any
    #[must_use]
    pub fn streaming_turn(&self) -> Option<ConversationTurn> {
        self.controller.as_ref().and_then(ConversationStreamController::snapshot)
    }

    /// Raw detail of the most recent failed or cancelled request
    #[must_use]
    pub fn last_failure(&self) -> Option<&StreamError> {
        self.last_failure.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::Outcome;
    use pretty_assertions::assert_eq;

    fn content(text: &str) -> StreamEvent {
        StreamEvent::Content {
            delta: text.to_string(),
        }
    }

    fn citations_with_session(session: &str) -> StreamEvent {
        StreamEvent::Citations {
            citations: vec![CitationRecord::new("Guide").with_page(4).with_score(0.5)],
            message_id: Some("m1".into()),
            session_id: Some(session.into()),
        }
    }

    #[test]
    fn test_completed_turn_is_appended() {
        let mut session = StreamSession::new(AgentId::ProfessionalLearning);
        session.begin("What is a PLC?").unwrap();
        session.apply(citations_with_session("s1"));
        session.apply(content("A team"));
        session.apply(StreamEvent::Done);

        let roles: Vec<MessageRole> = session.transcript().iter().map(|t| t.role).collect();
        assert_eq!(roles, vec![MessageRole::User, MessageRole::Assistant]);
        assert_eq!(session.transcript()[1].content, "A team");
        assert_eq!(session.session_id().map(SessionId::as_str), Some("s1"));
        assert!(!session.is_streaming());

        let groups = session.transcript()[1].citation_groups();
        assert_eq!(groups[0].page_label().as_deref(), Some("p. 4"));
    }

    #[test]
    fn test_next_request_carries_session_id() {
        let mut session = StreamSession::new(AgentId::default());
        session.begin("one").unwrap();
        session.apply(citations_with_session("s1"));
        session.apply(StreamEvent::Done);

        let request = session.begin("two").unwrap();
        assert_eq!(request.session_id.as_ref().map(SessionId::as_str), Some("s1"));
    }

    #[test]
    fn test_existing_session_id_is_not_replaced() {
        let mut session = StreamSession::new(AgentId::default());
        session
            .load_history(Vec::new(), Some(SessionId::from("stored".to_string())))
            .unwrap();
        session.begin("q").unwrap();
        session.apply(citations_with_session("other"));
        assert_eq!(session.session_id().map(SessionId::as_str), Some("stored"));
    }

    #[test]
    fn test_second_request_while_streaming_is_rejected() {
        let mut session = StreamSession::new(AgentId::default());
        session.begin("first").unwrap();
        assert_eq!(session.begin("second"), Err(StreamError::RequestInFlight));
        assert_eq!(session.transcript().len(), 1);
    }

    #[test]
    fn test_invalid_query_leaves_transcript_untouched() {
        let mut session = StreamSession::new(AgentId::default());
        assert!(matches!(
            session.begin("   "),
            Err(StreamError::InvalidRequest(_))
        ));
        assert!(session.transcript().is_empty());
        assert!(!session.is_streaming());
    }

    #[test]
    fn test_cancel_rolls_back_user_turn() {
        let mut session = StreamSession::new(AgentId::default());
        session.begin("one").unwrap();
        session.apply(StreamEvent::Done);
        let before = session.transcript().to_vec();

        session.begin("two").unwrap();
        session.apply(content("partial"));
        assert_eq!(session.cancel(CancelReason::User), Applied::Sealed(None));

        assert_eq!(session.transcript(), before.as_slice());
        assert_eq!(
            session.last_failure(),
            Some(&StreamError::Cancelled(CancelReason::User))
        );
        assert!(session.begin("three").is_ok());
    }

    #[test]
    fn test_failure_appends_single_error_turn() {
        let mut session = StreamSession::new(AgentId::default());
        session.begin("q").unwrap();
        session.apply(content("partial"));
        session.fail(StreamError::transport("connection reset"));
        session.finish_input();

        assert_eq!(session.transcript().len(), 2);
        let last = &session.transcript()[1];
        assert!(last.error);
        assert_eq!(last.role, MessageRole::System);
        assert_eq!(
            session.controller().and_then(|c| c.outcome()),
            Some(Outcome::Failed)
        );
        assert_eq!(
            session.last_failure(),
            Some(&StreamError::transport("connection reset"))
        );
    }

    #[test]
    fn test_switch_agent_clears_conversation() {
        let mut session = StreamSession::new(AgentId::ProfessionalLearning);
        session.begin("q").unwrap();
        session.apply(citations_with_session("s1"));
        session.apply(StreamEvent::Done);

        session.switch_agent(AgentId::ProfessionalLearning).unwrap();
        assert_eq!(session.transcript().len(), 2);

        session.switch_agent(AgentId::ClassroomCurriculum).unwrap();
        assert!(session.transcript().is_empty());
        assert!(session.session_id().is_none());
        assert_eq!(session.agent(), AgentId::ClassroomCurriculum);
    }

    #[test]
    fn test_switch_agent_rejected_while_streaming() {
        let mut session = StreamSession::new(AgentId::ProfessionalLearning);
        session.begin("q").unwrap();
        assert_eq!(
            session.switch_agent(AgentId::ClassroomCurriculum),
            Err(StreamError::RequestInFlight)
        );
    }

    #[test]
    fn test_load_history_seals_turns() {
        let mut stored = ConversationTurn::user("earlier");
        stored.streaming = true;

        let mut session = StreamSession::new(AgentId::default());
        session.load_history(vec![stored], None).unwrap();
        assert!(!session.transcript()[0].streaming);

        session.begin("next").unwrap();
        session.cancel(CancelReason::User);
        assert_eq!(session.transcript().len(), 1);
    }

    #[test]
    fn test_streaming_turn_reflects_progress() {
        let mut session = StreamSession::new(AgentId::default());
        assert!(session.streaming_turn().is_none());
        session.begin("q").unwrap();
        session.apply(content("so far"));
        assert_eq!(session.streaming_turn().unwrap().content, "so far");
    }

    #[test]
    fn test_turn_serializes_with_lowercase_role() {
        let turn = ConversationTurn::user("hi");
        let json = serde_json::to_value(&turn).unwrap();
        assert_eq!(json["role"], "user");
        let back: ConversationTurn = serde_json::from_value(json).unwrap();
        assert_eq!(back, turn);
    }
}
