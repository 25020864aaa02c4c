//! Conversation Identifiers and Roles
//!
//! Small value types shared by the streaming pipeline, the session and the
//! transport: message/session/conversation identifiers, turn roles and the
//! coaching agents a request can be routed to.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message identifier
///
/// Assistant turns adopt the id announced by the server in the `citations`
/// event; every other turn gets a locally generated id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    /// Generate a new unique message ID
    pub fn new() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let id = COUNTER.fetch_add(1, Ordering::SeqCst);
        Self(format!("msg_{id}"))
    }

    /// Borrow the raw id
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Server-side session identifier
///
/// Issued by the backend on the first response of a conversation and echoed
/// back on every later request so the assistant sees the history.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Borrow the raw id
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Local identifier for one conversation (one [`StreamSession`](crate::StreamSession))
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub Uuid);

impl ConversationId {
    /// Create a new unique conversation ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Who produced a turn
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// User input
    User,
    /// Coaching assistant
    Assistant,
    /// Client-generated notice (errors)
    System,
}

/// Coaching agent a request is routed to
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentId {
    /// PLC team dynamics, collaboration and professional development
    #[default]
    ProfessionalLearning,
    /// Curriculum design, standards alignment and lesson planning
    ClassroomCurriculum,
}

impl AgentId {
    /// All known agents, in menu order
    pub const ALL: [AgentId; 2] = [Self::ProfessionalLearning, Self::ClassroomCurriculum];

    /// Wire name used in requests
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProfessionalLearning => "professional_learning",
            Self::ClassroomCurriculum => "classroom_curriculum",
        }
    }

    /// Human-readable agent name
    #[must_use]
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::ProfessionalLearning => "Professional Learning Coach",
            Self::ClassroomCurriculum => "Classroom Curriculum Planning Coach",
        }
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for AgentId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|agent| agent.as_str() == s.trim())
            .ok_or_else(|| format!("unknown agent '{s}'"))
    }
}

/// Current time as Unix milliseconds
pub(crate) fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
