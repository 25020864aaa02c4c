//! Stream Events
//!
//! Typed view of one `data:` frame. Each frame carries a JSON object whose
//! `type` tag selects the event:
//!
//! ```text
//! data: {"type":"citations","citations":[...],"message_id":"m1","session_id":"s1"}
//! data: {"type":"content","content":"partial text"}
//! data: {"type":"done"}
//! data: {"type":"error","error":"human-readable message"}
//! ```
//!
//! Anything else on the wire (blank keep-alive lines, `:` comments, `event:`
//! lines) is not an event and is ignored. A `data:` frame that does not parse
//! is logged and skipped; the parser never invents an error event for it.

use serde::Deserialize;
use tracing::{debug, trace, warn};

use super::error::StreamError;
use crate::citations::CitationRecord;

/// One logical event of the response stream
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    /// Retrieved sources backing the answer
    Citations {
        /// Citation records, normalized
        citations: Vec<CitationRecord>,
        /// Server id of the assistant message
        message_id: Option<String>,
        /// Server session id, issued on the first response
        session_id: Option<String>,
    },
    /// Next fragment of assistant text
    Content {
        /// Text to append
        delta: String,
    },
    /// Response finished successfully
    Done,
    /// Server-side failure
    Error {
        /// Human-readable message
        message: String,
    },
}

impl StreamEvent {
    /// Whether this event ends the response
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error { .. })
    }

    /// Short name for logging
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Citations { .. } => "citations",
            Self::Content { .. } => "content",
            Self::Done => "done",
            Self::Error { .. } => "error",
        }
    }
}

/// JSON payload of a `data:` frame
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    Citations {
        #[serde(default)]
        citations: Vec<CitationRecord>,
        #[serde(default)]
        message_id: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
    },
    Content {
        #[serde(default)]
        content: String,
    },
    Done,
    Error {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
}

impl From<WireEvent> for StreamEvent {
    fn from(wire: WireEvent) -> Self {
        match wire {
            WireEvent::Citations {
                citations,
                message_id,
                session_id,
            } => Self::Citations {
                citations: citations.into_iter().map(CitationRecord::normalized).collect(),
                message_id: message_id.filter(|id| !id.is_empty()),
                session_id: session_id.filter(|id| !id.is_empty()),
            },
            WireEvent::Content { content } => Self::Content { delta: content },
            WireEvent::Done => Self::Done,
            WireEvent::Error { error, message } => Self::Error {
                message: error
                    .or(message)
                    .unwrap_or_else(|| "unknown server error".to_string()),
            },
        }
    }
}

/// Counters kept by [`EventParser`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ParserStats {
    /// Frames turned into events
    pub parsed: u64,
    /// Frames that were not `data:` frames
    pub ignored: u64,
    /// `data:` frames that failed to parse
    pub malformed: u64,
}

/// Converts frames into [`StreamEvent`]s
#[derive(Debug, Default)]
pub struct EventParser {
    stats: ParserStats,
}

impl EventParser {
    /// Create a parser
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a frame, logging and skipping anything that is not an event
    pub fn parse(&mut self, frame: &str) -> Option<StreamEvent> {
        match self.try_parse(frame) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, frame_len = frame.len(), "Skipping malformed frame");
                None
            }
        }
    }

    /// Parse a frame, exposing the parse failure
    ///
    /// `Ok(None)` means the frame is not a `data:` frame.
    pub fn try_parse(&mut self, frame: &str) -> Result<Option<StreamEvent>, StreamError> {
        let Some(payload) = frame.strip_prefix("data:") else {
            self.stats.ignored += 1;
            if !frame.trim().is_empty() {
                debug!(frame_len = frame.len(), "Ignoring non-data frame");
            } else {
                trace!("Ignoring blank frame");
            }
            return Ok(None);
        };
        let payload = payload.strip_prefix(' ').unwrap_or(payload);

        match serde_json::from_str::<WireEvent>(payload) {
            Ok(wire) => {
                self.stats.parsed += 1;
                Ok(Some(wire.into()))
            }
            Err(e) => {
                self.stats.malformed += 1;
                Err(StreamError::FrameParse(e.to_string()))
            }
        }
    }

    /// Counters so far
    #[must_use]
    pub fn stats(&self) -> ParserStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_content() {
        let mut parser = EventParser::new();
        let event = parser.parse(r#"data: {"type":"content","content":"Hello"}"#);
        assert_eq!(
            event,
            Some(StreamEvent::Content {
                delta: "Hello".into()
            })
        );
    }

    #[test]
    fn test_parse_citations_normalizes_records() {
        let mut parser = EventParser::new();
        let frame = r#"data: {"type":"citations","message_id":"m1","session_id":"s1","citations":[{"id":"c1","source_title":"Guide","page_number":0,"relevance_score":1.4,"chunk_text":"..."}]}"#;

        let Some(StreamEvent::Citations {
            citations,
            message_id,
            session_id,
        }) = parser.parse(frame)
        else {
            panic!("expected citations event");
        };
        assert_eq!(message_id.as_deref(), Some("m1"));
        assert_eq!(session_id.as_deref(), Some("s1"));
        assert_eq!(citations.len(), 1);
        assert_eq!(citations[0].page_number, None);
        assert_eq!(citations[0].relevance_score, Some(1.0));
    }

    #[test]
    fn test_parse_terminal_events() {
        let mut parser = EventParser::new();
        assert_eq!(parser.parse(r#"data: {"type":"done"}"#), Some(StreamEvent::Done));
        assert_eq!(
            parser.parse(r#"data: {"type":"error","error":"boom"}"#),
            Some(StreamEvent::Error {
                message: "boom".into()
            })
        );
        assert!(parser.parse(r#"data: {"type":"done"}"#).unwrap().is_terminal());
    }

    #[test]
    fn test_data_prefix_without_space() {
        let mut parser = EventParser::new();
        assert_eq!(parser.parse(r#"data:{"type":"done"}"#), Some(StreamEvent::Done));
    }

    #[test]
    fn test_non_data_frames_are_ignored() {
        let mut parser = EventParser::new();
        assert_eq!(parser.parse(""), None);
        assert_eq!(parser.parse(": keep-alive"), None);
        assert_eq!(parser.parse("event: message"), None);
        assert_eq!(parser.stats().ignored, 3);
        assert_eq!(parser.stats().malformed, 0);
    }

    #[test]
    fn test_malformed_frames_are_skipped() {
        let mut parser = EventParser::new();
        assert_eq!(parser.parse("data: {not json"), None);
        assert_eq!(parser.parse(r#"data: {"type":"mystery"}"#), None);
        assert!(matches!(
            parser.try_parse("data: []"),
            Err(StreamError::FrameParse(_))
        ));
        assert_eq!(parser.stats().malformed, 3);
    }

    #[test]
    fn test_error_event_falls_back_to_message_field() {
        let mut parser = EventParser::new();
        assert_eq!(
            parser.parse(r#"data: {"type":"error","message":"quota"}"#),
            Some(StreamEvent::Error {
                message: "quota".into()
            })
        );
    }
}
