//! Stream Driver
//!
//! The async loop that pumps transport bytes through the pipeline into a
//! [`StreamSession`].
//!
//! ```text
//! transport.open() ─▶ loop {
//!     select! {
//!         cancel.cancelled()        => seal Cancelled(User), drop connection
//!         pull(stream, idle_timeout) => {
//!             Chunk  → FrameReader → EventParser → session.apply()
//!             Failed → session.fail()
//!             Eof    → reader.finish(), session.finish_input()
//!             Idle   → seal Cancelled(TimedOut), drop connection
//!         }
//!     }
//! }
//! ```
//!
//! The loop returns as soon as the request is sealed. Frames after a terminal
//! event are never read.
//!
//! Publishing an update waits for room on the channel, but that wait is
//! raced against the cancellation token and bounded by the idle timeout, the
//! same as waiting for bytes. A receiver that stops reading cannot pin the
//! connection open.

use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::controller::{Applied, Outcome, StreamStats};
use super::error::{CancelReason, StreamError};
use super::event::{EventParser, StreamEvent};
use super::frame::FrameReader;
use crate::backend::{ByteStream, ChatTransport};
use crate::citations::CitationGroup;
use crate::session::{ConversationTurn, StreamSession};

/// Progress notification published while a turn streams
#[derive(Clone, Debug, PartialEq)]
pub enum StreamUpdate {
    /// Request accepted locally; the user turn was appended
    Started {
        /// The user turn
        user_turn: ConversationTurn,
    },
    /// Assistant text arrived
    Content {
        /// Text to append
        delta: String,
    },
    /// The grouped citation view changed
    Citations {
        /// Current groups
        groups: Vec<CitationGroup>,
    },
    /// The request ended
    Sealed {
        /// How it ended
        outcome: Outcome,
        /// Turn appended to the transcript, if any
        turn: Option<ConversationTurn>,
    },
}

/// Result of [`StreamSession::send`]
#[derive(Clone, Debug)]
pub struct TurnOutcome {
    /// How the request ended
    pub outcome: Outcome,
    /// Turn appended to the transcript (assistant or error turn)
    pub turn: Option<ConversationTurn>,
    /// Raw failure detail for failed or cancelled requests
    pub failure: Option<StreamError>,
    /// Request statistics
    pub stats: StreamStats,
}

/// One step of reading the response body
enum Pull {
    Chunk(Bytes),
    Failed(StreamError),
    Eof,
    Idle,
}

async fn pull(stream: &mut ByteStream, idle_timeout: Option<Duration>) -> Pull {
    let next = match idle_timeout {
        Some(limit) => match tokio::time::timeout(limit, stream.next()).await {
            Ok(next) => next,
            Err(_) => return Pull::Idle,
        },
        None => stream.next().await,
    };
    match next {
        Some(Ok(chunk)) => Pull::Chunk(chunk),
        Some(Err(e)) => Pull::Failed(e),
        None => Pull::Eof,
    }
}

/// Deliver one update, giving up when the request is cancelled or stalls
///
/// Returns the reason delivery was abandoned.
async fn publish(
    updates: Option<&mpsc::Sender<StreamUpdate>>,
    update: StreamUpdate,
    cancel: &CancellationToken,
    idle_timeout: Option<Duration>,
) -> Result<(), CancelReason> {
    let Some(tx) = updates else {
        return Ok(());
    };
    let send = async {
        // A closed receiver only means nobody is watching
        match idle_timeout {
            Some(limit) => tokio::time::timeout(limit, tx.send(update))
                .await
                .map(|_| ())
                .map_err(|_| CancelReason::TimedOut),
            None => {
                let _ = tx.send(update).await;
                Ok(())
            }
        }
    };

    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(CancelReason::User),
        sent = send => sent,
    }
}

impl StreamSession {
    /// Send `query` and stream the answer into this session
    ///
    /// Returns once the request is sealed: completed, failed, or cancelled
    /// through `cancel` or the idle timeout. Progress is published on
    /// `updates` when given; a slow receiver slows the stream down, and one
    /// that stays full past the idle timeout abandons the request.
    ///
    /// # Errors
    ///
    /// Only caller errors are returned as `Err` (`RequestInFlight`,
    /// `InvalidRequest`); nothing is sent in that case. Stream failures are
    /// reported through the returned [`TurnOutcome`].
    pub async fn send<T>(
        &mut self,
        transport: &T,
        query: &str,
        cancel: &CancellationToken,
        updates: Option<&mpsc::Sender<StreamUpdate>>,
    ) -> Result<TurnOutcome, StreamError>
    where
        T: ChatTransport + ?Sized,
    {
        let request = self.begin(query)?;
        let idle_timeout = self.options.idle_timeout;
        if let Some(user_turn) = self.transcript().last().cloned() {
            let started = StreamUpdate::Started { user_turn };
            if let Err(reason) = publish(updates, started, cancel, idle_timeout).await {
                return Ok(self.abandon(reason, updates, cancel).await);
            }
        }

        let opened = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            opened = transport.open(&request) => Some(opened),
        };
        let mut stream = match opened {
            None => return Ok(self.abandon(CancelReason::User, updates, cancel).await),
            Some(Err(e)) => {
                let applied = self.fail(e);
                return Ok(self.seal_with(applied, updates, cancel).await);
            }
            Some(Ok(stream)) => stream,
        };
        debug!(transport = transport.name(), "Response stream open");

        let mut reader = FrameReader::with_max_frame_bytes(self.options.max_frame_bytes);
        let mut parser = EventParser::new();

        let applied = 'read: loop {
            let step = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!(conversation = %self.id(), "Request cancelled");
                    break 'read self.cancel(CancelReason::User);
                }
                step = pull(&mut stream, idle_timeout) => step,
            };

            match step {
                Pull::Chunk(chunk) => {
                    for frame in reader.feed(&chunk) {
                        let event = match frame {
                            Ok(frame) => parser.parse(&frame),
                            Err(e) => {
                                warn!(error = %e, "Skipping undecodable frame");
                                None
                            }
                        };
                        let Some(event) = event else { continue };

                        let delta = match &event {
                            StreamEvent::Content { delta } => Some(delta.clone()),
                            _ => None,
                        };
                        let is_citations = matches!(event, StreamEvent::Citations { .. });

                        let update = match self.apply(event) {
                            sealed @ Applied::Sealed(_) => break 'read sealed,
                            Applied::Updated => match delta {
                                Some(delta) => Some(StreamUpdate::Content { delta }),
                                None if is_citations => Some(StreamUpdate::Citations {
                                    groups: self
                                        .controller()
                                        .map(|c| c.citation_groups().to_vec())
                                        .unwrap_or_default(),
                                }),
                                None => None,
                            },
                            Applied::Ignored => None,
                        };

                        if let Some(update) = update {
                            if let Err(reason) =
                                publish(updates, update, cancel, idle_timeout).await
                            {
                                warn!(
                                    conversation = %self.id(),
                                    reason = %reason,
                                    "Update receiver stalled; abandoning request"
                                );
                                break 'read self.cancel(reason);
                            }
                        }
                    }
                }
                Pull::Failed(e) => break 'read self.fail(e),
                Pull::Eof => {
                    reader.finish();
                    let stats = parser.stats();
                    debug!(
                        parsed = stats.parsed,
                        ignored = stats.ignored,
                        malformed = stats.malformed,
                        "Response body ended"
                    );
                    break 'read self.finish_input();
                }
                Pull::Idle => {
                    warn!(
                        conversation = %self.id(),
                        idle_secs = idle_timeout.map(|d| d.as_secs()).unwrap_or_default(),
                        "No data within idle timeout"
                    );
                    break 'read self.cancel(CancelReason::TimedOut);
                }
            }
        };

        // Close the connection before the final update is published
        drop(stream);
        Ok(self.seal_with(applied, updates, cancel).await)
    }

    /// Cancel the request in flight and seal it
    async fn abandon(
        &mut self,
        reason: CancelReason,
        updates: Option<&mpsc::Sender<StreamUpdate>>,
        cancel: &CancellationToken,
    ) -> TurnOutcome {
        let applied = self.cancel(reason);
        self.seal_with(applied, updates, cancel).await
    }

    /// Build the outcome of a sealed request and publish it
    ///
    /// The final update is best effort: it is dropped when the receiver is
    /// full past the idle timeout or the request was cancelled.
    async fn seal_with(
        &self,
        applied: Applied,
        updates: Option<&mpsc::Sender<StreamUpdate>>,
        cancel: &CancellationToken,
    ) -> TurnOutcome {
        let turn = match applied {
            Applied::Sealed(turn) => turn,
            Applied::Ignored | Applied::Updated => None,
        };
        let controller = self.controller();
        let outcome = controller
            .and_then(|c| c.outcome())
            .unwrap_or(Outcome::Failed);

        let sealed = StreamUpdate::Sealed {
            outcome,
            turn: turn.clone(),
        };
        if let Err(reason) = publish(updates, sealed, cancel, self.options.idle_timeout).await {
            debug!(reason = %reason, "Final update not delivered");
        }

        TurnOutcome {
            outcome,
            turn,
            failure: controller.and_then(|c| c.failure().cloned()),
            stats: controller.map(|c| c.stats().clone()).unwrap_or_default(),
        }
    }
}
