//! Stream Relay
//!
//! Owns one client-facing response: sends `init`, pumps the upstream body
//! through the frame decoder, re-emits content in decode order while
//! accumulating it, and closes with exactly one terminal frame.
//!
//! The read loop checks the cancellation token before every read and again
//! right after each read resumes, so a stop takes effect within one
//! upstream read interval.

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use super::answer::AccumulatedAnswer;
use super::sink::ClientSink;
use super::state::RelayState;
use crate::backend::{CompletionBackend, CompletionRequest};
use crate::messages::{ClientFrame, RequestId};
use crate::transport::{FrameDecoder, UpstreamFrame};

/// How the upstream phase ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayOutcome {
    /// The upstream delivered content and finished
    Completed,
    /// The upstream failed or produced nothing usable
    Failed {
        /// Diagnostic description
        reason: String,
    },
    /// The request was cancelled
    Cancelled,
}

/// Per-request relay context
#[derive(Debug)]
pub struct StreamRelay {
    request_id: RequestId,
    sink: ClientSink,
    answer: AccumulatedAnswer,
    state: RelayState,
    cancel: CancellationToken,
}

impl StreamRelay {
    /// Create a relay writing to `sink`
    #[must_use]
    pub fn new(request_id: RequestId, sink: ClientSink, cancel: CancellationToken) -> Self {
        Self {
            request_id,
            sink,
            answer: AccumulatedAnswer::new(),
            state: RelayState::Idle,
            cancel,
        }
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> RelayState {
        self.state
    }

    /// Answer accumulated so far
    #[must_use]
    pub fn answer(&self) -> &AccumulatedAnswer {
        &self.answer
    }

    /// Whether the request has been cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether frames can still reach the client
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.state.is_closed() && self.sink.is_open()
    }

    fn transition(&mut self, next: RelayState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            tracing::warn!(
                request_id = %self.request_id,
                from = %self.state,
                to = %next,
                "Ignoring illegal relay transition"
            );
            return;
        }
        tracing::debug!(
            request_id = %self.request_id,
            from = %self.state,
            to = %next,
            "Relay state change"
        );
        self.state = next;
    }

    /// Send `init`
    ///
    /// Called before retrieval so the client sees a live stream before any
    /// model latency.
    pub async fn open(&mut self) {
        self.transition(RelayState::Opened);
        self.sink.emit(ClientFrame::Init).await;
    }

    /// Issue the upstream call and relay its body
    pub async fn pump(
        &mut self,
        backend: &dyn CompletionBackend,
        request: &CompletionRequest,
    ) -> RelayOutcome {
        if self.cancel.is_cancelled() {
            return RelayOutcome::Cancelled;
        }

        let opened = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return RelayOutcome::Cancelled,
            opened = backend.open_stream(request) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                return RelayOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        };
        self.transition(RelayState::Streaming);

        let mut decoder = FrameDecoder::new();
        let mut streamed = false;
        let mut finished = false;

        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return RelayOutcome::Cancelled,
                next = stream.next() => next,
            };
            if self.cancel.is_cancelled() {
                return RelayOutcome::Cancelled;
            }

            let frames = match next {
                Some(Ok(bytes)) => decoder.push(&bytes),
                Some(Err(e)) => {
                    return RelayOutcome::Failed {
                        reason: e.to_string(),
                    }
                }
                None => {
                    let tail = decoder.finish();
                    finished = true;
                    tail
                }
            };

            match self.relay_frames(frames).await {
                FrameBatch::Continue { delivered } => streamed |= delivered,
                FrameBatch::Done { delivered } => {
                    streamed |= delivered;
                    break;
                }
                FrameBatch::Error { message } => {
                    return RelayOutcome::Failed {
                        reason: format!("upstream error: {message}"),
                    };
                }
            }

            if self.cancel.is_cancelled() {
                return RelayOutcome::Cancelled;
            }
            if finished {
                tracing::debug!(
                    request_id = %self.request_id,
                    "Upstream closed without a terminal marker"
                );
                break;
            }
        }

        if streamed {
            RelayOutcome::Completed
        } else {
            RelayOutcome::Failed {
                reason: "upstream returned no content".to_string(),
            }
        }
    }

    /// Emit the deltas of one decoded batch as a single content frame
    async fn relay_frames(&mut self, frames: Vec<UpstreamFrame>) -> FrameBatch {
        let mut text = String::new();
        let mut end = None;

        for frame in frames {
            match frame {
                UpstreamFrame::Delta(delta) => text.push_str(&delta),
                UpstreamFrame::Done => {
                    end = Some(None);
                    break;
                }
                UpstreamFrame::Error(message) => {
                    end = Some(Some(message));
                    break;
                }
            }
        }

        let delivered = !text.is_empty();
        if delivered {
            self.emit_content(&text).await;
        }

        match end {
            None => FrameBatch::Continue { delivered },
            Some(None) => FrameBatch::Done { delivered },
            Some(Some(message)) => FrameBatch::Error { message },
        }
    }

    /// Append `text` to the answer and send it as content
    ///
    /// Returns whether the request is still live. After cancellation
    /// nothing is appended or sent.
    pub async fn emit_content(&mut self, text: &str) -> bool {
        if self.cancel.is_cancelled() || self.state.is_closed() {
            return false;
        }
        self.answer.append(text);
        self.sink.emit(ClientFrame::content(text)).await;
        !self.cancel.is_cancelled()
    }

    /// Switch to fallback delivery after an upstream failure
    pub async fn begin_fallback(&mut self, notice: &str) {
        self.transition(RelayState::Failing);
        self.answer.mark_fallback();
        self.sink.emit(ClientFrame::error(notice)).await;
    }

    /// Upstream finished normally
    pub fn complete(&mut self) {
        self.transition(RelayState::Completing);
    }

    /// Send a moderation notice if the client is still there
    pub async fn emit_notice(&mut self, message: &str) -> bool {
        if self.state.is_closed() {
            return false;
        }
        self.sink
            .emit(ClientFrame::ModerationNotice {
                message: message.to_string(),
            })
            .await
    }

    /// Stop the request: mark the answer and release the client
    pub async fn cancel(&mut self) {
        self.cancel.cancel();
        self.answer.mark_cancelled();
        self.transition(RelayState::Cancelling);
        self.close().await;
    }

    /// Send the terminal frame and enter `Closed`
    ///
    /// Idempotent.
    pub async fn close(&mut self) {
        if self.state.is_closed() {
            return;
        }
        self.sink.close().await;
        self.transition(RelayState::Closed);
        tracing::debug!(
            request_id = %self.request_id,
            frames = self.sink.frames_sent(),
            done = self.sink.done_sent(),
            "Relay closed"
        );
    }

    /// Take the accumulated answer
    #[must_use]
    pub fn into_answer(self) -> AccumulatedAnswer {
        self.answer
    }
}

enum FrameBatch {
    Continue { delivered: bool },
    Done { delivered: bool },
    Error { message: String },
}
