//! Client Sink
//!
//! Guarded write side of one client stream. Every write goes through
//! [`ClientSink::emit`], which never fails: once the client is gone or the
//! request is cancelled, writes become no-ops. [`ClientSink::close`] sends
//! the terminal frame at most once.
//!
//! A watcher task cancels the request as soon as the receiving side is
//! dropped, so a disconnect is noticed even while the upstream is silent.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::messages::ClientFrame;

/// Write side of a client stream
#[derive(Debug)]
pub struct ClientSink {
    tx: Option<mpsc::Sender<ClientFrame>>,
    cancel: CancellationToken,
    watcher: Option<JoinHandle<()>>,
    frames_sent: usize,
    done_sent: bool,
}

impl ClientSink {
    /// Wrap `tx`; a dropped receiver cancels `cancel`
    #[must_use]
    pub fn new(tx: mpsc::Sender<ClientFrame>, cancel: CancellationToken) -> Self {
        let watch_tx = tx.clone();
        let token = cancel.clone();
        let watcher = tokio::spawn(async move {
            tokio::select! {
                () = watch_tx.closed() => {
                    tracing::debug!("Client went away, cancelling request");
                    token.cancel();
                }
                () = token.cancelled() => {}
            }
        });

        Self {
            tx: Some(tx),
            cancel,
            watcher: Some(watcher),
            frames_sent: 0,
            done_sent: false,
        }
    }

    /// Send a non-terminal frame
    ///
    /// Returns whether the frame was delivered. Never sends after
    /// [`close`](Self::close) or after cancellation.
    pub async fn emit(&mut self, frame: ClientFrame) -> bool {
        if frame.is_terminal() {
            self.close().await;
            return self.done_sent;
        }
        let Some(tx) = self.tx.as_ref() else {
            return false;
        };
        if self.cancel.is_cancelled() {
            return false;
        }

        let sent = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return false,
            result = tx.send(frame) => result.is_ok(),
        };

        if sent {
            self.frames_sent += 1;
        } else {
            // Receiver dropped between checks
            self.tx = None;
            self.cancel.cancel();
        }
        sent
    }

    /// Send the terminal frame and release the channel
    ///
    /// Idempotent. After cancellation the terminal frame is only offered
    /// without waiting, so a vanished client cannot block the close.
    pub async fn close(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        let Some(tx) = self.tx.take() else {
            return;
        };

        self.done_sent = if self.cancel.is_cancelled() {
            tx.try_send(ClientFrame::Done).is_ok()
        } else {
            tx.send(ClientFrame::Done).await.is_ok()
        };
        if self.done_sent {
            self.frames_sent += 1;
        }
    }

    /// Whether writes can still reach the client
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Frames delivered so far, terminal frame included
    #[must_use]
    pub fn frames_sent(&self) -> usize {
        self.frames_sent
    }

    /// Whether the terminal frame was delivered
    #[must_use]
    pub fn done_sent(&self) -> bool {
        self.done_sent
    }
}

impl Drop for ClientSink {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}
