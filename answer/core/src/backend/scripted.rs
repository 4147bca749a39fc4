//! Scripted Backend
//!
//! Deterministic in-process backend that replays a fixed script of byte
//! chunks. Used by the pipeline and daemon test suites.
//!
//! ```ignore
//! let backend = ScriptedBackend::from_deltas(&["正当防卫", "是指..."]);
//! let backend = ScriptedBackend::failing("connection refused");
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;

use super::traits::{BackendError, ByteStream, CompletionBackend, CompletionRequest, Embedder};
use crate::transport::UpstreamFrame;

#[derive(Clone, Debug)]
struct ScriptStep {
    delay: Duration,
    item: Result<Vec<u8>, String>,
}

/// Backend that replays scripted chunks
#[derive(Clone, Debug, Default)]
pub struct ScriptedBackend {
    steps: Vec<ScriptStep>,
    open_error: Option<String>,
    hang_after_script: bool,
    healthy: bool,
    requests: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl ScriptedBackend {
    /// Empty script: the stream ends immediately
    #[must_use]
    pub fn new() -> Self {
        Self {
            healthy: true,
            ..Default::default()
        }
    }

    /// Stream each delta as its own frame, then the terminal marker
    #[must_use]
    pub fn from_deltas(deltas: &[&str]) -> Self {
        deltas
            .iter()
            .fold(Self::new(), |backend, delta| {
                backend.frame(&UpstreamFrame::Delta((*delta).to_string()))
            })
            .frame(&UpstreamFrame::Done)
    }

    /// Fail before any byte is produced
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            open_error: Some(message.into()),
            healthy: false,
            ..Self::new()
        }
    }

    /// Append an encoded upstream frame
    #[must_use]
    pub fn frame(self, frame: &UpstreamFrame) -> Self {
        self.chunk(frame.encode().into_bytes())
    }

    /// Append raw bytes
    #[must_use]
    pub fn chunk(self, bytes: impl Into<Vec<u8>>) -> Self {
        self.delayed_chunk(Duration::ZERO, bytes)
    }

    /// Append raw bytes delivered after `delay`
    #[must_use]
    pub fn delayed_chunk(mut self, delay: Duration, bytes: impl Into<Vec<u8>>) -> Self {
        self.steps.push(ScriptStep {
            delay,
            item: Ok(bytes.into()),
        });
        self
    }

    /// Append a read error
    #[must_use]
    pub fn stream_error(mut self, message: impl Into<String>) -> Self {
        self.steps.push(ScriptStep {
            delay: Duration::ZERO,
            item: Err(message.into()),
        });
        self
    }

    /// Keep the stream open forever once the script is exhausted
    #[must_use]
    pub fn hang(mut self) -> Self {
        self.hang_after_script = true;
        self
    }

    /// Requests received so far
    #[must_use]
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn health_check(&self) -> bool {
        self.healthy
    }

    async fn open_stream(&self, request: &CompletionRequest) -> Result<ByteStream, BackendError> {
        self.requests.lock().push(request.clone());

        if let Some(ref message) = self.open_error {
            return Err(BackendError::Transport(message.clone()));
        }

        let script = futures::stream::iter(self.steps.clone()).then(|step| async move {
            if !step.delay.is_zero() {
                tokio::time::sleep(step.delay).await;
            }
            step.item.map_err(BackendError::Stream)
        });

        if self.hang_after_script {
            Ok(Box::pin(script.chain(futures::stream::pending())))
        } else {
            Ok(Box::pin(script))
        }
    }
}

/// Embedder returning a fixed vector, or failing
#[derive(Clone, Debug)]
pub struct FixedEmbedder {
    vector: Option<Vec<f32>>,
    delay: Duration,
}

impl FixedEmbedder {
    /// Always return `vector`
    #[must_use]
    pub fn new(vector: Vec<f32>) -> Self {
        Self {
            vector: Some(vector),
            delay: Duration::ZERO,
        }
    }

    /// Always fail
    #[must_use]
    pub fn failing() -> Self {
        Self {
            vector: None,
            delay: Duration::ZERO,
        }
    }

    /// Answer only after `delay`
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl Embedder for FixedEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, BackendError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.vector
            .clone()
            .ok_or_else(|| BackendError::Transport("embedder unavailable".to_string()))
    }
}
