//! Upstream Backend Traits
//!
//! The pipeline talks to the upstream completion service through
//! [`CompletionBackend`] and to the embedding service through [`Embedder`].
//! Both are object-safe so collaborators can be swapped for scripted ones
//! in tests.
//!
//! A backend only opens the byte stream. Decoding happens in the relay
//! through the frame codec, so every backend shares the same carry-over
//! handling.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;

/// Errors raised by upstream collaborators
#[derive(Debug, Error)]
pub enum BackendError {
    /// The request could not be sent
    #[error("upstream unreachable: {0}")]
    Transport(String),

    /// The upstream answered with a non-success status
    #[error("upstream returned {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body, possibly truncated
        body: String,
    },

    /// Reading the response body failed mid-stream
    #[error("upstream stream failed: {0}")]
    Stream(String),

    /// The response was not in the expected shape
    #[error("invalid upstream response: {0}")]
    InvalidResponse(String),
}

/// Raw upstream body, chunked however the network delivered it
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, BackendError>> + Send>>;

/// One completion request
#[derive(Clone, Debug, PartialEq)]
pub struct CompletionRequest {
    /// Model identifier
    pub model: String,
    /// Instruction preamble
    pub system: String,
    /// User turn: context, question and markers
    pub user: String,
    /// Image forwarded alongside the user turn
    pub image_ref: Option<String>,
    /// Maximum tokens in response (0 = default)
    pub max_tokens: u32,
    /// Sampling temperature
    pub temperature: f32,
}

impl CompletionRequest {
    /// Create a request with system and user turns
    pub fn new(
        system: impl Into<String>,
        user: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            model: model.into(),
            system: system.into(),
            user: user.into(),
            image_ref: None,
            max_tokens: 0,
            temperature: 0.7,
        }
    }

    /// Attach an image reference
    #[must_use]
    pub fn with_image(mut self, image_ref: Option<String>) -> Self {
        self.image_ref = image_ref;
        self
    }

    /// Set temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature.clamp(0.0, 2.0);
        self
    }

    /// Set max tokens
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Upstream completion service
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Check if the backend is healthy and reachable
    async fn health_check(&self) -> bool;

    /// Issue a streaming completion and return its raw body
    ///
    /// Errors here mean no byte was received; errors inside the stream
    /// arrive as `Err` items.
    async fn open_stream(&self, request: &CompletionRequest) -> Result<ByteStream, BackendError>;
}

/// Text embedding service
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed one text
    async fn embed(&self, text: &str) -> Result<Vec<f32>, BackendError>;
}
