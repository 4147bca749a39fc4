//! Answer Core - Streaming Retrieval-Augmented Answer Pipeline
//!
//! This crate answers one study question at a time: it picks a subject,
//! retrieves grounding context under a deadline, streams the upstream
//! model's answer to the client frame by frame, falls back to a templated
//! answer when the model fails, and moderates and stores the final text.
//! It has no HTTP server inside; `answer-daemon` puts it on the network.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Client (SSE body)                          │
//! └───────────────────────────────▲──────────────────────────────────┘
//!                                 │ ClientFrame (init/content/.../done)
//! ┌───────────────────────────────┼──────────────────────────────────┐
//! │                         ANSWER CORE                               │
//! │  ┌────────────┐  ┌───────────┐  ┌─────────┐  ┌─────────────────┐ │
//! │  │  Classify  │─▶│ Retrieval │─▶│ Prompt  │─▶│   StreamRelay   │ │
//! │  └────────────┘  └───────────┘  └─────────┘  │  + FrameDecoder │ │
//! │                                              └────────┬────────┘ │
//! │                  ┌──────────┐  ┌──────────┐           │          │
//! │                  │ Finalize │◀─│ Fallback │◀──────────┘          │
//! │                  └────┬─────┘  └──────────┘                      │
//! └───────────────────────┼──────────────────────────────────────────┘
//!                         ▼
//!               AnswerStore / ExtractionScheduler
//! ```
//!
//! # Key Types
//!
//! - [`AnswerPipeline`]: runs one request end to end
//! - [`StreamRelay`]: owns the client-facing stream of one request
//! - [`FrameDecoder`]: incremental decoder for the upstream event stream
//! - [`RetrievalCoordinator`]: deadline-bounded context lookup
//! - [`ActiveRequests`]: cancellation tokens of in-flight requests
//! - [`PipelineConfig`]: layered configuration
//!
//! # Quick Start
//!
//! ```ignore
//! use answer_core::{load_config, AnswerPipeline, Question, RequestId};
//! use tokio::sync::mpsc;
//! use tokio_util::sync::CancellationToken;
//!
//! let config = load_config()?;
//! let pipeline = AnswerPipeline::from_config(&config).await?;
//!
//! let (tx, mut rx) = mpsc::channel(64);
//! let question = Question::new("什么是正当防卫").with_session("chat-1");
//! tokio::spawn(async move {
//!     pipeline.run(RequestId::new(), question, tx, CancellationToken::new()).await
//! });
//! while let Some(frame) = rx.recv().await {
//!     print!("{}", answer_core::transport::encode(&frame));
//! }
//! ```

pub mod backend;
pub mod cancel;
pub mod classify;
pub mod config;
pub mod fallback;
pub mod finalize;
pub mod messages;
pub mod moderation;
pub mod persistence;
pub mod pipeline;
pub mod prompt;
pub mod relay;
pub mod retrieval;
pub mod transport;

// Re-exports for convenience
pub use backend::{
    BackendError, CompletionBackend, CompletionRequest, Embedder, OpenAiCompatibleBackend,
    ScriptedBackend,
};
pub use cancel::{ActiveRequests, RequestGuard};
pub use classify::Subject;
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, PipelineConfig,
};
pub use fallback::FallbackSynthesizer;
pub use finalize::{FinalizeStage, Finalized, REJECTION_PLACEHOLDER};
pub use messages::{AnswerRequest, ClientFrame, Question, RequestId};
pub use moderation::{ModerationResult, Moderator, TermModerator};
pub use persistence::{AnswerStore, ExtractionScheduler, MemoryAnswerStore, PersistedMessage};
pub use pipeline::{AnswerOutcome, AnswerPipeline, PipelineError, RunSummary};
pub use relay::{AccumulatedAnswer, ClientSink, RelayState, StreamRelay, CANCELLATION_MARKER};
pub use retrieval::{ContextChunk, RetrievalCoordinator};
pub use transport::{FrameDecoder, UpstreamFrame};
