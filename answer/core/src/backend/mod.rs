//! Upstream Backend Integration
//!
//! Abstracted access to the upstream completion and embedding services
//! through a common trait interface.
//!
//! # Available Backends
//!
//! - **OpenAI-compatible**: any `/chat/completions` + `/embeddings` service
//! - **Scripted**: deterministic replay for tests
//!
//! # Usage
//!
//! ```ignore
//! use answer_core::backend::{CompletionBackend, CompletionRequest, OpenAiCompatibleBackend};
//!
//! let backend = OpenAiCompatibleBackend::from_config(&config.upstream)?;
//! let request = CompletionRequest::new(system, user, "qwen2.5");
//! let bytes = backend.open_stream(&request).await?;
//! ```

mod openai;
mod scripted;
mod traits;

pub use openai::OpenAiCompatibleBackend;
pub use scripted::{FixedEmbedder, ScriptedBackend};
pub use traits::{BackendError, ByteStream, CompletionBackend, CompletionRequest, Embedder};
