//! Context Retrieval
//!
//! Finds knowledge snippets that ground the prompt. Two lookup paths sit
//! behind traits so any store can serve them:
//!
//! ```text
//!                    ┌─ embed ─▶ VectorSearch ──┐  (deadline)
//!  question ─────────┤                          ├──▶ floor ─▶ rank ─▶ chunks
//!                    └───── KeywordSearch ──────┘  (shorter timeout, only
//!                                                   if the vector path failed)
//! ```
//!
//! Every failure on either path degrades to "no context"; retrieval never
//! fails a request.

mod coordinator;
mod index;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::BackendError;
use crate::classify::Subject;

pub use coordinator::{rank, RetrievalCoordinator};
pub use index::{KnowledgeEntry, KnowledgeIndex};

/// A retrieved knowledge snippet
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContextChunk {
    /// Snippet text
    pub text: String,
    /// Origin label, e.g. `刑法/总则/正当防卫`
    pub path: String,
    /// Similarity in [0, 1]
    pub score: f32,
    /// Subject the snippet belongs to
    pub subject: Subject,
}

/// Errors raised by retrieval collaborators
#[derive(Debug, Error)]
pub enum RetrievalError {
    /// The question could not be embedded
    #[error("embedding failed: {0}")]
    Embedding(#[from] BackendError),

    /// The index could not be read
    #[error("failed to read knowledge index: {0}")]
    Io(#[from] std::io::Error),

    /// The index file is malformed
    #[error("malformed knowledge index: {0}")]
    Format(#[from] serde_json::Error),

    /// The search backend failed
    #[error("search failed: {0}")]
    Search(String),
}

/// Similarity lookup over precomputed embeddings
#[async_trait]
pub trait VectorSearch: Send + Sync {
    /// Return up to `k` chunks of `subject` closest to `embedding`
    async fn vector_search(
        &self,
        subject: Subject,
        embedding: &[f32],
        k: usize,
    ) -> Result<Vec<ContextChunk>, RetrievalError>;
}

/// Term-overlap lookup used when the vector path yields nothing
#[async_trait]
pub trait KeywordSearch: Send + Sync {
    /// Return up to `k` chunks of `subject` matching `text`
    async fn keyword_search(
        &self,
        text: &str,
        subject: Subject,
        k: usize,
    ) -> Result<Vec<ContextChunk>, RetrievalError>;
}
