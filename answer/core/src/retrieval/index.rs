//! Knowledge Index
//!
//! In-memory knowledge base loaded from a JSON file. Serves both lookup
//! paths: cosine similarity over stored embeddings, and character-bigram
//! overlap for the keyword fallback.
//!
//! # File Format
//!
//! ```json
//! [
//!   { "subject": "刑法", "path": "刑法/总则/正当防卫",
//!     "text": "正当防卫是指……", "embedding": [0.12, -0.03] }
//! ]
//! ```
//!
//! `embedding` is optional; missing vectors can be filled at startup with
//! [`KnowledgeIndex::fill_embeddings`].

use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::{ContextChunk, KeywordSearch, RetrievalError, VectorSearch};
use crate::backend::{BackendError, Embedder};
use crate::classify::Subject;

/// One knowledge entry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    /// Owning subject
    pub subject: Subject,
    /// Origin label
    pub path: String,
    /// Entry text
    pub text: String,
    /// Precomputed embedding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl KnowledgeEntry {
    fn to_chunk(&self, score: f32) -> ContextChunk {
        ContextChunk {
            text: self.text.clone(),
            path: self.path.clone(),
            score,
            subject: self.subject,
        }
    }
}

/// Searchable knowledge base
#[derive(Debug, Default)]
pub struct KnowledgeIndex {
    entries: RwLock<Vec<KnowledgeEntry>>,
}

impl KnowledgeIndex {
    /// Build an index from entries
    #[must_use]
    pub fn from_entries(entries: Vec<KnowledgeEntry>) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Load an index file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a JSON array
    /// of entries.
    pub async fn load(path: &Path) -> Result<Self, RetrievalError> {
        let raw = tokio::fs::read_to_string(path).await?;
        let entries: Vec<KnowledgeEntry> = serde_json::from_str(&raw)?;
        tracing::info!(
            path = %path.display(),
            entries = entries.len(),
            "Loaded knowledge index"
        );
        Ok(Self::from_entries(entries))
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the index has no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Embed entries that have no vector yet
    ///
    /// Best effort: entries whose embedding fails are left without one and
    /// only serve the keyword path. An unreachable embedder ends the pass at
    /// the first failure instead of timing out once per entry. Returns the
    /// number of entries filled.
    pub async fn fill_embeddings(&self, embedder: &dyn Embedder) -> usize {
        let pending: Vec<(usize, String)> = self
            .entries
            .read()
            .iter()
            .enumerate()
            .filter(|(_, e)| e.embedding.is_none())
            .map(|(i, e)| (i, e.text.clone()))
            .collect();

        let total = pending.len();
        let mut filled = 0;
        for (attempted, (index, text)) in pending.into_iter().enumerate() {
            match embedder.embed(&text).await {
                Ok(vector) => {
                    if let Some(entry) = self.entries.write().get_mut(index) {
                        entry.embedding = Some(vector);
                        filled += 1;
                    }
                }
                Err(e @ BackendError::Transport(_)) => {
                    tracing::warn!(
                        error = %e,
                        skipped = total - attempted,
                        "Embedder unreachable, remaining entries are keyword-only"
                    );
                    break;
                }
                Err(e) => {
                    tracing::warn!(index, error = %e, "Failed to embed knowledge entry");
                }
            }
        }
        filled
    }
}

/// Cosine similarity clamped to [0, 1]
fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(0.0, 1.0)
}

/// Character bigrams of the alphanumeric content of `text`
fn bigrams(text: &str) -> HashSet<(char, char)> {
    let chars: Vec<char> = text
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect();
    chars.windows(2).map(|w| (w[0], w[1])).collect()
}

/// Share of the query's bigrams found in `text`
fn overlap(query: &HashSet<(char, char)>, text: &str) -> f32 {
    if query.is_empty() {
        return 0.0;
    }
    let target = bigrams(text);
    let hits = query.iter().filter(|b| target.contains(b)).count();
    #[allow(clippy::cast_precision_loss)]
    let score = hits as f32 / query.len() as f32;
    score
}

fn top_k(mut scored: Vec<ContextChunk>, k: usize) -> Vec<ContextChunk> {
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    scored.truncate(k);
    scored
}

#[async_trait]
impl VectorSearch for KnowledgeIndex {
    async fn vector_search(
        &self,
        subject: Subject,
        embedding: &[f32],
        k: usize,
    ) -> Result<Vec<ContextChunk>, RetrievalError> {
        let scored = self
            .entries
            .read()
            .iter()
            .filter(|e| e.subject == subject)
            .filter_map(|e| {
                let vector = e.embedding.as_deref()?;
                Some(e.to_chunk(cosine(embedding, vector)))
            })
            .collect();
        Ok(top_k(scored, k))
    }
}

#[async_trait]
impl KeywordSearch for KnowledgeIndex {
    async fn keyword_search(
        &self,
        text: &str,
        subject: Subject,
        k: usize,
    ) -> Result<Vec<ContextChunk>, RetrievalError> {
        let query = bigrams(text);
        let scored = self
            .entries
            .read()
            .iter()
            .filter(|e| e.subject == subject)
            .map(|e| e.to_chunk(overlap(&query, &e.text)))
            .filter(|c| c.score > 0.0)
            .collect();
        Ok(top_k(scored, k))
    }
}
