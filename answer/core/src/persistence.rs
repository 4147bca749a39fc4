//! Answer Persistence
//!
//! Collaborators behind the final durable write and the detached
//! knowledge-extraction job that follows it.
//!
//! ```text
//! finalize ──▶ AnswerStore::save_answer   (one write per request)
//!          └─▶ spawn(ExtractionScheduler::extract)   (detached, logged only)
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;

use crate::classify::Subject;

/// The durable record of one answer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedMessage {
    /// Chat/session the answer belongs to
    pub chat_id: String,
    /// Final text, after moderation
    pub text: String,
    /// Structured extras (subject, flags, moderation reason)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// The client stopped the answer before it finished
    #[serde(default)]
    pub interrupted: bool,
    /// When the record was created
    pub created_at: DateTime<Utc>,
}

impl PersistedMessage {
    /// Create a record stamped now
    pub fn new(chat_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            text: text.into(),
            metadata: None,
            interrupted: false,
            created_at: Utc::now(),
        }
    }

    /// Attach metadata
    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Mark as interrupted
    #[must_use]
    pub fn interrupted(mut self) -> Self {
        self.interrupted = true;
        self
    }
}

/// Errors raised by persistence collaborators
#[derive(Debug, Error)]
pub enum StoreError {
    /// File I/O failed
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The record could not be encoded or decoded
    #[error("store encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    /// A remote collaborator failed
    #[error("remote call failed: {0}")]
    Remote(String),

    /// The store refuses writes
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Durable answer store
#[async_trait]
pub trait AnswerStore: Send + Sync {
    /// Write one answer
    async fn save_answer(&self, message: &PersistedMessage) -> Result<(), StoreError>;
}

/// Knowledge-point extraction collaborator
#[async_trait]
pub trait ExtractionScheduler: Send + Sync {
    /// Extract knowledge labels from a stored answer
    async fn extract(
        &self,
        chat_id: &str,
        text: &str,
        subject: Subject,
    ) -> Result<Vec<String>, StoreError>;
}

/// Run an extraction as a detached task
///
/// The returned handle may be dropped; the outcome is only logged.
pub fn schedule_extraction(
    scheduler: Arc<dyn ExtractionScheduler>,
    chat_id: String,
    text: String,
    subject: Subject,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match scheduler.extract(&chat_id, &text, subject).await {
            Ok(labels) => {
                tracing::info!(chat_id = %chat_id, %subject, labels = ?labels, "Knowledge extraction finished");
            }
            Err(e) => {
                tracing::warn!(chat_id = %chat_id, %subject, error = %e, "Knowledge extraction failed");
            }
        }
    })
}

// ============================================================================
// Stores
// ============================================================================

/// Appends one JSON line per answer to a file
#[derive(Debug)]
pub struct JsonlAnswerStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlAnswerStore {
    /// Store writing to `path`; parent directories are created on demand
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Target file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every stored record
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or a line is malformed.
    pub async fn read_all(&self) -> Result<Vec<PersistedMessage>, StoreError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(StoreError::from))
            .collect()
    }
}

#[async_trait]
impl AnswerStore for JsonlAnswerStore {
    async fn save_answer(&self, message: &PersistedMessage) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// In-process store
#[derive(Debug, Default)]
pub struct MemoryAnswerStore {
    messages: Mutex<Vec<PersistedMessage>>,
    unavailable: bool,
}

impl MemoryAnswerStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that rejects every write
    #[must_use]
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    /// Stored records, oldest first
    #[must_use]
    pub fn messages(&self) -> Vec<PersistedMessage> {
        self.messages.lock().clone()
    }
}

#[async_trait]
impl AnswerStore for MemoryAnswerStore {
    async fn save_answer(&self, message: &PersistedMessage) -> Result<(), StoreError> {
        if self.unavailable {
            return Err(StoreError::Unavailable("writes disabled".to_string()));
        }
        self.messages.lock().push(message.clone());
        Ok(())
    }
}

// ============================================================================
// Extraction
// ============================================================================

/// Posts answers to a remote knowledge-extraction endpoint
#[derive(Clone, Debug)]
pub struct HttpExtractionScheduler {
    url: String,
    http_client: reqwest::Client,
}

impl HttpExtractionScheduler {
    /// Scheduler posting to `url`
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(url: impl Into<String>) -> Result<Self, StoreError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| StoreError::Remote(e.to_string()))?;
        Ok(Self {
            url: url.into(),
            http_client,
        })
    }
}

#[async_trait]
impl ExtractionScheduler for HttpExtractionScheduler {
    async fn extract(
        &self,
        chat_id: &str,
        text: &str,
        subject: Subject,
    ) -> Result<Vec<String>, StoreError> {
        let body = serde_json::json!({
            "chatId": chat_id,
            "text": text,
            "subject": subject.label(),
        });

        let response = self
            .http_client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| StoreError::Remote(e.to_string()))?;

        if !response.status().is_success() {
            return Err(StoreError::Remote(format!(
                "extraction endpoint returned {}",
                response.status()
            )));
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| StoreError::Remote(e.to_string()))?;

        Ok(data
            .get("labels")
            .and_then(Value::as_array)
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Local extraction from the subject keyword table
#[derive(Clone, Copy, Debug, Default)]
pub struct KeywordExtractionScheduler;

#[async_trait]
impl ExtractionScheduler for KeywordExtractionScheduler {
    async fn extract(
        &self,
        _chat_id: &str,
        text: &str,
        subject: Subject,
    ) -> Result<Vec<String>, StoreError> {
        Ok(subject
            .keywords()
            .iter()
            .filter(|keyword| text.contains(*keyword))
            .map(|keyword| (*keyword).to_string())
            .collect())
    }
}
