//! Answer Pipeline
//!
//! Wires the stages together for one request.
//!
//! ```text
//!  Question
//!     │  init
//!     ▼
//!  resolve subject ─▶ retrieve (bounded) ─▶ assemble prompt
//!                                                │
//!                                                ▼
//!                                     StreamRelay::pump(upstream)
//!                                   ┌────────────┼──────────────┐
//!                              Completed      Failed        Cancelled
//!                                   │      error + fallback      │
//!                                   ▼            ▼               ▼
//!                               moderate ◀───────┘        mark interrupted
//!                                   │ notice?                    │
//!                                   ▼                            ▼
//!                                 done ─▶ persist ─▶ extract   done? ─▶ persist
//! ```
//!
//! The client always sees exactly one `done`. Everything after it is
//! invisible to the client and cannot change what it already received.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendError, CompletionBackend, CompletionRequest, OpenAiCompatibleBackend};
use crate::classify::{self, Subject};
use crate::config::{PipelineConfig, UpstreamConfig};
use crate::fallback::FallbackSynthesizer;
use crate::finalize::FinalizeStage;
use crate::messages::{ClientFrame, Question, RequestId};
use crate::moderation::TermModerator;
use crate::persistence::{
    AnswerStore, ExtractionScheduler, HttpExtractionScheduler, JsonlAnswerStore,
    KeywordExtractionScheduler, MemoryAnswerStore, PersistedMessage, StoreError,
};
use crate::prompt;
use crate::relay::{ClientSink, RelayOutcome, StreamRelay};
use crate::retrieval::{KnowledgeIndex, RetrievalCoordinator, RetrievalError};

/// Separates partial upstream content from fallback content
const FALLBACK_SEPARATOR: &str = "\n\n";

/// Errors raised while building a pipeline from configuration
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The upstream client could not be built
    #[error("upstream client: {0}")]
    Backend(#[from] BackendError),

    /// The knowledge index could not be loaded
    #[error("knowledge index: {0}")]
    Retrieval(#[from] RetrievalError),

    /// A persistence collaborator could not be built
    #[error("answer store: {0}")]
    Store(#[from] StoreError),
}

/// How a request ended, as seen by the pipeline
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnswerOutcome {
    /// The upstream answer was delivered in full
    Completed,
    /// The upstream failed and the fallback answer was delivered
    Fallback,
    /// The client stopped the request or went away
    Cancelled,
}

impl fmt::Display for AnswerOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Completed => "completed",
            Self::Fallback => "fallback",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Summary of one finished request
#[derive(Clone, Debug)]
pub struct RunSummary {
    /// The request
    pub request_id: RequestId,
    /// Subject used for retrieval
    pub subject: Subject,
    /// How the request ended
    pub outcome: AnswerOutcome,
    /// Context chunks used in the prompt
    pub chunks: usize,
    /// Moderation notice sent or withheld
    pub notice: Option<String>,
    /// Record the store accepted; `None` when skipped or refused
    pub persisted: Option<PersistedMessage>,
}

/// Streaming answer pipeline
///
/// Cheap to clone; every collaborator is shared.
#[derive(Clone)]
pub struct AnswerPipeline {
    backend: Arc<dyn CompletionBackend>,
    retrieval: RetrievalCoordinator,
    finalize: FinalizeStage,
    fallback: FallbackSynthesizer,
    upstream: UpstreamConfig,
}

impl fmt::Debug for AnswerPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnswerPipeline")
            .field("backend", &self.backend.name())
            .field("retrieval", &self.retrieval)
            .field("finalize", &self.finalize)
            .field("model", &self.upstream.model)
            .finish_non_exhaustive()
    }
}

impl AnswerPipeline {
    /// Pipeline with default retrieval, fallback and upstream settings
    #[must_use]
    pub fn new(backend: Arc<dyn CompletionBackend>, finalize: FinalizeStage) -> Self {
        Self {
            backend,
            retrieval: RetrievalCoordinator::new(Default::default()),
            finalize,
            fallback: FallbackSynthesizer::default(),
            upstream: UpstreamConfig::default(),
        }
    }

    /// Use `retrieval` for context lookup
    #[must_use]
    pub fn with_retrieval(mut self, retrieval: RetrievalCoordinator) -> Self {
        self.retrieval = retrieval;
        self
    }

    /// Use `fallback` when the upstream fails
    #[must_use]
    pub fn with_fallback(mut self, fallback: FallbackSynthesizer) -> Self {
        self.fallback = fallback;
        self
    }

    /// Model and sampling settings for upstream requests
    #[must_use]
    pub fn with_upstream(mut self, upstream: UpstreamConfig) -> Self {
        self.upstream = upstream;
        self
    }

    /// Build the full pipeline from configuration
    ///
    /// Uses the OpenAI-compatible upstream for both completions and
    /// embeddings, the configured knowledge file for retrieval, term
    /// moderation, and a JSON-lines store when a path is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP clients cannot be built or the
    /// knowledge file cannot be loaded.
    pub async fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let backend = Arc::new(OpenAiCompatibleBackend::from_config(&config.upstream)?);

        let mut retrieval = RetrievalCoordinator::new(config.retrieval.clone());
        if let Some(path) = &config.retrieval.knowledge_path {
            let index = Arc::new(KnowledgeIndex::load(path).await?);
            let filled = index.fill_embeddings(backend.as_ref()).await;
            tracing::info!(entries = index.len(), embedded = filled, "Knowledge index ready");
            retrieval = retrieval
                .with_vector(backend.clone(), index.clone())
                .with_keyword(index);
        } else {
            tracing::info!("No knowledge file configured, answering without context");
        }

        let store: Arc<dyn AnswerStore> = match &config.store.answers_path {
            Some(path) => Arc::new(JsonlAnswerStore::new(path)),
            None => {
                tracing::warn!("No answer store path configured, answers are kept in memory");
                Arc::new(MemoryAnswerStore::new())
            }
        };
        let extraction: Arc<dyn ExtractionScheduler> = match &config.store.extraction_url {
            Some(url) => Arc::new(HttpExtractionScheduler::new(url.clone())?),
            None => Arc::new(KeywordExtractionScheduler),
        };
        let finalize = FinalizeStage::new(
            Arc::new(TermModerator::from_config(&config.moderation)),
            store,
        )
        .with_extraction(extraction)
        .with_moderation_timeout(config.moderation.timeout);

        Ok(Self::new(backend, finalize)
            .with_retrieval(retrieval)
            .with_fallback(FallbackSynthesizer::new(config.fallback.clone()))
            .with_upstream(config.upstream.clone()))
    }

    /// Probe the upstream service
    pub async fn upstream_healthy(&self) -> bool {
        self.backend.health_check().await
    }

    /// Answer one question, writing frames to `tx`
    ///
    /// Never fails: upstream errors become fallback answers, cancellation
    /// and disconnects end the stream early, and persistence problems are
    /// logged. Dropping the receiving side of `tx` cancels the request.
    pub async fn run(
        &self,
        request_id: RequestId,
        question: Question,
        tx: mpsc::Sender<ClientFrame>,
        cancel: CancellationToken,
    ) -> RunSummary {
        let started = Instant::now();
        let sink = ClientSink::new(tx, cancel.clone());
        let mut relay = StreamRelay::new(request_id.clone(), sink, cancel.clone());
        relay.open().await;

        let subject = classify::resolve(question.subject_hint.as_deref(), &question.text);
        tracing::info!(
            request_id = %request_id,
            %subject,
            image = question.image_ref.is_some(),
            "Answer request started"
        );

        let chunks = self.retrieval.retrieve(&question.text, subject, &cancel).await;
        let assembled = prompt::assemble(
            &question.text,
            subject,
            &chunks,
            question.image_ref.as_deref(),
        );
        let request = CompletionRequest::new(assembled.system, assembled.user, self.upstream.model.clone())
            .with_image(assembled.image_ref)
            .with_temperature(self.upstream.temperature)
            .with_max_tokens(self.upstream.max_tokens);

        let outcome = match relay.pump(self.backend.as_ref(), &request).await {
            RelayOutcome::Completed => {
                relay.complete();
                AnswerOutcome::Completed
            }
            RelayOutcome::Failed { reason } => {
                tracing::warn!(
                    request_id = %request_id,
                    %subject,
                    reason = %reason,
                    "Upstream failed, delivering fallback answer"
                );
                relay
                    .begin_fallback(&format!("模型服务暂时不可用，已切换为备用回答：{reason}"))
                    .await;

                let mut text = self.fallback.synthesize(&question.text, subject, &chunks);
                if !relay.answer().is_empty() {
                    text.insert_str(0, FALLBACK_SEPARATOR);
                }
                if self.fallback.deliver(&mut relay, &text, &cancel).await {
                    AnswerOutcome::Fallback
                } else {
                    AnswerOutcome::Cancelled
                }
            }
            RelayOutcome::Cancelled => AnswerOutcome::Cancelled,
        };

        let mut notice = None;
        let persisted = if outcome == AnswerOutcome::Cancelled {
            relay.cancel().await;
            let answer = relay.into_answer();
            if answer.is_empty() {
                tracing::debug!(request_id = %request_id, "Cancelled before any content, nothing to persist");
                None
            } else {
                let metadata = serde_json::json!({
                    "subject": subject.label(),
                    "requestId": request_id.as_str(),
                    "fallback": answer.from_fallback(),
                    "contextChunks": chunks.len(),
                });
                self.persist(&question, answer.text(), metadata, true, subject, false)
                    .await
            }
        } else {
            let text = relay.answer().text().to_string();
            let finalized = self.finalize.finalize(&text, &question.text, subject).await;
            if let Some(message) = &finalized.notice {
                if !relay.emit_notice(message).await {
                    tracing::debug!(request_id = %request_id, "Client gone, moderation notice not sent");
                }
            }
            relay.close().await;

            let metadata = serde_json::json!({
                "subject": subject.label(),
                "requestId": request_id.as_str(),
                "fallback": outcome == AnswerOutcome::Fallback,
                "contextChunks": chunks.len(),
                "moderation": finalized.result.reason,
            });
            notice = finalized.notice.clone();
            self.persist(
                &question,
                &finalized.persisted_text,
                metadata,
                false,
                subject,
                !finalized.is_rejected(),
            )
            .await
        };

        tracing::info!(
            request_id = %request_id,
            %subject,
            outcome = %outcome,
            chunks = chunks.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Answer request finished"
        );

        RunSummary {
            request_id,
            subject,
            outcome,
            chunks: chunks.len(),
            notice,
            persisted,
        }
    }

    async fn persist(
        &self,
        question: &Question,
        text: &str,
        metadata: serde_json::Value,
        interrupted: bool,
        subject: Subject,
        extract: bool,
    ) -> Option<PersistedMessage> {
        let Some(chat_id) = question.session_id.as_deref() else {
            tracing::debug!("No session id, answer not persisted");
            return None;
        };

        let mut message = PersistedMessage::new(chat_id, text).with_metadata(metadata);
        if interrupted {
            message = message.interrupted();
        }
        self.finalize
            .commit(&message, subject, extract)
            .await
            .then_some(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::backend::ScriptedBackend;

    fn pipeline(backend: ScriptedBackend) -> (AnswerPipeline, Arc<MemoryAnswerStore>) {
        let store = Arc::new(MemoryAnswerStore::new());
        let finalize = FinalizeStage::new(Arc::new(TermModerator::default()), store.clone());
        (AnswerPipeline::new(Arc::new(backend), finalize), store)
    }

    async fn collect(mut rx: mpsc::Receiver<ClientFrame>) -> Vec<ClientFrame> {
        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn test_request_uses_configured_model_and_subject() {
        let backend = ScriptedBackend::from_deltas(&["答"]);
        let requests = backend.clone();
        let (pipeline, _) = pipeline(backend);
        let pipeline = pipeline.with_upstream(UpstreamConfig {
            model: "law-model".to_string(),
            ..UpstreamConfig::default()
        });

        let (tx, rx) = mpsc::channel(16);
        let summary = pipeline
            .run(
                RequestId::new(),
                Question::new("合同无效的情形"),
                tx,
                CancellationToken::new(),
            )
            .await;
        collect(rx).await;

        assert_eq!(summary.subject, Subject::CivilLaw);
        let sent = requests.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].model, "law-model");
        assert!(sent[0].user.contains("问题：合同无效的情形"));
    }

    #[tokio::test]
    async fn test_missing_session_skips_persistence() {
        let (pipeline, store) = pipeline(ScriptedBackend::from_deltas(&["答"]));
        let (tx, rx) = mpsc::channel(16);
        let summary = pipeline
            .run(RequestId::new(), Question::new("q"), tx, CancellationToken::new())
            .await;
        collect(rx).await;

        assert_eq!(summary.outcome, AnswerOutcome::Completed);
        assert!(summary.persisted.is_none());
        assert!(store.messages().is_empty());
    }

    #[tokio::test]
    async fn test_partial_content_then_failure_appends_fallback() {
        let backend = ScriptedBackend::new()
            .frame(&crate::transport::UpstreamFrame::Delta("部分".into()))
            .stream_error("connection reset");
        let (pipeline, store) = pipeline(backend);
        let pipeline = pipeline.with_fallback(FallbackSynthesizer::new(crate::config::FallbackConfig {
            piece_chars: 50,
            piece_delay: std::time::Duration::ZERO,
        }));

        let (tx, rx) = mpsc::channel(64);
        let summary = pipeline
            .run(
                RequestId::new(),
                Question::new("q").with_session("chat"),
                tx,
                CancellationToken::new(),
            )
            .await;
        let frames = collect(rx).await;

        assert_eq!(summary.outcome, AnswerOutcome::Fallback);
        let stored = store.messages();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].text.starts_with("部分\n\n"));
        assert_eq!(stored[0].metadata.as_ref().unwrap()["fallback"], true);
        assert_eq!(frames.iter().filter(|f| f.is_terminal()).count(), 1);
    }
}
