//! Moderation & Persistence Stage
//!
//! Runs once per request after the visible stream content is settled.
//!
//! ```text
//!   accumulated text
//!        │
//!        ▼
//!   moderate (bounded) ──▶ persisted text + optional notice
//!        │
//!        ▼
//!   save_answer ──▶ spawn extraction (detached)
//! ```
//!
//! Neither step can fail the request: a moderation outage fails open and a
//! store outage is logged.

use std::sync::Arc;
use std::time::Duration;

use crate::classify::Subject;
use crate::config::ModerationConfig;
use crate::moderation::{ModerationResult, Moderator};
use crate::persistence::{schedule_extraction, AnswerStore, ExtractionScheduler, PersistedMessage};

/// Stored in place of a rejected answer
pub const REJECTION_PLACEHOLDER: &str = "[该回答未通过内容审核，已被屏蔽]";

/// Outcome of moderating one answer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Finalized {
    /// Text to persist
    pub persisted_text: String,
    /// Message for a `moderation_notice` frame
    pub notice: Option<String>,
    /// Raw verdict
    pub result: ModerationResult,
}

impl Finalized {
    /// Whether moderation rejected the answer
    #[must_use]
    pub fn is_rejected(&self) -> bool {
        !self.result.is_allowed
    }
}

/// Moderation and persistence collaborators for a pipeline
#[derive(Clone)]
pub struct FinalizeStage {
    moderator: Arc<dyn Moderator>,
    store: Arc<dyn AnswerStore>,
    extraction: Option<Arc<dyn ExtractionScheduler>>,
    moderation_timeout: Duration,
}

impl std::fmt::Debug for FinalizeStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FinalizeStage")
            .field("extraction", &self.extraction.is_some())
            .field("moderation_timeout", &self.moderation_timeout)
            .finish_non_exhaustive()
    }
}

impl FinalizeStage {
    /// Create a stage without extraction
    #[must_use]
    pub fn new(moderator: Arc<dyn Moderator>, store: Arc<dyn AnswerStore>) -> Self {
        Self {
            moderator,
            store,
            extraction: None,
            moderation_timeout: ModerationConfig::default().timeout,
        }
    }

    /// Schedule knowledge extraction after each stored answer
    #[must_use]
    pub fn with_extraction(mut self, extraction: Arc<dyn ExtractionScheduler>) -> Self {
        self.extraction = Some(extraction);
        self
    }

    /// Bound on one moderation call
    #[must_use]
    pub fn with_moderation_timeout(mut self, timeout: Duration) -> Self {
        self.moderation_timeout = timeout;
        self
    }

    /// Moderate a complete answer
    ///
    /// A moderator error or timeout allows the text unchanged.
    pub async fn finalize(&self, text: &str, question: &str, subject: Subject) -> Finalized {
        let verdict = tokio::time::timeout(
            self.moderation_timeout,
            self.moderator.moderate(text, question, subject),
        )
        .await;

        let result = match verdict {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                tracing::warn!(%subject, error = %e, "Moderation failed, allowing answer");
                ModerationResult::allowed()
            }
            Err(_) => {
                tracing::warn!(
                    %subject,
                    timeout_ms = self.moderation_timeout.as_millis() as u64,
                    "Moderation timed out, allowing answer"
                );
                ModerationResult::allowed()
            }
        };

        if !result.is_allowed {
            let reason = result.reason.clone().unwrap_or_else(|| "内容不符合规范".to_string());
            tracing::warn!(%subject, reason = %reason, "Answer rejected by moderation");
            return Finalized {
                persisted_text: REJECTION_PLACEHOLDER.to_string(),
                notice: Some(format!("回答未通过内容审核：{reason}")),
                result,
            };
        }

        match result.modified_text.clone() {
            Some(modified) if modified != text => {
                let reason = result.reason.clone().unwrap_or_else(|| "内容已调整".to_string());
                tracing::info!(%subject, reason = %reason, "Answer rewritten by moderation");
                Finalized {
                    persisted_text: modified,
                    notice: Some(format!("回答内容已按审核规则调整：{reason}")),
                    result,
                }
            }
            _ => Finalized {
                persisted_text: text.to_string(),
                notice: None,
                result,
            },
        }
    }

    /// Write the record and schedule extraction
    ///
    /// Returns whether the write succeeded. Failures are logged, never
    /// raised. Extraction only follows a successful write and only when
    /// `extract` is set.
    pub async fn commit(&self, message: &PersistedMessage, subject: Subject, extract: bool) -> bool {
        if let Err(e) = self.store.save_answer(message).await {
            tracing::warn!(
                chat_id = %message.chat_id,
                error = %e,
                "Failed to persist answer"
            );
            return false;
        }
        tracing::debug!(
            chat_id = %message.chat_id,
            interrupted = message.interrupted,
            "Answer persisted"
        );

        if extract {
            if let Some(extraction) = &self.extraction {
                let _detached = schedule_extraction(
                    Arc::clone(extraction),
                    message.chat_id.clone(),
                    message.text.clone(),
                    subject,
                );
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    use crate::moderation::{ModerationError, TermModerator};
    use crate::persistence::{MemoryAnswerStore, StoreError};

    struct SlowModerator;

    #[async_trait]
    impl Moderator for SlowModerator {
        async fn moderate(
            &self,
            _text: &str,
            _question: &str,
            _subject: Subject,
        ) -> Result<ModerationResult, ModerationError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(ModerationResult::rejected("too late"))
        }
    }

    struct BrokenModerator;

    #[async_trait]
    impl Moderator for BrokenModerator {
        async fn moderate(
            &self,
            _text: &str,
            _question: &str,
            _subject: Subject,
        ) -> Result<ModerationResult, ModerationError> {
            Err(ModerationError::Unavailable("503".into()))
        }
    }

    #[derive(Default)]
    struct CountingExtraction {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ExtractionScheduler for CountingExtraction {
        async fn extract(
            &self,
            _chat_id: &str,
            _text: &str,
            _subject: Subject,
        ) -> Result<Vec<String>, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Remote("extraction down".into()))
        }
    }

    fn stage(moderator: Arc<dyn Moderator>) -> (FinalizeStage, Arc<MemoryAnswerStore>) {
        let store = Arc::new(MemoryAnswerStore::new());
        (FinalizeStage::new(moderator, store.clone()), store)
    }

    #[tokio::test]
    async fn test_allowed_answer_kept() {
        let (stage, _) = stage(Arc::new(TermModerator::default()));
        let finalized = stage.finalize("正当防卫是指", "q", Subject::CriminalLaw).await;
        assert_eq!(finalized.persisted_text, "正当防卫是指");
        assert!(finalized.notice.is_none());
        assert!(!finalized.is_rejected());
    }

    #[tokio::test]
    async fn test_rejection_replaces_text() {
        let moderator = TermModerator::new(vec!["代考".into()], Vec::new());
        let (stage, _) = stage(Arc::new(moderator));
        let finalized = stage.finalize("可以找人代考", "q", Subject::CivilLaw).await;

        assert!(finalized.is_rejected());
        assert_eq!(finalized.persisted_text, REJECTION_PLACEHOLDER);
        assert!(finalized.notice.is_some());
    }

    #[tokio::test]
    async fn test_modification_notifies() {
        let moderator = TermModerator::new(Vec::new(), vec!["笨蛋".into()]);
        let (stage, _) = stage(Arc::new(moderator));
        let finalized = stage.finalize("别当笨蛋", "q", Subject::CivilLaw).await;

        assert_eq!(finalized.persisted_text, "别当**");
        assert!(finalized.notice.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_moderation_timeout_fails_open() {
        let (stage, _) = stage(Arc::new(SlowModerator));
        let stage = stage.with_moderation_timeout(Duration::from_millis(100));
        let finalized = stage.finalize("text", "q", Subject::CivilLaw).await;
        assert_eq!(finalized.persisted_text, "text");
        assert!(finalized.notice.is_none());
    }

    #[tokio::test]
    async fn test_moderation_error_fails_open() {
        let (stage, _) = stage(Arc::new(BrokenModerator));
        let finalized = stage.finalize("text", "q", Subject::CivilLaw).await;
        assert_eq!(finalized.result, ModerationResult::allowed());
    }

    #[tokio::test]
    async fn test_commit_swallows_store_failure() {
        let stage = FinalizeStage::new(
            Arc::new(TermModerator::default()),
            Arc::new(MemoryAnswerStore::unavailable()),
        );
        let saved = stage
            .commit(&PersistedMessage::new("chat", "text"), Subject::CivilLaw, true)
            .await;
        assert!(!saved);
    }

    #[tokio::test]
    async fn test_commit_schedules_extraction() {
        let extraction = Arc::new(CountingExtraction::default());
        let (stage, store) = stage(Arc::new(TermModerator::default()));
        let stage = stage.with_extraction(extraction.clone());

        assert!(
            stage
                .commit(&PersistedMessage::new("chat", "text"), Subject::CivilLaw, true)
                .await
        );
        assert!(
            stage
                .commit(&PersistedMessage::new("chat", "partial"), Subject::CivilLaw, false)
                .await
        );
        assert_eq!(store.messages().len(), 2);

        for _ in 0..50 {
            if extraction.calls.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(extraction.calls.load(Ordering::SeqCst), 1);
    }
}
