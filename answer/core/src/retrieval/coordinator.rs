//! Retrieval Coordinator
//!
//! Races the vector path against its deadline and falls back to keyword
//! search. The timed-out branch is dropped, which cancels it; nothing is
//! left running once `retrieve` returns.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use super::{ContextChunk, KeywordSearch, RetrievalError, VectorSearch};
use crate::backend::Embedder;
use crate::classify::Subject;
use crate::config::RetrievalConfig;

/// Coordinates the two lookup paths for one question
#[derive(Clone)]
pub struct RetrievalCoordinator {
    embedder: Option<Arc<dyn Embedder>>,
    vector: Option<Arc<dyn VectorSearch>>,
    keyword: Option<Arc<dyn KeywordSearch>>,
    config: RetrievalConfig,
}

impl std::fmt::Debug for RetrievalCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrievalCoordinator")
            .field("vector", &self.vector.is_some())
            .field("keyword", &self.keyword.is_some())
            .field("config", &self.config)
            .finish()
    }
}

impl RetrievalCoordinator {
    /// Coordinator with no collaborators; always returns no context
    #[must_use]
    pub fn new(config: RetrievalConfig) -> Self {
        Self {
            embedder: None,
            vector: None,
            keyword: None,
            config,
        }
    }

    /// Enable the vector path
    #[must_use]
    pub fn with_vector(mut self, embedder: Arc<dyn Embedder>, vector: Arc<dyn VectorSearch>) -> Self {
        self.embedder = Some(embedder);
        self.vector = Some(vector);
        self
    }

    /// Enable the keyword fallback
    #[must_use]
    pub fn with_keyword(mut self, keyword: Arc<dyn KeywordSearch>) -> Self {
        self.keyword = Some(keyword);
        self
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Retrieve ranked context for `text`
    ///
    /// Returns an empty list when nothing relevant is found, when every
    /// path fails, or when `cancel` fires.
    pub async fn retrieve(
        &self,
        text: &str,
        subject: Subject,
        cancel: &CancellationToken,
    ) -> Vec<ContextChunk> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::debug!(%subject, "Retrieval cancelled");
                Vec::new()
            }
            chunks = self.race(text, subject) => chunks,
        }
    }

    async fn race(&self, text: &str, subject: Subject) -> Vec<ContextChunk> {
        let started = Instant::now();

        if let (Some(embedder), Some(vector)) = (&self.embedder, &self.vector) {
            let primary = async {
                let embedding = embedder.embed(text).await?;
                let chunks = vector
                    .vector_search(subject, &embedding, self.config.top_k)
                    .await?;
                Ok::<_, RetrievalError>(chunks)
            };

            match tokio::time::timeout(self.config.deadline, primary).await {
                Ok(Ok(chunks)) => {
                    let ranked = self.rank(chunks);
                    if !ranked.is_empty() {
                        tracing::debug!(
                            %subject,
                            count = ranked.len(),
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "Vector retrieval succeeded"
                        );
                        return ranked;
                    }
                    tracing::debug!(%subject, "Vector retrieval found nothing above the floor");
                }
                Ok(Err(e)) => {
                    tracing::warn!(%subject, error = %e, "Vector retrieval failed");
                }
                Err(_) => {
                    tracing::warn!(
                        %subject,
                        deadline_ms = self.config.deadline.as_millis() as u64,
                        "Vector retrieval missed its deadline"
                    );
                }
            }
        }

        let Some(keyword) = &self.keyword else {
            return Vec::new();
        };

        let fallback = keyword.keyword_search(text, subject, self.config.top_k);
        let chunks = match tokio::time::timeout(self.config.keyword_timeout, fallback).await {
            Ok(Ok(chunks)) => self.rank(chunks),
            Ok(Err(e)) => {
                tracing::warn!(%subject, error = %e, "Keyword retrieval failed");
                Vec::new()
            }
            Err(_) => {
                tracing::warn!(%subject, "Keyword retrieval timed out");
                Vec::new()
            }
        };

        tracing::debug!(
            %subject,
            count = chunks.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Keyword retrieval finished"
        );
        chunks
    }

    fn rank(&self, chunks: Vec<ContextChunk>) -> Vec<ContextChunk> {
        let mut ranked = rank(chunks, self.config.similarity_floor);
        ranked.truncate(self.config.top_k);
        ranked
    }
}

/// Drop chunks below `floor` and order by descending score
///
/// The sort is stable, so equal scores keep discovery order.
#[must_use]
pub fn rank(chunks: Vec<ContextChunk>, floor: f32) -> Vec<ContextChunk> {
    let mut kept: Vec<ContextChunk> = chunks
        .into_iter()
        .filter(|c| c.score.is_finite() && c.score >= floor)
        .collect();
    kept.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::backend::FixedEmbedder;

    fn chunk(text: &str, score: f32) -> ContextChunk {
        ContextChunk {
            text: text.to_string(),
            path: format!("test/{text}"),
            score,
            subject: Subject::CriminalLaw,
        }
    }

    struct StubSearch {
        chunks: Vec<ContextChunk>,
        delay: Duration,
        fail: bool,
    }

    impl StubSearch {
        fn returning(chunks: Vec<ContextChunk>) -> Arc<Self> {
            Arc::new(Self {
                chunks,
                delay: Duration::ZERO,
                fail: false,
            })
        }

        fn slow(chunks: Vec<ContextChunk>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                chunks,
                delay,
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                chunks: Vec::new(),
                delay: Duration::ZERO,
                fail: true,
            })
        }

        async fn answer(&self) -> Result<Vec<ContextChunk>, RetrievalError> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(RetrievalError::Search("index offline".to_string()));
            }
            Ok(self.chunks.clone())
        }
    }

    #[async_trait]
    impl VectorSearch for StubSearch {
        async fn vector_search(
            &self,
            _subject: Subject,
            _embedding: &[f32],
            _k: usize,
        ) -> Result<Vec<ContextChunk>, RetrievalError> {
            self.answer().await
        }
    }

    #[async_trait]
    impl KeywordSearch for StubSearch {
        async fn keyword_search(
            &self,
            _text: &str,
            _subject: Subject,
            _k: usize,
        ) -> Result<Vec<ContextChunk>, RetrievalError> {
            self.answer().await
        }
    }

    fn embedder() -> Arc<FixedEmbedder> {
        Arc::new(FixedEmbedder::new(vec![1.0, 0.0]))
    }

    #[test]
    fn test_rank_filters_and_orders() {
        let ranked = rank(
            vec![
                chunk("low", 0.05),
                chunk("mid-a", 0.5),
                chunk("high", 0.9),
                chunk("mid-b", 0.5),
                chunk("nan", f32::NAN),
                chunk("floor", 0.1),
            ],
            0.1,
        );
        let texts: Vec<_> = ranked.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["high", "mid-a", "mid-b", "floor"]);
    }

    #[tokio::test]
    async fn test_vector_path_used_when_fast() {
        let coordinator = RetrievalCoordinator::new(RetrievalConfig::default())
            .with_vector(embedder(), StubSearch::returning(vec![chunk("vec", 0.8)]))
            .with_keyword(StubSearch::returning(vec![chunk("kw", 0.8)]));

        let chunks = coordinator
            .retrieve("正当防卫", Subject::CriminalLaw, &CancellationToken::new())
            .await;
        assert_eq!(chunks, vec![chunk("vec", 0.8)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_falls_back_to_keyword() {
        let config = RetrievalConfig::default();
        let bound = config.deadline + config.keyword_timeout;
        let coordinator = RetrievalCoordinator::new(config)
            .with_vector(
                embedder(),
                StubSearch::slow(vec![chunk("vec", 0.8)], Duration::from_secs(10)),
            )
            .with_keyword(StubSearch::returning(vec![chunk("kw", 0.6)]));

        let started = tokio::time::Instant::now();
        let chunks = coordinator
            .retrieve("正当防卫", Subject::CriminalLaw, &CancellationToken::new())
            .await;

        assert_eq!(chunks, vec![chunk("kw", 0.6)]);
        assert!(started.elapsed() <= bound);
    }

    #[tokio::test(start_paused = true)]
    async fn test_both_paths_slow_is_bounded_and_empty() {
        let config = RetrievalConfig::default();
        let bound = config.deadline + config.keyword_timeout;
        let coordinator = RetrievalCoordinator::new(config)
            .with_vector(
                embedder(),
                StubSearch::slow(vec![chunk("vec", 0.8)], Duration::from_secs(30)),
            )
            .with_keyword(StubSearch::slow(vec![chunk("kw", 0.8)], Duration::from_secs(30)));

        let started = tokio::time::Instant::now();
        let chunks = coordinator
            .retrieve("q", Subject::CivilLaw, &CancellationToken::new())
            .await;

        assert!(chunks.is_empty());
        assert!(started.elapsed() <= bound);
    }

    #[tokio::test]
    async fn test_errors_degrade_to_empty() {
        let coordinator = RetrievalCoordinator::new(RetrievalConfig::default())
            .with_vector(Arc::new(FixedEmbedder::failing()), StubSearch::failing())
            .with_keyword(StubSearch::failing());

        let chunks = coordinator
            .retrieve("q", Subject::CivilLaw, &CancellationToken::new())
            .await;
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn test_below_floor_vector_result_falls_back() {
        let coordinator = RetrievalCoordinator::new(RetrievalConfig::default())
            .with_vector(embedder(), StubSearch::returning(vec![chunk("weak", 0.05)]))
            .with_keyword(StubSearch::returning(vec![chunk("kw", 0.3)]));

        let chunks = coordinator
            .retrieve("q", Subject::CriminalLaw, &CancellationToken::new())
            .await;
        assert_eq!(chunks, vec![chunk("kw", 0.3)]);
    }

    #[tokio::test]
    async fn test_no_collaborators_is_empty() {
        let coordinator = RetrievalCoordinator::new(RetrievalConfig::default());
        let chunks = coordinator
            .retrieve("q", Subject::CivilLaw, &CancellationToken::new())
            .await;
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_retrieval_returns_immediately() {
        let coordinator = RetrievalCoordinator::new(RetrievalConfig::default()).with_vector(
            embedder(),
            StubSearch::slow(vec![chunk("vec", 0.8)], Duration::from_secs(60)),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let chunks = tokio::time::timeout(
            Duration::from_secs(1),
            coordinator.retrieve("q", Subject::CivilLaw, &cancel),
        )
        .await
        .unwrap();
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn test_top_k_truncates() {
        let config = RetrievalConfig {
            top_k: 2,
            ..Default::default()
        };
        let coordinator = RetrievalCoordinator::new(config).with_keyword(StubSearch::returning(vec![
            chunk("a", 0.9),
            chunk("b", 0.8),
            chunk("c", 0.7),
        ]));

        let chunks = coordinator
            .retrieve("q", Subject::CriminalLaw, &CancellationToken::new())
            .await;
        assert_eq!(chunks.len(), 2);
    }
}
