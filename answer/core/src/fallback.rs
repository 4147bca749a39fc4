//! Fallback Synthesizer
//!
//! Deterministic templated answer used when the upstream model fails. The
//! text is cut into small pieces and paced through the relay so the client
//! sees the same incremental delivery as a real answer.

use tokio_util::sync::CancellationToken;

use crate::classify::Subject;
use crate::config::FallbackConfig;
use crate::relay::StreamRelay;
use crate::retrieval::ContextChunk;

/// Chunks quoted by a knowledge-grounded answer
const MAX_QUOTED_CHUNKS: usize = 2;

/// Builds and delivers fallback answers
#[derive(Clone, Debug, Default)]
pub struct FallbackSynthesizer {
    config: FallbackConfig,
}

impl FallbackSynthesizer {
    /// Create with pacing settings
    #[must_use]
    pub fn new(config: FallbackConfig) -> Self {
        Self { config }
    }

    /// Build the fallback text
    ///
    /// Quotes up to two chunks when context exists, otherwise gives generic
    /// study guidance for `subject`.
    #[must_use]
    pub fn synthesize(&self, question: &str, subject: Subject, chunks: &[ContextChunk]) -> String {
        let label = subject.label();

        if chunks.is_empty() {
            return format!(
                "关于“{question}”，这是{label}中的常见考点。建议按以下思路复习：\n\
                 1. 回顾{label}教材中对应章节的基本概念与构成要件；\n\
                 2. 梳理相关法条的适用条件和例外情形；\n\
                 3. 结合历年真题练习，总结常见的出题角度。\n\n\
                 当前模型服务暂时不可用，以上为通用学习建议，请稍后重试以获取详细解答。"
            );
        }

        let mut text = format!("根据知识库中的相关内容，关于“{question}”可以参考以下要点：\n\n");
        for (i, chunk) in chunks.iter().take(MAX_QUOTED_CHUNKS).enumerate() {
            text.push_str(&format!("{}. 【{}】{}\n", i + 1, chunk.path, chunk.text));
        }
        text.push_str(&format!(
            "\n建议结合{label}教材的相关章节和历年真题加深理解。当前模型服务暂时不可用，请稍后重试以获取完整解答。"
        ));
        text
    }

    /// Cut `text` into pieces of at most `piece_chars` characters
    #[must_use]
    pub fn pieces(&self, text: &str) -> Vec<String> {
        let size = self.config.piece_chars.max(1);
        let chars: Vec<char> = text.chars().collect();
        chars.chunks(size).map(|c| c.iter().collect()).collect()
    }

    /// Pace `text` through the relay
    ///
    /// Returns `false` if the request was cancelled before every piece was
    /// delivered. Pending delays are skipped on cancellation.
    pub async fn deliver(
        &self,
        relay: &mut StreamRelay,
        text: &str,
        cancel: &CancellationToken,
    ) -> bool {
        for (i, piece) in self.pieces(text).iter().enumerate() {
            if i > 0 && !self.config.piece_delay.is_zero() {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return false,
                    () = tokio::time::sleep(self.config.piece_delay) => {}
                }
            }
            if !relay.emit_content(piece).await {
                return false;
            }
        }
        true
    }
}
