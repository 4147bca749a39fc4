//! Content Moderation
//!
//! The moderation collaborator judges a complete answer before it is
//! stored. A verdict either allows the text (optionally rewritten) or
//! rejects it; rejection is an outcome, not an error.

use async_trait::async_trait;
use thiserror::Error;

use crate::classify::Subject;
use crate::config::ModerationConfig;

/// Verdict for one answer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModerationResult {
    /// Whether the answer may be stored
    pub is_allowed: bool,
    /// Replacement text for an allowed answer
    pub modified_text: Option<String>,
    /// Why the answer was rejected or rewritten
    pub reason: Option<String>,
}

impl ModerationResult {
    /// Allow unchanged
    #[must_use]
    pub fn allowed() -> Self {
        Self {
            is_allowed: true,
            modified_text: None,
            reason: None,
        }
    }

    /// Allow with rewritten text
    pub fn modified(text: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            is_allowed: true,
            modified_text: Some(text.into()),
            reason: Some(reason.into()),
        }
    }

    /// Reject
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            is_allowed: false,
            modified_text: None,
            reason: Some(reason.into()),
        }
    }
}

/// Errors raised by moderation collaborators
#[derive(Debug, Error)]
pub enum ModerationError {
    /// The moderation service could not be reached
    #[error("moderation unavailable: {0}")]
    Unavailable(String),
}

/// Moderation collaborator
#[async_trait]
pub trait Moderator: Send + Sync {
    /// Judge `text`, the answer to `question`
    async fn moderate(
        &self,
        text: &str,
        question: &str,
        subject: Subject,
    ) -> Result<ModerationResult, ModerationError>;
}

/// Term-list moderator
///
/// Blocked terms reject the answer; masked terms are replaced with `*`.
#[derive(Clone, Debug, Default)]
pub struct TermModerator {
    blocked: Vec<String>,
    masked: Vec<String>,
}

impl TermModerator {
    /// Create with explicit term lists
    #[must_use]
    pub fn new(blocked: Vec<String>, masked: Vec<String>) -> Self {
        let clean = |terms: Vec<String>| -> Vec<String> {
            terms
                .into_iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect()
        };
        Self {
            blocked: clean(blocked),
            masked: clean(masked),
        }
    }

    /// Create from the `[moderation]` configuration section
    #[must_use]
    pub fn from_config(config: &ModerationConfig) -> Self {
        Self::new(config.blocked_terms.clone(), config.masked_terms.clone())
    }
}

#[async_trait]
impl Moderator for TermModerator {
    async fn moderate(
        &self,
        text: &str,
        _question: &str,
        _subject: Subject,
    ) -> Result<ModerationResult, ModerationError> {
        if self.blocked.iter().any(|term| text.contains(term.as_str())) {
            // The reason never echoes the matched term
            return Ok(ModerationResult::rejected("包含违规内容"));
        }

        let mut masked = text.to_string();
        for term in &self.masked {
            if masked.contains(term.as_str()) {
                masked = masked.replace(term.as_str(), &"*".repeat(term.chars().count()));
            }
        }

        if masked == text {
            Ok(ModerationResult::allowed())
        } else {
            Ok(ModerationResult::modified(masked, "部分词语已屏蔽"))
        }
    }
}
