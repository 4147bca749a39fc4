//! Pipeline Messages
//!
//! Values that cross the pipeline boundary: the inbound question, the
//! per-request identifier, and the frames sent back to the client.
//!
//! # Outbound frames
//!
//! A client observes, in order:
//!
//! ```text
//! Init → Content* → (Error → Content+)? → ModerationNotice? → Done
//! ```
//!
//! `Done` is emitted at most once per request. The wire encoding lives in
//! [`crate::transport::frame`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Request identifier
///
/// One per streaming request. Used as the key of the active request
/// registry and returned to clients so they can ask for a stop.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl RequestId {
    /// Generate a new random request ID
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the raw identifier
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Inbound request body as sent by the web client
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerRequest {
    /// The question text
    pub question: String,
    /// Optional reference to an uploaded image
    #[serde(default)]
    pub image_ref: Option<String>,
    /// Optional subject label chosen by the user
    #[serde(default)]
    pub subject: Option<String>,
    /// Chat/session the answer belongs to
    #[serde(default)]
    pub session_id: Option<String>,
}

/// A user question
///
/// Immutable for the lifetime of a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Question {
    /// Raw question text
    pub text: String,
    /// Optional image reference forwarded to the upstream model
    pub image_ref: Option<String>,
    /// Subject label supplied by the caller, if any
    pub subject_hint: Option<String>,
    /// Chat/session identifier used as the persistence key
    pub session_id: Option<String>,
}

impl Question {
    /// Create a question with only text
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            image_ref: None,
            subject_hint: None,
            session_id: None,
        }
    }

    /// Attach an image reference
    #[must_use]
    pub fn with_image(mut self, image_ref: impl Into<String>) -> Self {
        self.image_ref = Some(image_ref.into());
        self
    }

    /// Attach a subject hint
    #[must_use]
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject_hint = Some(subject.into());
        self
    }

    /// Attach a session identifier
    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

impl From<AnswerRequest> for Question {
    fn from(req: AnswerRequest) -> Self {
        // Blank optional fields are treated as absent
        fn non_blank(value: Option<String>) -> Option<String> {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        }

        Self {
            text: req.question.trim().to_string(),
            image_ref: non_blank(req.image_ref),
            subject_hint: non_blank(req.subject),
            session_id: non_blank(req.session_id),
        }
    }
}

/// Frames sent from the pipeline to the client
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientFrame {
    /// Transport is live; sent before any model latency is incurred
    Init,
    /// Incremental answer text
    Content {
        /// The text delta
        text: String,
    },
    /// The stored answer differs from what was streamed
    ModerationNotice {
        /// Human-readable notice
        message: String,
    },
    /// Diagnostic notice; the request continues
    Error {
        /// Error description
        message: String,
    },
    /// Terminal frame
    Done,
}

impl ClientFrame {
    /// Shorthand for a content frame
    pub fn content(text: impl Into<String>) -> Self {
        Self::Content { text: text.into() }
    }

    /// Shorthand for an error frame
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Whether this is the terminal frame
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// Text of a content frame
    #[must_use]
    pub fn content_text(&self) -> Option<&str> {
        match self {
            Self::Content { text } => Some(text),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_unique() {
        let a = RequestId::new();
        let b = RequestId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string(), a.as_str());
    }

    #[test]
    fn test_answer_request_camel_case() {
        let req: AnswerRequest = serde_json::from_str(
            r#"{"question":" 什么是正当防卫 ","imageRef":"img/1.png","sessionId":"chat-9"}"#,
        )
        .unwrap();
        let question = Question::from(req);

        assert_eq!(question.text, "什么是正当防卫");
        assert_eq!(question.image_ref.as_deref(), Some("img/1.png"));
        assert_eq!(question.subject_hint, None);
        assert_eq!(question.session_id.as_deref(), Some("chat-9"));
    }

    #[test]
    fn test_blank_optionals_are_absent() {
        let req = AnswerRequest {
            question: "q".into(),
            image_ref: Some("  ".into()),
            subject: Some(String::new()),
            session_id: None,
        };
        let question = Question::from(req);
        assert!(question.image_ref.is_none());
        assert!(question.subject_hint.is_none());
    }

    #[test]
    fn test_only_done_is_terminal() {
        assert!(ClientFrame::Done.is_terminal());
        assert!(!ClientFrame::Init.is_terminal());
        assert!(!ClientFrame::content("x").is_terminal());
        assert!(!ClientFrame::error("x").is_terminal());
    }
}
