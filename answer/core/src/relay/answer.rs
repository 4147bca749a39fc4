//! Accumulated answer text for one request.

/// Appended to a cancelled answer before it is stored
pub const CANCELLATION_MARKER: &str = "\n\n[回答已被用户中断]";

/// Append-only answer buffer owned by the relay
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccumulatedAnswer {
    text: String,
    cancelled: bool,
    from_fallback: bool,
}

impl AccumulatedAnswer {
    /// Empty answer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a content delta
    ///
    /// Ignored once the answer is cancelled.
    pub fn append(&mut self, delta: &str) {
        if !self.cancelled {
            self.text.push_str(delta);
        }
    }

    /// Mark cancelled and append the marker
    ///
    /// Idempotent. An empty answer stays empty.
    pub fn mark_cancelled(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        if !self.text.is_empty() {
            self.text.push_str(CANCELLATION_MARKER);
        }
    }

    /// Record that fallback content was used
    pub fn mark_fallback(&mut self) {
        self.from_fallback = true;
    }

    /// Text so far
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Whether no content has been seen
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Whether the request was cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Whether any content came from the fallback synthesizer
    #[must_use]
    pub fn from_fallback(&self) -> bool {
        self.from_fallback
    }
}
