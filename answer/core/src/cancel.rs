//! Active request registry
//!
//! Maps request ids to their cancellation tokens so a stop request or a
//! shutdown can reach in-flight pipelines. Each request owns its own
//! token; registration hands back a guard that removes the entry when the
//! request finishes.

use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::messages::RequestId;

/// Registry of in-flight requests
#[derive(Clone, Debug, Default)]
pub struct ActiveRequests {
    tokens: Arc<DashMap<String, CancellationToken>>,
}

impl ActiveRequests {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request and get its token
    ///
    /// The entry lives until the returned guard is dropped.
    #[must_use]
    pub fn register(&self, request_id: &RequestId) -> RequestGuard {
        let token = CancellationToken::new();
        self.tokens
            .insert(request_id.as_str().to_string(), token.clone());
        RequestGuard {
            request_id: request_id.as_str().to_string(),
            token,
            tokens: Arc::clone(&self.tokens),
        }
    }

    /// Cancel one request; `false` if it is not registered
    pub fn cancel(&self, request_id: &str) -> bool {
        match self.tokens.get(request_id) {
            Some(entry) => {
                entry.value().cancel();
                tracing::info!(request_id, "Request cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancel every registered request, returning how many were signalled
    pub fn cancel_all(&self) -> usize {
        let mut count = 0;
        for entry in self.tokens.iter() {
            entry.value().cancel();
            count += 1;
        }
        count
    }

    /// Whether `request_id` is in flight
    #[must_use]
    pub fn contains(&self, request_id: &str) -> bool {
        self.tokens.contains_key(request_id)
    }

    /// Number of in-flight requests
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether nothing is in flight
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Registration handle for one request
#[derive(Debug)]
pub struct RequestGuard {
    request_id: String,
    token: CancellationToken,
    tokens: Arc<DashMap<String, CancellationToken>>,
}

impl RequestGuard {
    /// The request's cancellation token
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.tokens.remove(&self.request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_deregisters_on_drop() {
        let registry = ActiveRequests::new();
        let id = RequestId::new();
        let guard = registry.register(&id);
        assert!(registry.contains(id.as_str()));
        assert_eq!(registry.len(), 1);

        drop(guard);
        assert!(registry.is_empty());
        assert!(!registry.cancel(id.as_str()));
    }

    #[test]
    fn test_cancel_only_targets_one_request() {
        let registry = ActiveRequests::new();
        let a = registry.register(&RequestId::new());
        let b_id = RequestId::new();
        let b = registry.register(&b_id);

        assert!(registry.cancel(b_id.as_str()));
        assert!(b.token().is_cancelled());
        assert!(!a.token().is_cancelled());
    }

    #[test]
    fn test_cancel_wakes_waiting_stage() {
        use tokio_test::{assert_pending, assert_ready, task};

        let registry = ActiveRequests::new();
        let id = RequestId::new();
        let guard = registry.register(&id);
        let token = guard.token();
        let mut waiting = task::spawn(token.cancelled());

        assert_pending!(waiting.poll());
        registry.cancel(id.as_str());
        assert!(waiting.is_woken());
        assert_ready!(waiting.poll());
    }

    #[test]
    fn test_cancel_all() {
        let registry = ActiveRequests::new();
        let guards: Vec<_> = (0..3).map(|_| registry.register(&RequestId::new())).collect();
        assert_eq!(registry.cancel_all(), 3);
        assert!(guards.iter().all(|g| g.token().is_cancelled()));
    }
}
