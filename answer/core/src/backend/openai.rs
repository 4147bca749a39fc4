//! OpenAI-Compatible Backend
//!
//! Completion and embedding client for any service exposing the OpenAI
//! chat API shape (hosted providers, vLLM, Ollama's `/v1` endpoint).
//!
//! # Endpoints
//!
//! - `/chat/completions` - streaming chat completions
//! - `/embeddings` - text embeddings for the vector retrieval path
//! - `/models` - reachability probe

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};

use super::traits::{BackendError, ByteStream, CompletionBackend, CompletionRequest, Embedder};
use crate::config::UpstreamConfig;

/// Longest error body kept from a failed response
const MAX_ERROR_BODY: usize = 512;

/// OpenAI-compatible backend client
#[derive(Clone)]
pub struct OpenAiCompatibleBackend {
    /// Base URL, e.g. `http://localhost:11434/v1`
    base_url: String,
    /// Bearer token
    api_key: Option<String>,
    /// Model used for embeddings
    embedding_model: String,
    /// HTTP client
    http_client: reqwest::Client,
}

impl std::fmt::Debug for OpenAiCompatibleBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatibleBackend")
            .field("base_url", &self.base_url)
            .field("embedding_model", &self.embedding_model)
            .finish_non_exhaustive()
    }
}

impl OpenAiCompatibleBackend {
    /// Create a backend for `base_url`
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, BackendError> {
        let http_client = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            embedding_model: "nomic-embed-text".to_string(),
            http_client,
        })
    }

    /// Create from the `[upstream]` configuration section
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn from_config(config: &UpstreamConfig) -> Result<Self, BackendError> {
        let mut backend = Self::new(config.base_url.clone(), config.request_timeout)?;
        backend.api_key = config.api_key.clone();
        backend.embedding_model = config.embedding_model.clone();
        Ok(backend)
    }

    /// Set the bearer token
    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Set the embedding model
    #[must_use]
    pub fn with_embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = model.into();
        self
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn embeddings_url(&self) -> String {
        format!("{}/embeddings", self.base_url)
    }

    fn models_url(&self) -> String {
        format!("{}/models", self.base_url)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.api_key {
            Some(ref key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// Build the chat request body
    fn completion_body(request: &CompletionRequest) -> Value {
        let user_content = match request.image_ref {
            Some(ref image) => json!([
                { "type": "text", "text": request.user },
                { "type": "image_url", "image_url": { "url": image } },
            ]),
            None => json!(request.user),
        };

        let mut body = json!({
            "model": request.model,
            "stream": true,
            "temperature": request.temperature,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": user_content },
            ],
        });
        if request.max_tokens > 0 {
            body["max_tokens"] = json!(request.max_tokens);
        }
        body
    }
}

/// Turn a non-success response into a status error
async fn status_error(response: reqwest::Response) -> BackendError {
    let status = response.status().as_u16();
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let cut = (0..=MAX_ERROR_BODY)
            .rev()
            .find(|&i| body.is_char_boundary(i))
            .unwrap_or(0);
        body.truncate(cut);
    }
    BackendError::Status { status, body }
}

#[async_trait]
impl CompletionBackend for OpenAiCompatibleBackend {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    async fn health_check(&self) -> bool {
        self.authorized(self.http_client.get(self.models_url()))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .is_ok_and(|r| r.status().is_success())
    }

    async fn open_stream(&self, request: &CompletionRequest) -> Result<ByteStream, BackendError> {
        let body = Self::completion_body(request);

        let response = self
            .authorized(self.http_client.post(self.completions_url()))
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let stream = response.bytes_stream().map(|chunk| {
            chunk
                .map(|bytes| bytes.to_vec())
                .map_err(|e| BackendError::Stream(e.to_string()))
        });

        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl Embedder for OpenAiCompatibleBackend {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, BackendError> {
        let body = json!({ "model": self.embedding_model, "input": text });

        let response = self
            .authorized(self.http_client.post(self.embeddings_url()))
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;

        parse_embedding(&data)
    }
}

/// Extract the first embedding vector from an `/embeddings` response
#[allow(clippy::cast_possible_truncation)]
fn parse_embedding(data: &Value) -> Result<Vec<f32>, BackendError> {
    let values = data
        .pointer("/data/0/embedding")
        .and_then(Value::as_array)
        .ok_or_else(|| BackendError::InvalidResponse("missing data[0].embedding".to_string()))?;

    values
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| BackendError::InvalidResponse("non-numeric embedding".to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls_strip_trailing_slash() {
        let backend =
            OpenAiCompatibleBackend::new("http://localhost:11434/v1/", Duration::from_secs(5))
                .unwrap();
        assert_eq!(
            backend.completions_url(),
            "http://localhost:11434/v1/chat/completions"
        );
        assert_eq!(backend.embeddings_url(), "http://localhost:11434/v1/embeddings");
        assert_eq!(backend.models_url(), "http://localhost:11434/v1/models");
    }

    #[test]
    fn test_from_config() {
        let config = UpstreamConfig {
            api_key: Some("sk-test".to_string()),
            embedding_model: "bge-m3".to_string(),
            ..Default::default()
        };
        let backend = OpenAiCompatibleBackend::from_config(&config).unwrap();
        assert_eq!(backend.api_key.as_deref(), Some("sk-test"));
        assert_eq!(backend.embedding_model, "bge-m3");
        assert!(!format!("{backend:?}").contains("sk-test"));
    }

    #[test]
    fn test_completion_body_text_only() {
        let request = CompletionRequest::new("preamble", "question", "qwen2.5");
        let body = OpenAiCompatibleBackend::completion_body(&request);

        assert_eq!(body["model"], "qwen2.5");
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "preamble");
        assert_eq!(body["messages"][1]["content"], "question");
        assert!(body.get("max_tokens").is_none());
    }

    #[test]
    fn test_completion_body_with_image() {
        let request = CompletionRequest::new("preamble", "question", "qwen-vl")
            .with_image(Some("https://img.example.com/q.png".to_string()))
            .with_max_tokens(512);
        let body = OpenAiCompatibleBackend::completion_body(&request);

        let content = &body["messages"][1]["content"];
        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[0]["text"], "question");
        assert_eq!(content[1]["type"], "image_url");
        assert_eq!(content[1]["image_url"]["url"], "https://img.example.com/q.png");
        assert_eq!(body["max_tokens"], 512);
    }

    #[test]
    fn test_parse_embedding() {
        let data = json!({ "data": [{ "embedding": [0.5, -0.25, 1.0] }] });
        assert_eq!(parse_embedding(&data).unwrap(), vec![0.5, -0.25, 1.0]);

        let missing = json!({ "data": [] });
        assert!(matches!(
            parse_embedding(&missing),
            Err(BackendError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_transport_error() {
        // Port 9 (discard) is not expected to serve HTTP
        let backend =
            OpenAiCompatibleBackend::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let request = CompletionRequest::new("s", "u", "m");

        let result = backend.open_stream(&request).await;
        assert!(matches!(result, Err(BackendError::Transport(_))));
        assert!(!backend.health_check().await);
    }
}
