//! Pipeline Configuration
//!
//! Centralized configuration loading for the answer pipeline and its daemon,
//! backed by a TOML file at `~/.config/answer-relay/answer.toml`.
//!
//! # Configuration Priority
//!
//! Values are resolved with the following priority (highest first):
//! 1. CLI arguments (applied by the caller through [`ConfigOverrides`])
//! 2. Environment variables (`ANSWER_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [upstream]
//! base_url = "http://localhost:11434/v1"
//! model = "qwen2.5"
//! embedding_model = "nomic-embed-text"
//! request_timeout_secs = 120
//!
//! [retrieval]
//! deadline_ms = 2000
//! keyword_timeout_ms = 800
//! similarity_floor = 0.1
//! top_k = 5
//!
//! [fallback]
//! piece_chars = 12
//! piece_delay_ms = 30
//!
//! [moderation]
//! timeout_ms = 3000
//! blocked_terms = ["赌博", "代考"]
//!
//! [store]
//! answers_path = "/var/lib/answer-relay/answers.jsonl"
//!
//! [server]
//! bind_addr = "127.0.0.1:8787"
//! max_question_chars = 4000
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[upstream]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamToml {
    /// Base URL of the OpenAI-compatible API
    pub base_url: Option<String>,
    /// Bearer token
    pub api_key: Option<String>,
    /// Completion model
    pub model: Option<String>,
    /// Embedding model
    pub embedding_model: Option<String>,
    /// Whole-request timeout in seconds
    pub request_timeout_secs: Option<u64>,
    /// Maximum tokens in the answer (0 = upstream default)
    pub max_tokens: Option<u32>,
    /// Sampling temperature
    pub temperature: Option<f32>,
}

/// `[retrieval]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalToml {
    /// Deadline for the vector path in milliseconds
    pub deadline_ms: Option<u64>,
    /// Timeout for the keyword fallback in milliseconds
    pub keyword_timeout_ms: Option<u64>,
    /// Minimum similarity a chunk needs to be kept
    pub similarity_floor: Option<f32>,
    /// Number of chunks requested from each path
    pub top_k: Option<usize>,
    /// Path to the knowledge index file
    pub knowledge_path: Option<String>,
}

/// `[fallback]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackToml {
    /// Characters per emitted piece
    pub piece_chars: Option<usize>,
    /// Delay between pieces in milliseconds
    pub piece_delay_ms: Option<u64>,
}

/// `[moderation]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModerationToml {
    /// Moderation timeout in milliseconds
    pub timeout_ms: Option<u64>,
    /// Terms that reject an answer outright
    pub blocked_terms: Option<Vec<String>>,
    /// Terms that are masked but allowed
    pub masked_terms: Option<Vec<String>>,
}

/// `[store]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreToml {
    /// JSON-lines file receiving persisted answers
    pub answers_path: Option<String>,
    /// Knowledge-extraction endpoint
    pub extraction_url: Option<String>,
}

/// `[server]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// Listen address
    pub bind_addr: Option<String>,
    /// Outbound frame buffer per stream
    pub channel_capacity: Option<usize>,
    /// Longest accepted question in characters
    pub max_question_chars: Option<usize>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnswerToml {
    /// Upstream completion service
    pub upstream: UpstreamToml,
    /// Context retrieval
    pub retrieval: RetrievalToml,
    /// Fallback synthesizer
    pub fallback: FallbackToml,
    /// Moderation stage
    pub moderation: ModerationToml,
    /// Persistence
    pub store: StoreToml,
    /// HTTP server
    pub server: ServerToml,
}

// =============================================================================
// Resolved Configuration
// =============================================================================

/// Upstream completion service settings
#[derive(Clone, Debug)]
pub struct UpstreamConfig {
    /// Base URL, without a trailing slash
    pub base_url: String,
    /// Bearer token, if the service needs one
    pub api_key: Option<String>,
    /// Completion model
    pub model: String,
    /// Embedding model
    pub embedding_model: String,
    /// Whole-request timeout
    pub request_timeout: Duration,
    /// Maximum tokens in the answer (0 = upstream default)
    pub max_tokens: u32,
    /// Sampling temperature
    pub temperature: f32,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".to_string(),
            api_key: None,
            model: "qwen2.5".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            request_timeout: Duration::from_secs(120),
            max_tokens: 0,
            temperature: 0.7,
        }
    }
}

/// Retrieval race settings
#[derive(Clone, Debug)]
pub struct RetrievalConfig {
    /// Ceiling for the vector path
    pub deadline: Duration,
    /// Ceiling for the keyword fallback; shorter than `deadline`
    pub keyword_timeout: Duration,
    /// Chunks scoring below this are dropped
    pub similarity_floor: f32,
    /// Number of chunks requested
    pub top_k: usize,
    /// Knowledge index file
    pub knowledge_path: Option<PathBuf>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_millis(2000),
            keyword_timeout: Duration::from_millis(800),
            similarity_floor: 0.1,
            top_k: 5,
            knowledge_path: None,
        }
    }
}

/// Fallback pacing settings
#[derive(Clone, Debug)]
pub struct FallbackConfig {
    /// Characters per emitted piece
    pub piece_chars: usize,
    /// Delay between pieces
    pub piece_delay: Duration,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            piece_chars: 12,
            piece_delay: Duration::from_millis(30),
        }
    }
}

/// Moderation stage settings
#[derive(Clone, Debug)]
pub struct ModerationConfig {
    /// How long the stage waits for a verdict
    pub timeout: Duration,
    /// Terms that reject an answer
    pub blocked_terms: Vec<String>,
    /// Terms that are masked with `*`
    pub masked_terms: Vec<String>,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(3000),
            blocked_terms: Vec::new(),
            masked_terms: Vec::new(),
        }
    }
}

/// Persistence settings
#[derive(Clone, Debug, Default)]
pub struct StoreConfig {
    /// JSON-lines answer file; `None` keeps answers in memory
    pub answers_path: Option<PathBuf>,
    /// Knowledge-extraction endpoint; `None` extracts locally
    pub extraction_url: Option<String>,
}

/// HTTP server settings
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Listen address
    pub bind_addr: String,
    /// Outbound frame buffer per stream
    pub channel_capacity: usize,
    /// Longest accepted question in characters
    pub max_question_chars: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8787".to_string(),
            channel_capacity: 64,
            max_question_chars: 4000,
        }
    }
}

/// Effective configuration of the pipeline
#[derive(Clone, Debug, Default)]
pub struct PipelineConfig {
    /// Upstream completion service
    pub upstream: UpstreamConfig,
    /// Context retrieval
    pub retrieval: RetrievalConfig,
    /// Fallback synthesizer
    pub fallback: FallbackConfig,
    /// Moderation stage
    pub moderation: ModerationConfig,
    /// Persistence
    pub store: StoreConfig,
    /// HTTP server
    pub server: ServerConfig,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    /// Source of configuration values
    source: Option<ConfigSource>,
}

impl PipelineConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source.unwrap_or(ConfigSource::Default)
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = Some(source);
    }

    /// Reject values the pipeline cannot run with
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::ValidationError(msg.to_string()));

        if self.upstream.base_url.trim().is_empty() {
            return invalid("upstream.base_url must not be empty");
        }
        if self.upstream.model.trim().is_empty() {
            return invalid("upstream.model must not be empty");
        }
        if !(0.0..=2.0).contains(&self.upstream.temperature) {
            return invalid("upstream.temperature must be within [0, 2]");
        }
        if self.retrieval.deadline.is_zero() {
            return invalid("retrieval.deadline_ms must be greater than zero");
        }
        if self.retrieval.keyword_timeout >= self.retrieval.deadline {
            return invalid("retrieval.keyword_timeout_ms must be shorter than deadline_ms");
        }
        if !(0.0..=1.0).contains(&self.retrieval.similarity_floor) {
            return invalid("retrieval.similarity_floor must be within [0, 1]");
        }
        if self.retrieval.top_k == 0 {
            return invalid("retrieval.top_k must be at least 1");
        }
        if self.fallback.piece_chars == 0 {
            return invalid("fallback.piece_chars must be at least 1");
        }
        if self.server.channel_capacity == 0 {
            return invalid("server.channel_capacity must be at least 1");
        }
        if self.server.max_question_chars == 0 {
            return invalid("server.max_question_chars must be at least 1");
        }
        Ok(())
    }

    /// Render the configuration as TOML with secrets redacted
    #[must_use]
    pub fn to_redacted_toml(&self) -> String {
        let path_str = |p: &Option<PathBuf>| p.as_ref().map(|p| p.display().to_string());
        let view = AnswerToml {
            upstream: UpstreamToml {
                base_url: Some(self.upstream.base_url.clone()),
                api_key: self.upstream.api_key.as_ref().map(|_| "<redacted>".to_string()),
                model: Some(self.upstream.model.clone()),
                embedding_model: Some(self.upstream.embedding_model.clone()),
                request_timeout_secs: Some(self.upstream.request_timeout.as_secs()),
                max_tokens: Some(self.upstream.max_tokens),
                temperature: Some(self.upstream.temperature),
            },
            retrieval: RetrievalToml {
                deadline_ms: Some(duration_ms(self.retrieval.deadline)),
                keyword_timeout_ms: Some(duration_ms(self.retrieval.keyword_timeout)),
                similarity_floor: Some(self.retrieval.similarity_floor),
                top_k: Some(self.retrieval.top_k),
                knowledge_path: path_str(&self.retrieval.knowledge_path),
            },
            fallback: FallbackToml {
                piece_chars: Some(self.fallback.piece_chars),
                piece_delay_ms: Some(duration_ms(self.fallback.piece_delay)),
            },
            moderation: ModerationToml {
                timeout_ms: Some(duration_ms(self.moderation.timeout)),
                blocked_terms: Some(self.moderation.blocked_terms.clone()),
                masked_terms: Some(self.moderation.masked_terms.clone()),
            },
            store: StoreToml {
                answers_path: path_str(&self.store.answers_path),
                extraction_url: self.store.extraction_url.clone(),
            },
            server: ServerToml {
                bind_addr: Some(self.server.bind_addr.clone()),
                channel_capacity: Some(self.server.channel_capacity),
                max_question_chars: Some(self.server.max_question_chars),
            },
        };
        toml::to_string(&view).unwrap_or_default()
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/answer-relay/answer.toml` or
/// `~/.config/answer-relay/answer.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("answer-relay").join("answer.toml"))
}

/// Load configuration from the default path
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<PipelineConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<PipelineConfig, ConfigError> {
    let mut config = PipelineConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: AnswerToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.set_source(ConfigSource::File);

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config);

    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut PipelineConfig, toml: &AnswerToml) {
    let up = &toml.upstream;
    if let Some(ref url) = up.base_url {
        config.upstream.base_url = url.trim_end_matches('/').to_string();
    }
    if up.api_key.is_some() {
        config.upstream.api_key = up.api_key.clone();
    }
    if let Some(ref model) = up.model {
        config.upstream.model = model.clone();
    }
    if let Some(ref model) = up.embedding_model {
        config.upstream.embedding_model = model.clone();
    }
    if let Some(secs) = up.request_timeout_secs {
        config.upstream.request_timeout = Duration::from_secs(secs);
    }
    if let Some(max) = up.max_tokens {
        config.upstream.max_tokens = max;
    }
    if let Some(temperature) = up.temperature {
        config.upstream.temperature = temperature;
    }

    let rt = &toml.retrieval;
    if let Some(ms) = rt.deadline_ms {
        config.retrieval.deadline = Duration::from_millis(ms);
    }
    if let Some(ms) = rt.keyword_timeout_ms {
        config.retrieval.keyword_timeout = Duration::from_millis(ms);
    }
    if let Some(floor) = rt.similarity_floor {
        config.retrieval.similarity_floor = floor;
    }
    if let Some(k) = rt.top_k {
        config.retrieval.top_k = k;
    }
    if let Some(ref path) = rt.knowledge_path {
        config.retrieval.knowledge_path = Some(PathBuf::from(path));
    }

    if let Some(chars) = toml.fallback.piece_chars {
        config.fallback.piece_chars = chars;
    }
    if let Some(ms) = toml.fallback.piece_delay_ms {
        config.fallback.piece_delay = Duration::from_millis(ms);
    }

    if let Some(ms) = toml.moderation.timeout_ms {
        config.moderation.timeout = Duration::from_millis(ms);
    }
    if let Some(ref terms) = toml.moderation.blocked_terms {
        config.moderation.blocked_terms = terms.clone();
    }
    if let Some(ref terms) = toml.moderation.masked_terms {
        config.moderation.masked_terms = terms.clone();
    }

    if let Some(ref path) = toml.store.answers_path {
        config.store.answers_path = Some(PathBuf::from(path));
    }
    if toml.store.extraction_url.is_some() {
        config.store.extraction_url = toml.store.extraction_url.clone();
    }

    if let Some(ref addr) = toml.server.bind_addr {
        config.server.bind_addr = addr.clone();
    }
    if let Some(capacity) = toml.server.channel_capacity {
        config.server.channel_capacity = capacity;
    }
    if let Some(chars) = toml.server.max_question_chars {
        config.server.max_question_chars = chars;
    }
}

/// Apply environment variable overrides to the config
fn apply_env_config(config: &mut PipelineConfig) {
    apply_env_from(config, |key| std::env::var(key).ok());
}

/// Apply overrides from an arbitrary variable lookup
fn apply_env_from(config: &mut PipelineConfig, lookup: impl Fn(&str) -> Option<String>) {
    let number = |key: &str| -> Option<u64> { env_number(key, &lookup(key)?) };
    let mut touched = false;

    if let Some(url) = lookup("ANSWER_UPSTREAM_URL") {
        config.upstream.base_url = url.trim_end_matches('/').to_string();
        touched = true;
    }
    if let Some(key) = lookup("ANSWER_API_KEY") {
        config.upstream.api_key = Some(key).filter(|k| !k.is_empty());
        touched = true;
    }
    if let Some(model) = lookup("ANSWER_MODEL") {
        config.upstream.model = model;
        touched = true;
    }
    if let Some(model) = lookup("ANSWER_EMBEDDING_MODEL") {
        config.upstream.embedding_model = model;
        touched = true;
    }
    if let Some(ms) = number("ANSWER_RETRIEVAL_DEADLINE_MS") {
        config.retrieval.deadline = Duration::from_millis(ms);
        touched = true;
    }
    if let Some(ms) = number("ANSWER_KEYWORD_TIMEOUT_MS") {
        config.retrieval.keyword_timeout = Duration::from_millis(ms);
        touched = true;
    }
    if let Some(path) = lookup("ANSWER_KNOWLEDGE_PATH") {
        config.retrieval.knowledge_path = Some(PathBuf::from(path));
        touched = true;
    }
    if let Some(path) = lookup("ANSWER_STORE_PATH") {
        config.store.answers_path = Some(PathBuf::from(path));
        touched = true;
    }
    if let Some(url) = lookup("ANSWER_EXTRACTION_URL") {
        config.store.extraction_url = Some(url).filter(|u| !u.is_empty());
        touched = true;
    }
    if let Some(addr) = lookup("ANSWER_BIND_ADDR") {
        config.server.bind_addr = addr;
        touched = true;
    }
    if let Some(chars) = lookup("ANSWER_MAX_QUESTION_CHARS")
        .and_then(|v| env_number("ANSWER_MAX_QUESTION_CHARS", &v))
    {
        config.server.max_question_chars = chars;
        touched = true;
    }

    if touched {
        config.set_source(ConfigSource::Env);
    }
}

/// Parse a numeric variable, ignoring it with a warning when malformed
fn env_number<T>(key: &str, value: &str) -> Option<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match value.trim().parse() {
        Ok(n) => Some(n),
        Err(e) => {
            tracing::warn!(key, value, error = %e, "Ignoring malformed environment value");
            None
        }
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Listen address override
    pub bind_addr: Option<String>,
    /// Completion model override
    pub model: Option<String>,
    /// Knowledge index path override
    pub knowledge_path: Option<PathBuf>,
    /// Upstream URL override
    pub upstream_url: Option<String>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set listen address override
    #[must_use]
    pub fn with_bind_addr(mut self, addr: String) -> Self {
        self.bind_addr = Some(addr);
        self
    }

    /// Set model override
    #[must_use]
    pub fn with_model(mut self, model: String) -> Self {
        self.model = Some(model);
        self
    }

    /// Set knowledge index override
    #[must_use]
    pub fn with_knowledge_path(mut self, path: PathBuf) -> Self {
        self.knowledge_path = Some(path);
        self
    }

    /// Set upstream URL override
    #[must_use]
    pub fn with_upstream_url(mut self, url: String) -> Self {
        self.upstream_url = Some(url);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut PipelineConfig) {
        if self.bind_addr.is_some()
            || self.model.is_some()
            || self.knowledge_path.is_some()
            || self.upstream_url.is_some()
        {
            config.set_source(ConfigSource::Cli);
        }

        if let Some(ref addr) = self.bind_addr {
            config.server.bind_addr = addr.clone();
        }
        if let Some(ref model) = self.model {
            config.upstream.model = model.clone();
        }
        if let Some(ref path) = self.knowledge_path {
            config.retrieval.knowledge_path = Some(path.clone());
        }
        if let Some(ref url) = self.upstream_url {
            config.upstream.base_url = url.trim_end_matches('/').to_string();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
