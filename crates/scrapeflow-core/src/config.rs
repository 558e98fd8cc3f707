use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScrapeError};

/// Top-level scrapeflow configuration.
///
/// Loaded once, then shared immutably (behind an `Arc`) by every execution
/// of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub llm: LlmConfig,
    /// Optional target record shape for generated answers.
    #[serde(default)]
    pub schema: Option<serde_json::Value>,
    /// Cap on the number of items kept in array-valued answer fields.
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default)]
    pub rate_limiter: Option<RateLimiterConfig>,
    #[serde(default)]
    pub browser: BrowserConfig,
    /// Maximum number of sources executed at the same time.
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    /// Per-source deadline in seconds (0 = no deadline).
    #[serde(default = "default_source_timeout")]
    pub source_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub parse: ParseConfig,
    #[serde(default)]
    pub merge: MergeStrategy,
    /// Maximum number of images described per source.
    #[serde(default = "default_max_images")]
    pub max_images: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            schema: None,
            max_results: default_max_results(),
            rate_limiter: None,
            browser: BrowserConfig::default(),
            concurrency_limit: default_concurrency_limit(),
            source_timeout_secs: default_source_timeout(),
            retry: RetryConfig::default(),
            parse: ParseConfig::default(),
            merge: MergeStrategy::default(),
            max_images: default_max_images(),
        }
    }
}

fn default_max_results() -> usize { 20 }
fn default_concurrency_limit() -> usize { 4 }
fn default_source_timeout() -> u64 { 120 }
fn default_max_images() -> usize { 5 }

/// LLM selection. `model` is written as `provider/model_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            api_key: None,
            base_url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

impl LlmConfig {
    /// Provider part of `model`, or "openai" when no provider prefix is given.
    pub fn provider(&self) -> &str {
        match self.model.split_once('/') {
            Some((provider, _)) => provider,
            None => "openai",
        }
    }

    /// Model id part of `model`.
    pub fn model_id(&self) -> &str {
        match self.model.split_once('/') {
            Some((_, id)) => id,
            None => &self.model,
        }
    }
}

fn default_model() -> String { "openai/gpt-4o-mini".to_string() }
fn default_max_tokens() -> u32 { 4096 }
fn default_temperature() -> f32 { 0.0 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    pub requests_per_second: f64,
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,
}

fn default_burst_size() -> u32 { 1 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    #[serde(default = "default_headless")]
    pub headless: bool,
    #[serde(default = "default_browser_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: default_headless(),
            timeout_secs: default_browser_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_headless() -> bool { true }
fn default_browser_timeout() -> u64 { 30 }
fn default_user_agent() -> String { "scrapeflow/0.1".to_string() }

/// Retry bounds for nodes that declare a retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 2 }
fn default_initial_backoff() -> u64 { 500 }
fn default_max_backoff() -> u64 { 10_000 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseConfig {
    /// Chunk size in tokens handed to the model.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Convert HTML to text before chunking.
    #[serde(default = "default_parse_html")]
    pub parse_html: bool,
    /// Harvest link and image URLs from the document.
    #[serde(default)]
    pub parse_urls: bool,
}

impl Default for ParseConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            parse_html: default_parse_html(),
            parse_urls: false,
        }
    }
}

fn default_chunk_size() -> usize { 8192 }
fn default_parse_html() -> bool { true }

/// How the merge stage consolidates per-source answers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Deterministic: array fields are concatenated, other answers collected.
    #[default]
    Concatenate,
    /// Ask the LLM to consolidate; falls back to `Concatenate` on failure.
    Llm,
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| ScrapeError::ConfigNotFound(path.display().to_string()))?;
        Self::parse(&content)
    }

    /// Parse config from TOML text, with env var expansion.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self =
            toml::from_str(&expanded).map_err(|e| ScrapeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.concurrency_limit == 0 {
            return Err(ScrapeError::Config("concurrency_limit must be at least 1".into()));
        }
        if let Some(ref limiter) = self.rate_limiter {
            if limiter.requests_per_second <= 0.0 || limiter.burst_size == 0 {
                return Err(ScrapeError::Config(
                    "rate_limiter needs a positive requests_per_second and burst_size".into(),
                ));
            }
        }
        if self.parse.chunk_size < 1000 {
            return Err(ScrapeError::Config("parse.chunk_size must be at least 1000".into()));
        }
        Ok(())
    }

    /// Per-source deadline, if one is configured.
    pub fn source_timeout(&self) -> Option<Duration> {
        (self.source_timeout_secs > 0).then(|| Duration::from_secs(self.source_timeout_secs))
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep the reference when the variable is not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_SCRAPEFLOW_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_SCRAPEFLOW_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_SCRAPEFLOW_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_SCRAPEFLOW_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_SCRAPEFLOW_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config.llm.model, "openai/gpt-4o-mini");
        assert_eq!(config.concurrency_limit, 4);
        assert_eq!(config.max_results, 20);
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.parse.chunk_size, 8192);
        assert!(config.parse.parse_html);
        assert!(!config.parse.parse_urls);
        assert!(config.rate_limiter.is_none());
        assert!(config.schema.is_none());
        assert_eq!(config.merge, MergeStrategy::Concatenate);
        assert_eq!(config.source_timeout(), Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_model_split() {
        let mut llm = LlmConfig::default();
        assert_eq!(llm.provider(), "openai");
        assert_eq!(llm.model_id(), "gpt-4o-mini");

        llm.model = "ollama/llama3.2".into();
        assert_eq!(llm.provider(), "ollama");
        assert_eq!(llm.model_id(), "llama3.2");

        llm.model = "gpt-4o".into();
        assert_eq!(llm.provider(), "openai");
        assert_eq!(llm.model_id(), "gpt-4o");
    }

    #[test]
    fn test_schema_table_becomes_json() {
        let toml_str = r#"
[schema]
type = "object"
required = ["products"]

[schema.properties.products]
type = "array"
"#;
        let config = AppConfig::parse(toml_str).unwrap();
        let schema = config.schema.unwrap();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["required"][0], "products");
        assert_eq!(schema["properties"]["products"]["type"], "array");
    }

    #[test]
    fn test_zero_timeout_disables_deadline() {
        let config = AppConfig::parse("source_timeout_secs = 0").unwrap();
        assert!(config.source_timeout().is_none());
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let err = AppConfig::parse("concurrency_limit = 0").unwrap_err();
        assert!(matches!(err, ScrapeError::Config(_)));
    }

    #[test]
    fn test_rejects_bad_rate_limiter() {
        let toml_str = r#"
[rate_limiter]
requests_per_second = 0.0
burst_size = 2
"#;
        assert!(AppConfig::parse(toml_str).is_err());
    }
}
