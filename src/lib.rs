//! Turnkeeper - conversation context with a token budget
//!
//! A per-session chat history that:
//! - Keeps system prompts out of reach of any trimming
//! - Summarizes the oldest turns in the background when over budget
//! - Serves the current context without ever waiting on a summarizer

pub mod context;

pub use context::{
    ContextEntry, ConversationContext, ExtractiveSummarizer, FnSummarizer, Lifecycle, Message,
    MessageId, Role, SummarizeError, Summarizer, TokenBudgetConfig,
};

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for one conversation context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Session the context (and its id counters) belongs to
    pub session_id: String,

    /// Compression jobs that may wait before submitters block
    pub queue_capacity: usize,

    /// How often the worker and `wait_for_compression` re-check state
    pub poll_interval_ms: u64,

    /// How long `close` waits for the worker to exit
    pub shutdown_timeout_ms: u64,

    /// First id handed out by both id counters
    pub id_start: u64,

    /// Token budget and trim sizing
    pub budget: TokenBudgetConfig,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            session_id: "default".to_string(),
            queue_capacity: 16,
            poll_interval_ms: 50,
            shutdown_timeout_ms: 5_000,
            id_start: 1,
            budget: TokenBudgetConfig::default(),
        }
    }
}

impl ContextConfig {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Self::default()
        }
    }

    pub fn with_budget(mut self, budget: TokenBudgetConfig) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_max_context_tokens(mut self, max: usize) -> Self {
        self.budget.max_context_tokens = max;
        self
    }

    pub fn with_compression_ratio(mut self, ratio: f64) -> Self {
        self.budget.compression_ratio = ratio;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Millisecond granularity; a non-zero interval under 1ms becomes 1ms
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = whole_millis(interval);
        self
    }

    /// Millisecond granularity, rounded up like the poll interval
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = whole_millis(timeout);
        self
    }

    pub fn with_id_start(mut self, start: u64) -> Self {
        self.id_start = start;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Check the settings a context cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.session_id.trim().is_empty() {
            return Err(ContextError::InvalidConfig(
                "session_id must not be empty".to_string(),
            ));
        }
        if self.budget.max_context_tokens == 0 {
            return Err(ContextError::InvalidConfig(
                "max_context_tokens must be greater than zero".to_string(),
            ));
        }
        if !self.budget.compression_ratio.is_finite() {
            return Err(ContextError::InvalidConfig(
                "compression_ratio must be a finite number".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(ContextError::InvalidConfig(
                "queue_capacity must be greater than zero".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ContextError::InvalidConfig(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse a TOML document; missing keys take their defaults
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML config file
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_toml_str(&content)
    }
}

/// Whole milliseconds, rounding up and saturating at `u64::MAX`
fn whole_millis(duration: Duration) -> u64 {
    let millis = duration.as_nanos().div_ceil(1_000_000);
    u64::try_from(millis).unwrap_or(u64::MAX)
}

/// Result type for Turnkeeper operations
pub type Result<T> = std::result::Result<T, ContextError>;

/// Errors that can occur in Turnkeeper
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("Context is shutting down or stopped")]
    Closed,

    #[error("Compression queue is closed")]
    QueueClosed,

    #[error("No tokio runtime available to run the compression worker")]
    NoRuntime,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_builder() {
        let config = ContextConfig::new("s1")
            .with_max_context_tokens(100)
            .with_compression_ratio(0.25)
            .with_queue_capacity(4)
            .with_poll_interval(Duration::from_millis(10))
            .with_shutdown_timeout(Duration::from_secs(1))
            .with_id_start(100);

        assert_eq!(config.session_id, "s1");
        assert_eq!(config.budget.max_context_tokens, 100);
        assert_eq!(config.budget.compression_ratio, 0.25);
        assert_eq!(config.queue_capacity, 4);
        assert_eq!(config.poll_interval(), Duration::from_millis(10));
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(1));
        assert_eq!(config.id_start, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unusable_settings() {
        assert!(ContextConfig::new("").validate().is_err());
        assert!(ContextConfig::new("s1").with_max_context_tokens(0).validate().is_err());
        assert!(ContextConfig::new("s1").with_queue_capacity(0).validate().is_err());
        assert!(ContextConfig::new("s1")
            .with_compression_ratio(f64::INFINITY)
            .validate()
            .is_err());
        assert!(ContextConfig::new("s1")
            .with_poll_interval(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_durations_round_up_to_whole_millis() {
        let config = ContextConfig::new("s1")
            .with_poll_interval(Duration::from_micros(500))
            .with_shutdown_timeout(Duration::from_micros(1_500));
        assert_eq!(config.poll_interval_ms, 1);
        assert_eq!(config.shutdown_timeout_ms, 2);
        assert!(config.validate().is_ok());

        let config = ContextConfig::new("s1").with_shutdown_timeout(Duration::MAX);
        assert_eq!(config.shutdown_timeout_ms, u64::MAX);
    }

    #[test]
    fn test_from_toml_partial() {
        let config = ContextConfig::from_toml_str(
            r#"
            session_id = "chat-42"
            queue_capacity = 8

            [budget]
            max_context_tokens = 4096
            "#,
        )
        .unwrap();

        assert_eq!(config.session_id, "chat-42");
        assert_eq!(config.queue_capacity, 8);
        assert_eq!(config.budget.max_context_tokens, 4096);
        assert_eq!(config.budget.compression_ratio, 0.5);
        assert_eq!(config.poll_interval_ms, 50);
    }

    #[test]
    fn test_from_toml_invalid() {
        let err = ContextConfig::from_toml_str("[budget]\nmax_context_tokens = 0\n").unwrap_err();
        assert!(matches!(err, ContextError::InvalidConfig(_)));

        let err = ContextConfig::from_toml_str("queue_capacity = \"many\"").unwrap_err();
        assert!(matches!(err, ContextError::Toml(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "session_id = \"from-file\"").unwrap();

        let config = tokio_test::block_on(ContextConfig::load(file.path())).unwrap();
        assert_eq!(config.session_id, "from-file");
        assert_eq!(config, ContextConfig::new("from-file"));
    }
}
