//! Pluggable summarization used by the compression worker
//!
//! Any type implementing [`Summarizer`] can be registered on a context; the
//! signature is checked by the compiler at registration time.

use std::sync::Arc;

use async_trait::async_trait;

use super::message::{Message, Role};

/// Why a summarizer produced nothing usable
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SummarizeError {
    #[error("Summarization failed: {0}")]
    Failed(String),

    #[error("Summarizer returned an empty summary")]
    Empty,

    #[error("Summarizer panicked")]
    Panicked,
}

/// Condenses a run of turns into a single summary string
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, messages: &[Message]) -> Result<String, SummarizeError>;
}

/// Wrapper for a closure-based summarizer.
///
/// The closure may block (a synchronous model call, say); it runs on
/// tokio's blocking pool so the runtime threads stay free.
pub struct FnSummarizer<F>(Arc<F>);

impl<F> FnSummarizer<F>
where
    F: Fn(&[Message]) -> Result<String, SummarizeError> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self(Arc::new(f))
    }
}

#[async_trait]
impl<F> Summarizer for FnSummarizer<F>
where
    F: Fn(&[Message]) -> Result<String, SummarizeError> + Send + Sync + 'static,
{
    async fn summarize(&self, messages: &[Message]) -> Result<String, SummarizeError> {
        let f = self.0.clone();
        let messages = messages.to_vec();
        tokio::task::spawn_blocking(move || f(&messages))
            .await
            .unwrap_or(Err(SummarizeError::Panicked))
    }
}

/// Maximum characters kept from each quoted turn
const EXCERPT_CHARS: usize = 80;

/// Number of most recent turns quoted in the digest
const EXCERPT_TURNS: usize = 5;

/// Model-free summarizer that quotes the start of the most recent turns.
///
/// Useful as a default when no model is wired up, and for tests.
#[derive(Debug, Clone, Default)]
pub struct ExtractiveSummarizer;

impl ExtractiveSummarizer {
    pub fn digest(messages: &[Message]) -> String {
        let users = messages.iter().filter(|m| m.role == Role::User).count();
        let mut summary = format!(
            "Earlier conversation ({} turns, {} from the user):\n",
            messages.len(),
            users
        );

        let skip = messages.len().saturating_sub(EXCERPT_TURNS);
        for msg in messages.iter().skip(skip) {
            let end = msg
                .content
                .char_indices()
                .nth(EXCERPT_CHARS)
                .map(|(i, _)| i)
                .unwrap_or(msg.content.len());
            summary.push_str(&format!("- [{}] {}\n", msg.role, &msg.content[..end]));
        }

        summary
    }
}

#[async_trait]
impl Summarizer for ExtractiveSummarizer {
    async fn summarize(&self, messages: &[Message]) -> Result<String, SummarizeError> {
        if messages.is_empty() {
            return Err(SummarizeError::Empty);
        }
        Ok(Self::digest(messages))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn turns() -> Vec<Message> {
        vec![
            Message::raw(1, Role::User, "Plan the migration".to_string()),
            Message::raw(2, Role::Assistant, "x".repeat(200)),
        ]
    }

    #[tokio::test]
    async fn test_fn_summarizer() {
        let summarizer = FnSummarizer::new(|msgs| Ok(format!("{} turns", msgs.len())));
        assert_eq!(summarizer.summarize(&turns()).await.unwrap(), "2 turns");

        let failing =
            FnSummarizer::new(|_| Err(SummarizeError::Failed("model offline".to_string())));
        assert_eq!(
            failing.summarize(&turns()).await,
            Err(SummarizeError::Failed("model offline".to_string()))
        );
    }

    #[tokio::test]
    async fn test_fn_summarizer_panic_is_reported() {
        let summarizer = FnSummarizer::new(|_| panic!("model exploded"));
        assert_eq!(
            summarizer.summarize(&turns()).await,
            Err(SummarizeError::Panicked)
        );
    }

    /// A blocking closure leaves a current-thread runtime free to run
    /// other tasks
    #[tokio::test]
    async fn test_fn_summarizer_does_not_block_runtime() {
        let summarizer = FnSummarizer::new(|msgs| {
            std::thread::sleep(Duration::from_millis(300));
            Ok(format!("{} turns", msgs.len()))
        });
        let messages = turns();
        let slow = tokio::spawn(async move { summarizer.summarize(&messages).await });

        tokio::task::yield_now().await;
        let started = std::time::Instant::now();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(started.elapsed() < Duration::from_millis(200));

        assert_eq!(slow.await.unwrap().unwrap(), "2 turns");
    }

    #[tokio::test]
    async fn test_extractive_digest() {
        let summary = ExtractiveSummarizer.summarize(&turns()).await.unwrap();
        assert!(summary.contains("2 turns, 1 from the user"));
        assert!(summary.contains("[user] Plan the migration"));
        assert!(summary.contains(&format!("[assistant] {}\n", "x".repeat(80))));
        assert!(!summary.contains(&"x".repeat(81)));
    }

    #[tokio::test]
    async fn test_extractive_rejects_empty_input() {
        assert_eq!(
            ExtractiveSummarizer.summarize(&[]).await,
            Err(SummarizeError::Empty)
        );
    }
}
