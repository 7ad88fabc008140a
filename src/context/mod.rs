//! Conversation context for a single session
//!
//! Holds the ordered chat history, keeps it under a token budget by
//! summarizing or evicting the oldest turns, and serves a consistent view
//! of the current context without waiting on summarization.

mod allocator;
mod applier;
mod budget;
mod conversation;
mod message;
mod store;
mod summarizer;
mod worker;

pub use allocator::{AllocatorState, IdAllocator, IdCategory};
pub use applier::ResultApplier;
pub use budget::{
    BudgetDecision, TokenBudgetConfig, TokenBudgetPolicy, DEFAULT_COMPRESSION_RATIO,
    DEFAULT_MAX_CONTEXT_TOKENS,
};
pub use conversation::{ConversationContext, Lifecycle};
pub use message::{estimate_tokens, ContextEntry, Message, MessageId, Role, APPROX_BYTES_PER_TOKEN};
pub use store::MessageStore;
pub use summarizer::{ExtractiveSummarizer, FnSummarizer, SummarizeError, Summarizer};
pub use worker::{CompressionJob, CompressionResult, CompressionStats};
