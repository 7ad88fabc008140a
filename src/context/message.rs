//! Chat turns held by a conversation context

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use super::allocator::IdCategory;

/// Approximate bytes per token for context estimation
pub const APPROX_BYTES_PER_TOKEN: usize = 4;

/// Speaker of a chat turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Identifier of a message inside one session.
///
/// Raw and compressed messages are numbered by separate counters, so the
/// category is part of the identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId {
    pub category: IdCategory,
    pub value: u64,
}

impl MessageId {
    pub fn raw(value: u64) -> Self {
        Self {
            category: IdCategory::Raw,
            value,
        }
    }

    pub fn compressed(value: u64) -> Self {
        Self {
            category: IdCategory::Compressed,
            value,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.category, self.value)
    }
}

/// A single chat turn.
///
/// Messages are never edited after creation; the store only adds and
/// removes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub is_compressed: bool,
    /// Raw ids this message stands in for (empty for raw messages)
    pub source_ids: BTreeSet<u64>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub(crate) fn raw(id: u64, role: Role, content: String) -> Self {
        Self {
            id: MessageId::raw(id),
            role,
            content,
            is_compressed: false,
            source_ids: BTreeSet::new(),
            created_at: Utc::now(),
        }
    }

    /// Build a summary turn replacing `sources`.
    ///
    /// Sources that are themselves summaries contribute their own raw ids,
    /// so `source_ids` always names literal turns.
    pub(crate) fn compressed(id: u64, summary: String, sources: &[Message]) -> Self {
        let source_ids = sources
            .iter()
            .flat_map(|m| {
                if m.is_compressed {
                    m.source_ids.iter().copied().collect::<Vec<_>>()
                } else {
                    vec![m.id.value]
                }
            })
            .collect();

        Self {
            id: MessageId::compressed(id),
            role: Role::User,
            content: summary,
            is_compressed: true,
            source_ids,
            created_at: Utc::now(),
        }
    }

    /// Estimate token count for this message
    pub fn estimate_tokens(&self) -> usize {
        self.content.len() / APPROX_BYTES_PER_TOKEN
    }

    /// Reduce to the `{role, content}` form sent to a model
    pub fn to_entry(&self) -> ContextEntry {
        ContextEntry {
            role: self.role,
            content: self.content.clone(),
        }
    }
}

/// The `{role, content}` view of a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub role: Role,
    pub content: String,
}

impl ContextEntry {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Rough token estimate for a rendered context.
///
/// Stands in for a model tokenizer when the caller has none.
pub fn estimate_tokens(entries: &[ContextEntry]) -> usize {
    entries
        .iter()
        .map(|e| e.content.len() / APPROX_BYTES_PER_TOKEN)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trip_through_str() {
        assert_eq!("User".parse::<Role>().unwrap(), Role::User);
        assert_eq!(" assistant ".parse::<Role>().unwrap(), Role::Assistant);
        assert!("tool".parse::<Role>().is_err());
        assert_eq!(Role::System.to_string(), "system");
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let entry = ContextEntry::new(Role::Assistant, "hi");
        let json = serde_json::to_string(&entry).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"hi"}"#);
    }

    #[test]
    fn test_compressed_folds_nested_sources() {
        let a = Message::raw(1, Role::User, "a".to_string());
        let b = Message::raw(2, Role::Assistant, "b".to_string());
        let first = Message::compressed(1, "ab".to_string(), &[a, b]);
        let c = Message::raw(3, Role::User, "c".to_string());

        let second = Message::compressed(2, "abc".to_string(), &[first, c]);
        assert!(second.is_compressed);
        assert_eq!(second.role, Role::User);
        assert_eq!(second.id, MessageId::compressed(2));
        assert_eq!(second.source_ids.into_iter().collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_token_estimation() {
        let msg = Message::raw(1, Role::User, "hello world, hello".to_string());
        assert_eq!(msg.estimate_tokens(), 4);
        assert_eq!(estimate_tokens(&[msg.to_entry(), msg.to_entry()]), 8);
    }

    #[test]
    fn test_message_id_display() {
        assert_eq!(MessageId::raw(7).to_string(), "raw-7");
        assert_eq!(MessageId::compressed(2).to_string(), "compressed-2");
    }
}
