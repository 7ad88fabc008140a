//! Per-session message id allocation

use serde::{Deserialize, Serialize};
use std::fmt;

/// Counter namespace inside a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdCategory {
    Raw,
    Compressed,
}

impl IdCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Compressed => "compressed",
        }
    }
}

impl fmt::Display for IdCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of an allocator, for inspection or persistence by the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatorState {
    pub session: String,
    pub category: IdCategory,
    pub current_id: u64,
}

/// Issues gap-free, increasing ids for one (session, category) pair.
///
/// Two allocators for the same pair would hand out colliding ids. Nothing
/// checks for that at runtime: each `ConversationContext` owns its
/// allocators exclusively and never exposes them mutably.
#[derive(Debug)]
pub struct IdAllocator {
    session: String,
    category: IdCategory,
    current_id: u64,
}

impl IdAllocator {
    pub fn new(session: impl Into<String>, category: IdCategory, start: u64) -> Self {
        Self {
            session: session.into(),
            category,
            current_id: start,
        }
    }

    /// Resume from a previously captured state
    pub fn from_state(state: AllocatorState) -> Self {
        Self {
            session: state.session,
            category: state.category,
            current_id: state.current_id,
        }
    }

    /// Return the current counter, then advance it
    pub fn next(&mut self) -> u64 {
        let id = self.current_id;
        self.current_id += 1;
        id
    }

    /// Rewind the counter. Only valid once every id it issued is gone.
    pub fn reset(&mut self, start: u64) {
        self.current_id = start;
    }

    pub fn state(&self) -> AllocatorState {
        AllocatorState {
            session: self.session.clone(),
            category: self.category,
            current_id: self.current_id,
        }
    }

    pub fn category(&self) -> IdCategory {
        self.category
    }
}
