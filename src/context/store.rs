//! Ordered message queue plus the protected system-prompt list

use std::collections::{HashSet, VecDeque};

use super::allocator::{AllocatorState, IdAllocator, IdCategory};
use super::message::{ContextEntry, Message, MessageId, Role};

/// Ordered chat turns for one session.
///
/// System prompts live in their own append-only list and are never handed
/// out for eviction or compression. Raw ids come from the store's own
/// allocator so that id issue and insertion happen under the same lock.
#[derive(Debug)]
pub struct MessageStore {
    /// Live turns (oldest first)
    queue: VecDeque<Message>,
    /// Protected prompts, rendered ahead of the queue
    system_prompts: Vec<Message>,
    allocator: IdAllocator,
    /// Turns already snapshotted into a pending compression job
    in_flight: HashSet<MessageId>,
}

impl MessageStore {
    pub fn new(session: impl Into<String>, id_start: u64) -> Self {
        Self {
            queue: VecDeque::new(),
            system_prompts: Vec::new(),
            allocator: IdAllocator::new(session, IdCategory::Raw, id_start),
            in_flight: HashSet::new(),
        }
    }

    /// Append a turn. Returns `None` without touching anything when the
    /// content is blank.
    pub fn add_message(&mut self, role: Role, content: impl Into<String>) -> Option<MessageId> {
        let content = content.into();
        if content.trim().is_empty() {
            return None;
        }
        let msg = Message::raw(self.allocator.next(), role, content);
        let id = msg.id;
        self.queue.push_back(msg);
        Some(id)
    }

    /// Append a protected system prompt
    pub fn add_system_prompt(&mut self, content: impl Into<String>) -> Option<MessageId> {
        let content = content.into();
        if content.trim().is_empty() {
            return None;
        }
        let msg = Message::raw(self.allocator.next(), Role::System, content);
        let id = msg.id;
        self.system_prompts.push(msg);
        Some(id)
    }

    /// Look a message up in the live queue, then among the system prompts
    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.queue
            .iter()
            .find(|m| m.id == id)
            .or_else(|| self.system_prompts.iter().find(|m| m.id == id))
    }

    /// Remove a live turn. System prompts cannot be removed.
    pub fn remove(&mut self, id: MessageId) -> Option<Message> {
        let index = self.position(id)?;
        self.in_flight.remove(&id);
        self.queue.remove(index)
    }

    /// Index of a live turn in the queue
    pub fn position(&self, id: MessageId) -> Option<usize> {
        self.queue.iter().position(|m| m.id == id)
    }

    /// Insert at `index`, clamped to the current queue bounds
    pub fn insert_at(&mut self, index: usize, msg: Message) -> usize {
        let index = index.min(self.queue.len());
        self.queue.insert(index, msg);
        index
    }

    /// Number of live turns (system prompts excluded)
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn system_prompt_count(&self) -> usize {
        self.system_prompts.len()
    }

    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.queue.iter()
    }

    pub fn system_prompts(&self) -> &[Message] {
        &self.system_prompts
    }

    /// System prompts followed by the live queue, as `{role, content}`
    pub fn snapshot_context(&self) -> Vec<ContextEntry> {
        self.system_prompts
            .iter()
            .chain(self.queue.iter())
            .map(Message::to_entry)
            .collect()
    }

    /// System prompts followed by the live queue, with metadata
    pub fn snapshot_messages(&self) -> Vec<Message> {
        self.system_prompts
            .iter()
            .chain(self.queue.iter())
            .cloned()
            .collect()
    }

    /// Live turns not already claimed by a pending compression job
    pub fn eligible_count(&self) -> usize {
        self.queue
            .iter()
            .filter(|m| !self.in_flight.contains(&m.id))
            .count()
    }

    /// Remove the `n` oldest eligible turns and return them
    pub fn evict_oldest(&mut self, n: usize) -> Vec<Message> {
        let mut evicted = Vec::with_capacity(n);
        let mut kept = VecDeque::with_capacity(self.queue.len());
        for msg in self.queue.drain(..) {
            if evicted.len() < n && !self.in_flight.contains(&msg.id) {
                evicted.push(msg);
            } else {
                kept.push_back(msg);
            }
        }
        self.queue = kept;
        evicted
    }

    /// Snapshot the `n` oldest eligible turns and mark them in flight.
    ///
    /// Returns the queue index of the first selected turn together with
    /// the copies. The originals stay in the queue.
    pub fn claim_oldest(&mut self, n: usize) -> Option<(usize, Vec<Message>)> {
        let mut start_index = None;
        let mut claimed = Vec::with_capacity(n);
        for (index, msg) in self.queue.iter().enumerate() {
            if claimed.len() == n {
                break;
            }
            if self.in_flight.contains(&msg.id) {
                continue;
            }
            start_index.get_or_insert(index);
            claimed.push(msg.clone());
        }
        let start_index = start_index?;
        for msg in &claimed {
            self.in_flight.insert(msg.id);
        }
        Some((start_index, claimed))
    }

    /// Forget in-flight marks for the given ids
    pub fn release(&mut self, ids: &[MessageId]) {
        for id in ids {
            self.in_flight.remove(id);
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Drop the live queue (and optionally the system prompts) and rewind
    /// the raw allocator to `id_start`
    pub fn clear(&mut self, keep_system: bool, id_start: u64) {
        self.queue.clear();
        self.in_flight.clear();
        if !keep_system {
            self.system_prompts.clear();
        }
        self.allocator.reset(id_start);
    }

    pub fn allocator_state(&self) -> AllocatorState {
        self.allocator.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(n: usize) -> MessageStore {
        let mut store = MessageStore::new("s1", 1);
        for i in 1..=n {
            store.add_message(Role::User, format!("msg{i}")).unwrap();
        }
        store
    }

    #[test]
    fn test_empty_content_is_rejected() {
        let mut store = MessageStore::new("s1", 1);
        assert!(store.add_message(Role::User, "").is_none());
        assert!(store.add_message(Role::User, "   \n").is_none());
        assert!(store.add_system_prompt("").is_none());
        assert!(store.is_empty());
        assert_eq!(store.allocator_state().current_id, 1);
    }

    #[test]
    fn test_ids_shared_between_turns_and_prompts() {
        let mut store = MessageStore::new("s1", 1);
        let a = store.add_message(Role::User, "a").unwrap();
        let p = store.add_system_prompt("be brief").unwrap();
        let b = store.add_message(Role::Assistant, "b").unwrap();
        assert!(a.value < p.value && p.value < b.value);
        assert_eq!(store.len(), 2);
        assert_eq!(store.system_prompt_count(), 1);
    }

    #[test]
    fn test_snapshot_puts_system_prompts_first() {
        let mut store = store_with(2);
        store.add_system_prompt("rules");

        let ctx = store.snapshot_context();
        assert_eq!(ctx.len(), 3);
        assert_eq!(ctx[0], ContextEntry::new(Role::System, "rules"));
        assert_eq!(ctx[1].content, "msg1");
    }

    #[test]
    fn test_get_and_remove() {
        let mut store = store_with(3);
        let prompt = store.add_system_prompt("rules").unwrap();
        let id = MessageId::raw(2);

        assert_eq!(store.get(id).unwrap().content, "msg2");
        assert_eq!(store.remove(id).unwrap().content, "msg2");
        assert!(store.get(id).is_none());
        assert!(store.remove(id).is_none());

        assert!(store.remove(prompt).is_none());
        assert!(store.get(prompt).is_some());
    }

    #[test]
    fn test_evict_oldest() {
        let mut store = store_with(4);
        let evicted = store.evict_oldest(2);
        let contents: Vec<_> = evicted.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["msg1", "msg2"]);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_claim_skips_in_flight_turns() {
        let mut store = store_with(5);
        let (start, first) = store.claim_oldest(2).unwrap();
        assert_eq!(start, 0);
        assert_eq!(first.len(), 2);
        assert_eq!(store.len(), 5);
        assert_eq!(store.eligible_count(), 3);

        let (start, second) = store.claim_oldest(2).unwrap();
        assert_eq!(start, 2);
        assert_eq!(second[0].content, "msg3");

        let evicted = store.evict_oldest(5);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].content, "msg5");
    }

    #[test]
    fn test_claim_on_empty_store() {
        let mut store = MessageStore::new("s1", 1);
        assert!(store.claim_oldest(3).is_none());
    }

    #[test]
    fn test_insert_at_clamps() {
        let mut store = store_with(2);
        let extra = Message::raw(99, Role::User, "late".to_string());
        assert_eq!(store.insert_at(10, extra), 2);
        assert_eq!(store.messages().last().unwrap().content, "late");
    }

    #[test]
    fn test_clear() {
        let mut store = store_with(3);
        store.add_system_prompt("rules");
        store.claim_oldest(1);

        store.clear(true, 1);
        assert!(store.is_empty());
        assert_eq!(store.in_flight_count(), 0);
        assert_eq!(store.system_prompt_count(), 1);
        assert_eq!(store.allocator_state().current_id, 1);

        store.clear(false, 1);
        assert_eq!(store.system_prompt_count(), 0);
    }
}
