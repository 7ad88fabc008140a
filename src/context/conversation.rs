//! Per-session conversation context
//!
//! [`ConversationContext`] ties the store, budget policy, compression
//! worker and result applier together behind one thread-safe handle.
//! Reads never wait for summarization: finished results are spliced in
//! lazily at the start of [`ConversationContext::get_context`].

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::allocator::{AllocatorState, IdAllocator, IdCategory};
use super::applier::ResultApplier;
use super::budget::{BudgetDecision, TokenBudgetPolicy};
use super::message::{ContextEntry, Message, MessageId, Role};
use super::store::MessageStore;
use super::summarizer::Summarizer;
use super::worker::{
    CompressionJob, CompressionResult, CompressionStats, CompressionWorker, QueuedJob,
};
use crate::{ContextConfig, ContextError, Result};

/// Lifecycle of a context and its worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Lifecycle {
    Created,
    Running,
    ShuttingDown,
    Stopped,
}

/// State shared between the facade and its worker.
///
/// Lock order is store, then compressed ids or staged; the worker only
/// ever takes one lock at a time.
pub(crate) struct Shared {
    pub session: String,
    pub store: Mutex<MessageStore>,
    pub staged: Mutex<Vec<CompressionResult>>,
    pub compressed_ids: Mutex<IdAllocator>,
    pub stats: Mutex<CompressionStats>,
    /// Jobs submitted whose result is not staged yet
    pub pending: AtomicUsize,
    /// Bumped by every clear
    pub epoch: AtomicU64,
    pub shutdown: AtomicBool,
}

impl Shared {
    /// Next compressed id, or `None` if a clear has ended `epoch`.
    ///
    /// Checked under the allocator lock so a clear cannot slip between the
    /// check and the allocation.
    pub fn next_compressed_id(&self, epoch: u64) -> Option<u64> {
        let mut ids = self.compressed_ids.lock();
        (self.epoch.load(Ordering::Acquire) == epoch).then(|| ids.next())
    }

    /// Hand a finished result to the applier
    pub fn stage(&self, result: CompressionResult) {
        if result.epoch == self.epoch.load(Ordering::Acquire) {
            let mut stats = self.stats.lock();
            let turns = result.message_ids.len() as u64;
            if result.compressed_msg.is_some() {
                stats.jobs_completed += 1;
                stats.messages_compressed += turns;
            } else {
                stats.jobs_failed += 1;
                stats.messages_evicted += turns;
            }
        }
        self.staged.lock().push(result);
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }

    /// Give a job that never ran its turns back
    pub fn abandon(&self, job: CompressionJob) {
        debug!(
            session = %self.session,
            turns = job.message_ids.len(),
            "Abandoning queued job at shutdown"
        );
        self.store.lock().release(&job.message_ids);
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Conversation history for one session with a token budget.
///
/// Constructing a context spawns its compression worker, so it must happen
/// inside a tokio runtime. Call [`close`](Self::close) to stop the worker;
/// dropping the context also asks it to stop.
pub struct ConversationContext {
    shared: Arc<Shared>,
    config: ContextConfig,
    policy: TokenBudgetPolicy,
    summarizer: RwLock<Option<Arc<dyn Summarizer>>>,
    jobs: async_channel::Sender<QueuedJob>,
    /// Kept so `close` can drain jobs the worker never saw
    queued: async_channel::Receiver<QueuedJob>,
    worker: Mutex<Option<JoinHandle<()>>>,
    lifecycle: Mutex<Lifecycle>,
}

impl ConversationContext {
    /// Create a context and start its worker
    pub fn new(config: ContextConfig) -> Result<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| ContextError::NoRuntime)?;

        let session = config.session_id.clone();
        let shared = Arc::new(Shared {
            session: session.clone(),
            store: Mutex::new(MessageStore::new(session.clone(), config.id_start)),
            staged: Mutex::new(Vec::new()),
            compressed_ids: Mutex::new(IdAllocator::new(
                session.clone(),
                IdCategory::Compressed,
                config.id_start,
            )),
            stats: Mutex::new(CompressionStats::default()),
            pending: AtomicUsize::new(0),
            epoch: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        });

        let (jobs_tx, jobs_rx) = async_channel::bounded(config.queue_capacity);
        let context = Self {
            shared: shared.clone(),
            policy: TokenBudgetPolicy::new(config.budget.clone()),
            summarizer: RwLock::new(None),
            jobs: jobs_tx,
            queued: jobs_rx.clone(),
            worker: Mutex::new(None),
            lifecycle: Mutex::new(Lifecycle::Created),
            config,
        };

        let worker = CompressionWorker::new(shared, jobs_rx, context.config.poll_interval());
        *context.worker.lock() = Some(runtime.spawn(worker.run()));
        *context.lifecycle.lock() = Lifecycle::Running;

        info!(
            session = %session,
            max_context_tokens = context.policy.max_context_tokens(),
            "Conversation context started"
        );
        Ok(context)
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.lock()
    }

    /// Register the summarizer used for future overflows.
    ///
    /// Jobs already queued keep the summarizer they were queued with.
    pub fn set_summarizer(&self, summarizer: Arc<dyn Summarizer>) -> Result<()> {
        self.ensure_running()?;
        *self.summarizer.write() = Some(summarizer);
        debug!(session = %self.shared.session, "Summarizer registered");
        Ok(())
    }

    /// Go back to evicting turns synchronously on overflow
    pub fn clear_summarizer(&self) {
        *self.summarizer.write() = None;
    }

    pub fn has_summarizer(&self) -> bool {
        self.summarizer.read().is_some()
    }

    /// Append a chat turn. Returns `None` for blank content.
    pub fn add_message(&self, role: Role, content: impl Into<String>) -> Option<MessageId> {
        let id = self.shared.store.lock().add_message(role, content);
        if let Some(id) = id {
            debug!(session = %self.shared.session, %id, %role, "Message added");
        }
        id
    }

    /// Append a system prompt that is never trimmed. Returns `None` for
    /// blank content.
    pub fn add_system_prompt(&self, content: impl Into<String>) -> Option<MessageId> {
        let id = self.shared.store.lock().add_system_prompt(content);
        if let Some(id) = id {
            debug!(session = %self.shared.session, %id, "System prompt added");
        }
        id
    }

    pub fn get_message(&self, id: MessageId) -> Option<Message> {
        self.shared.store.lock().get(id).cloned()
    }

    /// Remove a live turn by id. System prompts cannot be removed.
    pub fn remove_message(&self, id: MessageId) -> Option<Message> {
        self.shared.store.lock().remove(id)
    }

    /// Number of live turns, system prompts excluded
    pub fn len(&self) -> usize {
        self.shared.store.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.store.lock().is_empty()
    }

    /// System prompts followed by the live turns, after applying any
    /// finished compression results
    pub fn get_context(&self) -> Vec<ContextEntry> {
        let mut store = self.shared.store.lock();
        self.apply_locked(&mut store);
        store.snapshot_context()
    }

    /// Everything currently in the store with full metadata.
    ///
    /// Finished-but-unapplied results are not spliced in.
    pub fn get_full_context(&self) -> Vec<Message> {
        self.shared.store.lock().snapshot_messages()
    }

    /// Apply finished compression results now. Returns how many were applied.
    pub fn apply_pending(&self) -> usize {
        let mut store = self.shared.store.lock();
        self.apply_locked(&mut store)
    }

    fn apply_locked(&self, store: &mut MessageStore) -> usize {
        let results = std::mem::take(&mut *self.shared.staged.lock());
        if results.is_empty() {
            return 0;
        }
        ResultApplier::apply(store, results, self.shared.epoch.load(Ordering::Acquire))
    }

    /// React to a measured token count.
    ///
    /// At or under budget this does nothing and returns an empty list.
    /// Over budget, the oldest turns are either evicted on the spot (no
    /// summarizer) or queued for summarization, and copies of them are
    /// returned. Queued turns stay visible until their result is applied.
    /// Waits only if the job queue is full.
    pub async fn process_token_excess(&self, total_tokens: usize) -> Result<Vec<Message>> {
        if total_tokens <= self.policy.max_context_tokens() {
            return Ok(Vec::new());
        }

        let summarizer = self.summarizer.read().clone();
        match summarizer {
            None => Ok(self.evict(total_tokens)),
            Some(summarizer) => self.submit(total_tokens, summarizer).await,
        }
    }

    fn evict(&self, total_tokens: usize) -> Vec<Message> {
        let evicted = {
            let mut store = self.shared.store.lock();
            self.apply_locked(&mut store);
            match self.policy.evaluate(total_tokens, store.eligible_count()) {
                BudgetDecision::NoAction => return Vec::new(),
                BudgetDecision::Trim {
                    excess_ratio,
                    count,
                } => {
                    debug!(session = %self.shared.session, excess_ratio, count, "Evicting oldest turns");
                    store.evict_oldest(count)
                }
            }
        };

        self.shared.stats.lock().messages_evicted += evicted.len() as u64;
        info!(
            session = %self.shared.session,
            total_tokens,
            usage_percent = self.policy.usage_percent(total_tokens),
            evicted = evicted.len(),
            "Context over budget, evicted oldest turns"
        );
        evicted
    }

    async fn submit(
        &self,
        total_tokens: usize,
        summarizer: Arc<dyn Summarizer>,
    ) -> Result<Vec<Message>> {
        self.ensure_running()?;

        let job = {
            let mut store = self.shared.store.lock();
            self.apply_locked(&mut store);
            let count = match self.policy.evaluate(total_tokens, store.eligible_count()) {
                BudgetDecision::NoAction => return Ok(Vec::new()),
                BudgetDecision::Trim { count, .. } => count,
            };
            let Some((start_index, messages)) = store.claim_oldest(count) else {
                return Ok(Vec::new());
            };
            CompressionJob {
                message_ids: messages.iter().map(|m| m.id).collect(),
                messages,
                start_index,
                epoch: self.shared.epoch.load(Ordering::Acquire),
            }
        };

        let snapshot = job.messages.clone();
        let ids = job.message_ids.clone();
        self.shared.pending.fetch_add(1, Ordering::AcqRel);

        if self.jobs.send(QueuedJob { job, summarizer }).await.is_err() {
            self.shared.store.lock().release(&ids);
            self.shared.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(ContextError::QueueClosed);
        }

        self.shared.stats.lock().jobs_submitted += 1;
        info!(
            session = %self.shared.session,
            total_tokens,
            usage_percent = self.policy.usage_percent(total_tokens),
            turns = snapshot.len(),
            "Context over budget, queued oldest turns for compression"
        );
        Ok(snapshot)
    }

    /// Jobs submitted whose results are not staged yet
    pub fn pending_jobs(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    /// Poll until every submitted job has a staged result or `timeout`
    /// elapses. Returns whether the queue drained.
    pub async fn wait_for_compression(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let poll = self.config.poll_interval();

        loop {
            if self.pending_jobs() == 0 {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(
                    session = %self.shared.session,
                    pending = self.pending_jobs(),
                    "Timed out waiting for compression"
                );
                return false;
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }

    /// Drop every live turn and rewind both id counters.
    ///
    /// Results of jobs still running are discarded when they arrive.
    pub fn clear_context(&self, keep_system: bool) {
        let id_start = self.config.id_start;
        let mut store = self.shared.store.lock();
        store.clear(keep_system, id_start);
        {
            let mut ids = self.shared.compressed_ids.lock();
            self.shared.epoch.fetch_add(1, Ordering::AcqRel);
            ids.reset(id_start);
        }
        self.shared.staged.lock().clear();
        info!(session = %self.shared.session, keep_system, "Context cleared");
    }

    pub fn stats(&self) -> CompressionStats {
        self.shared.stats.lock().clone()
    }

    pub fn raw_id_state(&self) -> AllocatorState {
        self.shared.store.lock().allocator_state()
    }

    pub fn compressed_id_state(&self) -> AllocatorState {
        self.shared.compressed_ids.lock().state()
    }

    /// Stop the worker.
    ///
    /// A job already being summarized is allowed to finish. Returns `false`
    /// if the worker did not exit within the configured shutdown timeout;
    /// the context is stopped either way. Calling it again is a no-op.
    pub async fn close(&self) -> bool {
        {
            let mut lifecycle = self.lifecycle.lock();
            if *lifecycle == Lifecycle::Stopped {
                return true;
            }
            *lifecycle = Lifecycle::ShuttingDown;
        }

        self.shared.shutdown.store(true, Ordering::Release);
        self.jobs.close();

        let handle = self.worker.lock().take();
        let joined = match handle {
            Some(handle) => {
                match tokio::time::timeout(self.config.shutdown_timeout(), handle).await {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        warn!(session = %self.shared.session, error = %e, "Compression worker failed");
                        false
                    }
                    Err(_) => {
                        warn!(
                            session = %self.shared.session,
                            "Compression worker did not stop in time, leaving it to finish"
                        );
                        false
                    }
                }
            }
            None => true,
        };

        // A send that raced the worker's own drain lands here
        while let Ok(queued) = self.queued.try_recv() {
            self.shared.abandon(queued.job);
        }

        *self.lifecycle.lock() = Lifecycle::Stopped;
        info!(session = %self.shared.session, joined, "Conversation context closed");
        joined
    }

    fn ensure_running(&self) -> Result<()> {
        match self.lifecycle() {
            Lifecycle::Created | Lifecycle::Running => Ok(()),
            Lifecycle::ShuttingDown | Lifecycle::Stopped => Err(ContextError::Closed),
        }
    }
}

impl fmt::Debug for ConversationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversationContext")
            .field("session", &self.shared.session)
            .field("lifecycle", &self.lifecycle())
            .field("len", &self.len())
            .field("pending_jobs", &self.pending_jobs())
            .finish()
    }
}

impl Drop for ConversationContext {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.jobs.close();
    }
}
