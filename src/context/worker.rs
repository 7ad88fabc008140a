//! Background compression worker
//!
//! A single task per context drains the job queue, runs the summarizer on
//! each job's snapshot and stages a result for the applier. Every job ends
//! in a staged result, success or not, so callers waiting on the queue are
//! never left hanging.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::conversation::Shared;
use super::message::{Message, MessageId};
use super::summarizer::{SummarizeError, Summarizer};

/// Turns handed to the worker for summarization
#[derive(Debug, Clone)]
pub struct CompressionJob {
    /// Ids of the turns to replace, oldest first
    pub message_ids: Vec<MessageId>,
    /// Copies of those turns taken at submission
    pub messages: Vec<Message>,
    /// Queue index of the first turn at submission
    pub start_index: usize,
    /// Clear generation the job belongs to
    pub epoch: u64,
}

/// Outcome of one job, waiting to be applied to the store
#[derive(Debug, Clone)]
pub struct CompressionResult {
    pub message_ids: Vec<MessageId>,
    /// `None` when summarization failed
    pub compressed_msg: Option<Message>,
    pub start_index: usize,
    pub epoch: u64,
}

/// Counters describing compression activity for one context
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompressionStats {
    pub jobs_submitted: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    /// Turns dropped without a summary (direct eviction or failed jobs)
    pub messages_evicted: u64,
    /// Turns replaced by a summary
    pub messages_compressed: u64,
}

/// A job paired with the summarizer that was registered when it was queued
pub(crate) struct QueuedJob {
    pub job: CompressionJob,
    pub summarizer: Arc<dyn Summarizer>,
}

pub(crate) struct CompressionWorker {
    shared: Arc<Shared>,
    jobs: async_channel::Receiver<QueuedJob>,
    poll_interval: Duration,
}

impl CompressionWorker {
    pub fn new(
        shared: Arc<Shared>,
        jobs: async_channel::Receiver<QueuedJob>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            shared,
            jobs,
            poll_interval,
        }
    }

    /// Drain jobs until shutdown is requested or the queue closes.
    ///
    /// The shutdown flag is only checked between jobs; a job that has
    /// started always runs to completion.
    pub async fn run(self) {
        debug!(session = %self.shared.session, "Compression worker started");

        loop {
            if self.shared.shutdown.load(Ordering::Acquire) {
                break;
            }

            match tokio::time::timeout(self.poll_interval, self.jobs.recv()).await {
                Ok(Ok(queued)) => self.process(queued).await,
                Ok(Err(_)) => {
                    debug!(session = %self.shared.session, "Job queue closed");
                    break;
                }
                Err(_) => continue,
            }
        }

        // Jobs never started keep their originals in the store
        while let Ok(queued) = self.jobs.try_recv() {
            self.shared.abandon(queued.job);
        }

        debug!(session = %self.shared.session, "Compression worker stopped");
    }

    async fn process(&self, queued: QueuedJob) {
        let QueuedJob { job, summarizer } = queued;
        let started = Instant::now();

        let outcome = AssertUnwindSafe(summarizer.summarize(&job.messages))
            .catch_unwind()
            .await
            .unwrap_or(Err(SummarizeError::Panicked))
            .and_then(|summary| {
                if summary.trim().is_empty() {
                    Err(SummarizeError::Empty)
                } else {
                    Ok(summary)
                }
            });

        let compressed_msg = match outcome {
            Ok(summary) => match self.shared.next_compressed_id(job.epoch) {
                Some(id) => {
                    let msg = Message::compressed(id, summary, &job.messages);
                    info!(
                        session = %self.shared.session,
                        id = %msg.id,
                        turns = job.messages.len(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Compressed turns into summary"
                    );
                    Some(msg)
                }
                None => {
                    debug!(session = %self.shared.session, "Context cleared during summarization, dropping summary");
                    None
                }
            },
            Err(e) => {
                warn!(
                    session = %self.shared.session,
                    error = %e,
                    turns = job.messages.len(),
                    "Summarization failed, turns will be dropped"
                );
                None
            }
        };

        self.shared.stage(CompressionResult {
            message_ids: job.message_ids,
            compressed_msg,
            start_index: job.start_index,
            epoch: job.epoch,
        });
    }
}
