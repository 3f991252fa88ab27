use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::LMConfig;

/// A queued request to summarize one transcript for one conversation
#[derive(Debug, Clone)]
pub struct SummarizationJob {
    pub id: Uuid,
    pub conversation_id: String,
    pub raw_text: String,
}

impl SummarizationJob {
    pub fn new(conversation_id: impl Into<String>, raw_text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id: conversation_id.into(),
            raw_text: raw_text.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("transient delivery failure: {0}")]
    Transient(String),
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

/// Where finished summaries go (console, chat transport, test recorder)
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn deliver(&self, conversation_id: &str, text: &str) -> Result<(), DeliveryError>;
}

/// The work a job resolves to. Runners never fail; degradation is their problem.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job: &SummarizationJob) -> String;
}

struct ConversationState {
    pending: VecDeque<SummarizationJob>,
    processing: bool,
}

/// Per-conversation FIFO scheduler. Jobs for the same conversation run
/// strictly one at a time; different conversations run concurrently, each
/// on its own spawned drain task.
pub struct QueueRegistry<R, S> {
    runner: Arc<R>,
    sink: Arc<S>,
    conversations: Arc<Mutex<HashMap<String, Arc<Mutex<ConversationState>>>>>,
    max_retries: u32,
    backoff: Duration,
}

impl<R, S> QueueRegistry<R, S>
where
    R: JobRunner + 'static,
    S: DeliverySink + 'static,
{
    pub fn new(runner: Arc<R>, sink: Arc<S>, config: &LMConfig) -> Self {
        Self {
            runner,
            sink,
            conversations: Arc::new(Mutex::new(HashMap::new())),
            max_retries: config.delivery_max_retries,
            backoff: Duration::from_millis(config.delivery_backoff_ms),
        }
    }

    /// Queue a job; starts a drain task for the conversation if none is running
    pub async fn enqueue(&self, job: SummarizationJob) {
        let state = {
            let mut conversations = self.conversations.lock().await;
            conversations
                .entry(job.conversation_id.clone())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(ConversationState {
                        pending: VecDeque::new(),
                        processing: false,
                    }))
                })
                .clone()
        };

        let mut guard = state.lock().await;
        debug!("📥 Queued job {} for '{}'", job.id, job.conversation_id);
        guard.pending.push_back(job);

        if !guard.processing {
            guard.processing = true;
            drop(guard);
            let runner = self.runner.clone();
            let sink = self.sink.clone();
            let max_retries = self.max_retries;
            let backoff = self.backoff;
            tokio::spawn(async move {
                drain_conversation(state, runner, sink, max_retries, backoff).await;
            });
        }
    }

    /// Drop every queued (not yet running) job for a conversation
    pub async fn clear_pending(&self, conversation_id: &str) -> usize {
        let state = {
            let conversations = self.conversations.lock().await;
            conversations.get(conversation_id).cloned()
        };
        match state {
            Some(state) => {
                let mut guard = state.lock().await;
                let dropped = guard.pending.len();
                guard.pending.clear();
                if dropped > 0 {
                    info!("🗑️ Dropped {} pending job(s) for '{}'", dropped, conversation_id);
                }
                dropped
            }
            None => 0,
        }
    }

    /// Snapshot of queue depth per conversation, for the status command
    pub async fn pending_counts(&self) -> Vec<(String, usize)> {
        let conversations = self.conversations.lock().await;
        let mut counts = Vec::new();
        for (id, state) in conversations.iter() {
            let guard = state.lock().await;
            if guard.processing || !guard.pending.is_empty() {
                counts.push((id.clone(), guard.pending.len()));
            }
        }
        counts.sort();
        counts
    }
}

/// Runs jobs for one conversation until its queue empties, then exits.
/// Iterative on purpose: a long backlog must not grow the stack.
async fn drain_conversation<R, S>(
    state: Arc<Mutex<ConversationState>>,
    runner: Arc<R>,
    sink: Arc<S>,
    max_retries: u32,
    backoff: Duration,
) where
    R: JobRunner,
    S: DeliverySink,
{
    loop {
        let job = {
            let mut guard = state.lock().await;
            match guard.pending.pop_front() {
                Some(job) => job,
                None => {
                    guard.processing = false;
                    return;
                }
            }
        };

        info!("⚙️ Running job {} for '{}'", job.id, job.conversation_id);
        let summary = runner.run(&job).await;
        deliver_with_retry(sink.as_ref(), &job.conversation_id, &summary, max_retries, backoff)
            .await;
    }
}

/// Bounded retries with doubling backoff; permanent failures drop immediately
async fn deliver_with_retry<S: DeliverySink + ?Sized>(
    sink: &S,
    conversation_id: &str,
    text: &str,
    max_retries: u32,
    initial_backoff: Duration,
) {
    let mut backoff = initial_backoff;
    for attempt in 0..=max_retries {
        match sink.deliver(conversation_id, text).await {
            Ok(()) => {
                debug!("📤 Delivered to '{}'", conversation_id);
                return;
            }
            Err(DeliveryError::Permanent(reason)) => {
                error!("❌ Permanent delivery failure for '{}': {}", conversation_id, reason);
                return;
            }
            Err(DeliveryError::Transient(reason)) => {
                if attempt == max_retries {
                    error!(
                        "❌ Delivery to '{}' gave up after {} attempts: {}",
                        conversation_id,
                        max_retries + 1,
                        reason
                    );
                    return;
                }
                warn!(
                    "⚠️ Delivery to '{}' failed ({}), retrying in {:?}",
                    conversation_id, reason, backoff
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }
    }
}
