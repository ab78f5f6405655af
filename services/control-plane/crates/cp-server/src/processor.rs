//! Background worker applying agent container/schema updates.
//!
//! A single consumer drains the update channel. A failed update is requeued
//! behind a backoff delay while newer updates keep flowing, so one update
//! that keeps failing cannot hold up other agents. With a bounded
//! [`RetryPolicy`] an update that exhausts its attempts becomes a
//! [`DeadLetter`]. While `max_pending` retries are waiting the worker stops
//! receiving, so producers stall instead of piling updates up in memory.
//! Closing the channel stops the worker.

use std::sync::Arc;
use std::time::Duration;

use fleet_common::AgentUpdateInfo;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::metadata::MetadataStore;

/// Producers hand off one message at a time; a busy worker stalls them.
const UPDATE_CHANNEL_CAPACITY: usize = 1;

const DEAD_LETTER_CAPACITY: usize = 256;

const DEFAULT_MAX_PENDING: usize = 1_024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateMessage {
    pub agent_id: Uuid,
    pub update: AgentUpdateInfo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Failed updates held for retry at once; at the limit intake pauses.
    pub max_pending: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            max_pending: DEFAULT_MAX_PENDING,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn unbounded() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn bounded(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    #[must_use]
    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending.max(1);
        self
    }

    /// Delay before the next attempt after `failures` consecutive failures.
    #[must_use]
    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

/// An update the worker gave up on.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub message: UpdateMessage,
    pub attempts: u32,
    pub last_error: String,
}

struct PendingRetry {
    message: UpdateMessage,
    attempts: u32,
    due: Instant,
    last_error: String,
}

/// Channels and task of a running worker.
pub struct UpdateProcessorHandle {
    pub sender: mpsc::Sender<UpdateMessage>,
    pub dead_letters: mpsc::Receiver<DeadLetter>,
    pub task: JoinHandle<()>,
}

pub struct UpdateProcessor {
    mds: Arc<dyn MetadataStore>,
    policy: RetryPolicy,
    rx: mpsc::Receiver<UpdateMessage>,
    /// Sorted by `due`.
    retries: Vec<PendingRetry>,
    dead_letters: mpsc::Sender<DeadLetter>,
}

impl UpdateProcessor {
    pub fn spawn(mds: Arc<dyn MetadataStore>, policy: RetryPolicy) -> UpdateProcessorHandle {
        let (sender, rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        let (dead_tx, dead_letters) = mpsc::channel(DEAD_LETTER_CAPACITY);

        let processor = Self {
            mds,
            policy,
            rx,
            retries: Vec::new(),
            dead_letters: dead_tx,
        };
        let task = tokio::spawn(processor.run());

        UpdateProcessorHandle {
            sender,
            dead_letters,
            task,
        }
    }

    async fn run(mut self) {
        info!(
            max_attempts = ?self.policy.max_attempts,
            "update processor started"
        );

        loop {
            let next_due = self.retries.first().map(|p| p.due);
            let accepting = self.retries.len() < self.policy.max_pending.max(1);
            tokio::select! {
                msg = self.rx.recv(), if accepting => match msg {
                    Some(message) => self.apply(message, 0).await,
                    None => break,
                },
                () = tokio::time::sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                    let pending = self.retries.remove(0);
                    self.apply(pending.message, pending.attempts).await;
                }
            }
        }

        for pending in std::mem::take(&mut self.retries) {
            self.dead_letter(DeadLetter {
                message: pending.message,
                attempts: pending.attempts,
                last_error: format!("processor stopped; last error: {}", pending.last_error),
            });
        }
        info!("update processor stopped");
    }

    async fn apply(&mut self, message: UpdateMessage, prior_attempts: u32) {
        let attempts = prior_attempts + 1;
        match self.apply_once(&message).await {
            Ok(()) => {
                debug!(agent_id = %message.agent_id, attempts, "agent update applied");
            }
            Err(e) if self.policy.exhausted(attempts) => {
                error!(
                    agent_id = %message.agent_id,
                    attempts,
                    error = %e,
                    "agent update exhausted its retries"
                );
                self.dead_letter(DeadLetter {
                    message,
                    attempts,
                    last_error: e.to_string(),
                });
            }
            Err(e) => {
                let delay = self.policy.backoff(attempts);
                warn!(
                    agent_id = %message.agent_id,
                    attempts,
                    retry_in_ms = delay.as_millis(),
                    error = %e,
                    "agent update failed; requeued"
                );
                let due = Instant::now() + delay;
                let at = self.retries.partition_point(|p| p.due <= due);
                self.retries.insert(
                    at,
                    PendingRetry {
                        message,
                        attempts,
                        due,
                        last_error: e.to_string(),
                    },
                );
            }
        }
    }

    async fn apply_once(&self, message: &UpdateMessage) -> Result<()> {
        self.mds
            .update_containers(&message.update.containers)
            .await?;
        self.mds
            .update_schemas(message.agent_id, &message.update.schema)
            .await
    }

    fn dead_letter(&self, letter: DeadLetter) {
        let agent_id = letter.message.agent_id;
        if self.dead_letters.try_send(letter).is_err() {
            error!(agent_id = %agent_id, "dead-letter channel full or closed; update dropped");
        }
    }
}
