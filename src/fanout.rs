//! Bounded concurrency fan-out with per-item retry.
//!
//! Items are admitted into the window in sorted identifier order, at most
//! `concurrency` at a time. A failed item is retried after `retry_delay`
//! until it succeeds, its attempt budget runs out, or the error is not
//! retryable. After the first unrecoverable failure (or a pause request)
//! no new attempts start, but attempts already in flight run to completion
//! before the executor returns.

use crate::collaborators::{PlanControl, StatusSink};
use crate::config::RestartConfig;
use crate::errors::{FanOutError, PhaseError};
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Window size for a fleet of `n` items: a third of the fleet, at least one.
pub fn concurrency_for(n: usize) -> usize {
    (n / 3).max(1)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanOutConfig {
    pub concurrency: usize,
    pub retry_delay: Duration,
    pub max_attempts: u32,
}

impl FanOutConfig {
    /// Settings for restarting a fleet of `n` instances.
    pub fn for_fleet(n: usize, restart: &RestartConfig) -> Self {
        Self {
            concurrency: concurrency_for(n),
            retry_delay: restart.retry_delay(),
            max_attempts: restart.max_attempts,
        }
    }
}

/// One attempt at one item, handed to the per-item operation.
pub struct ItemAttempt {
    pub id: String,
    /// 1-based position in sorted order
    pub index: usize,
    pub total: usize,
    /// 1-based attempt number
    pub attempt: u32,
    /// The item's own status node, created on its first attempt.
    pub status: Arc<dyn StatusSink>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanOutResult {
    Completed,
    Paused,
}

enum ItemOutcome {
    Done,
    Stopped,
    Paused,
    Failed(FanOutError),
}

/// Errors that retrying the same item cannot fix.
fn is_retryable(err: &PhaseError) -> bool {
    !matches!(
        err,
        PhaseError::ProtocolViolation(_)
            | PhaseError::OutOfOrder(_)
            | PhaseError::Template(_)
            | PhaseError::AmbiguousState { .. }
            | PhaseError::InvalidArtifactId(_)
    )
}

pub struct FanOut<'a> {
    control: &'a dyn PlanControl,
    status: Arc<dyn StatusSink>,
    config: FanOutConfig,
    noun: &'static str,
}

impl<'a> FanOut<'a> {
    pub fn new(control: &'a dyn PlanControl, status: Arc<dyn StatusSink>, config: FanOutConfig) -> Self {
        Self {
            control,
            status,
            config,
            noun: "item",
        }
    }

    /// Word used before the item id in status lines.
    pub fn with_noun(mut self, noun: &'static str) -> Self {
        self.noun = noun;
        self
    }

    /// Run `op` over `items`.
    ///
    /// Returns the first unrecoverable failure, in completion order, or
    /// [`FanOutResult::Paused`] if a pause request stopped the run.
    pub async fn run<F, Fut>(&self, mut items: Vec<String>, op: F) -> Result<FanOutResult, PhaseError>
    where
        F: Fn(ItemAttempt) -> Fut,
        Fut: Future<Output = Result<(), PhaseError>>,
    {
        items.sort();
        items.dedup();
        let total = items.len();
        let concurrency = self.config.concurrency.max(1);
        let stop = AtomicBool::new(false);

        tracing::info!(items = total, concurrency, "starting fan-out");

        let outcomes: Vec<ItemOutcome> = futures::stream::iter(items.into_iter().enumerate())
            .map(|(i, id)| self.run_item(id, i + 1, total, &op, &stop))
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut paused = false;
        for outcome in outcomes {
            match outcome {
                ItemOutcome::Failed(e) => return Err(PhaseError::FanOut(e)),
                ItemOutcome::Paused => paused = true,
                ItemOutcome::Done | ItemOutcome::Stopped => {}
            }
        }

        if paused {
            Ok(FanOutResult::Paused)
        } else {
            Ok(FanOutResult::Completed)
        }
    }

    async fn run_item<F, Fut>(
        &self,
        id: String,
        index: usize,
        total: usize,
        op: &F,
        stop: &AtomicBool,
    ) -> ItemOutcome
    where
        F: Fn(ItemAttempt) -> Fut,
        Fut: Future<Output = Result<(), PhaseError>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut node: Option<Arc<dyn StatusSink>> = None;
        let mut attempt = 0;

        loop {
            if stop.load(Ordering::SeqCst) {
                return ItemOutcome::Stopped;
            }
            if self.control.check_pause() {
                tracing::info!(item = %id, "pause requested; not starting item");
                stop.store(true, Ordering::SeqCst);
                return ItemOutcome::Paused;
            }

            attempt += 1;
            let item_status = node.get_or_insert_with(|| self.status.child()).clone();
            item_status.update(&format!("{} {} ({}/{})", self.noun, id, index, total));

            let result = op(ItemAttempt {
                id: id.clone(),
                index,
                total,
                attempt,
                status: item_status.clone(),
            })
            .await;

            item_status.trunc();
            let err = match result {
                Ok(()) => {
                    item_status.child().update("ok");
                    tracing::debug!(item = %id, attempt, "item done");
                    return ItemOutcome::Done;
                }
                Err(e) => e,
            };

            if !is_retryable(&err) {
                item_status.child().update(&format!("failed: {}", err));
                tracing::error!(item = %id, error = %err, "item failed; not retryable");
                stop.store(true, Ordering::SeqCst);
                return ItemOutcome::Failed(FanOutError::NonRetryable {
                    item: id,
                    source: Box::new(err),
                });
            }

            if attempt >= max_attempts {
                item_status.child().update(&format!("failed: {}", err));
                tracing::error!(item = %id, attempts = attempt, error = %err, "item exhausted its retries");
                stop.store(true, Ordering::SeqCst);
                return ItemOutcome::Failed(FanOutError::Exhausted {
                    item: id,
                    attempts: attempt,
                    source: Box::new(err),
                });
            }

            item_status.child().update(&format!("failed: {} (retrying)", err));
            tracing::warn!(
                item = %id,
                attempt,
                error = %err,
                delay_secs = self.config.retry_delay.as_secs(),
                "item failed; retrying"
            );
            tokio::time::sleep(self.config.retry_delay).await;
        }
    }
}
