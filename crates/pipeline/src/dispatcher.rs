use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use quasar_social::{Delivery, OperatorContext, OperatorNotifier, ReplyChannel};
use quasar_storage::models::{ReplyFailure, ReplyStatus};
use quasar_storage::{StoreError, TipStore};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::replies::Reply;

/// Combined result of trying every channel once.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Attempt {
    Sent { channel: String, reply_id: String },
    Retryable { error: String, next_retry_at: DateTime<Utc> },
    Fatal { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent { channel: String, reply_id: String },
    /// Parked in the queue as `pending`.
    Queued { next_retry_at: DateTime<Utc> },
    /// Parked in the queue as `failed`; no channel will accept it.
    Failed { error: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct DispatchPolicy {
    /// Retry delay when no channel reports a resume time.
    pub fallback_delay: Duration,
    /// A `processing` row older than this is leased again.
    pub lease: Duration,
    pub sweep_batch_size: i64,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            fallback_delay: Duration::minutes(15),
            lease: Duration::minutes(10),
            sweep_batch_size: 10,
        }
    }
}

/// Delivers replies through an ordered list of channels and owns the retry queue.
pub struct ReplyDispatcher {
    store: Arc<dyn TipStore>,
    channels: Vec<Arc<dyn ReplyChannel>>,
    operator: Option<Arc<dyn OperatorNotifier>>,
    clock: Arc<dyn Clock>,
    policy: DispatchPolicy,
}

impl ReplyDispatcher {
    pub fn new(
        store: Arc<dyn TipStore>,
        channels: Vec<Arc<dyn ReplyChannel>>,
        operator: Option<Arc<dyn OperatorNotifier>>,
        clock: Arc<dyn Clock>,
        policy: DispatchPolicy,
    ) -> Self {
        Self {
            store,
            channels,
            operator,
            clock,
            policy,
        }
    }

    async fn attempt(&self, text: &str, reply_to: &str) -> Attempt {
        let now = self.clock.now();
        let mut retry_errors = Vec::new();
        let mut resume_hints = Vec::new();
        let mut fatal_errors = Vec::new();

        for channel in &self.channels {
            match channel.post_reply(text, reply_to).await {
                Delivery::Sent { reply_id } => {
                    return Attempt::Sent {
                        channel: channel.name().to_string(),
                        reply_id,
                    };
                }
                Delivery::Retryable { error, resume_at } => {
                    debug!(channel = channel.name(), %error, ?resume_at, "Reply channel asked to retry");
                    retry_errors.push(format!("{}: {error}", channel.name()));
                    resume_hints.extend(resume_at.filter(|at| *at > now));
                }
                Delivery::Fatal { error } => {
                    debug!(channel = channel.name(), %error, "Reply channel refused");
                    fatal_errors.push(format!("{}: {error}", channel.name()));
                }
            }
        }

        if retry_errors.is_empty() {
            if fatal_errors.is_empty() {
                fatal_errors.push("no reply channel configured".to_string());
            }
            return Attempt::Fatal {
                error: fatal_errors.join("; "),
            };
        }
        let next_retry_at = resume_hints
            .into_iter()
            .min()
            .unwrap_or(now + self.policy.fallback_delay);
        retry_errors.extend(fatal_errors);
        Attempt::Retryable {
            error: retry_errors.join("; "),
            next_retry_at,
        }
    }

    /// First delivery of a batch reply. Anything short of `Sent` lands in the queue.
    #[tracing::instrument(skip_all, fields(event_id = %reply.event_id))]
    pub async fn dispatch(&self, reply: &Reply) -> Result<DispatchOutcome, StoreError> {
        let (status, next_retry_at, error) = match self.attempt(&reply.text, &reply.event_id).await {
            Attempt::Sent { channel, reply_id } => {
                self.store.complete_reply(&reply.event_id, self.clock.now()).await?;
                info!(%channel, %reply_id, "Reply delivered");
                return Ok(DispatchOutcome::Sent { channel, reply_id });
            }
            Attempt::Retryable {
                error,
                next_retry_at,
            } => (ReplyStatus::Pending, next_retry_at, error),
            Attempt::Fatal { error } => (ReplyStatus::Failed, self.clock.now(), error),
        };

        let now = self.clock.now();
        self.store
            .enqueue_reply(&ReplyFailure {
                event_id: reply.event_id.clone(),
                reply_text: reply.text.clone(),
                reply_to: reply.event_id.clone(),
                settlement_ref: reply.settlement_ref.clone(),
                next_retry_at,
                status,
                error: error.clone(),
                at: now,
            })
            .await?;
        warn!(%error, %next_retry_at, status = status.as_str(), "Reply queued");
        self.notify_operator(reply).await;

        Ok(match status {
            ReplyStatus::Failed => DispatchOutcome::Failed { error },
            _ => DispatchOutcome::Queued { next_retry_at },
        })
    }

    async fn notify_operator(&self, reply: &Reply) {
        let context = OperatorContext {
            event_id: reply.event_id.clone(),
            settlement_ref: reply.settlement_ref.clone(),
        };
        self.alert_operator(&reply.text, &context).await;
    }

    /// Best-effort message to the operator. `false` when nobody heard it.
    pub async fn alert_operator(&self, text: &str, context: &OperatorContext) -> bool {
        let Some(operator) = &self.operator else {
            return false;
        };
        match operator.notify_operator(text, context).await {
            Ok(()) => true,
            Err(e) => {
                warn!(event_id = %context.event_id, error = %e, "Operator notification failed");
                false
            }
        }
    }

    /// Try channels once without touching the queue. Used for courtesy replies.
    pub async fn post_best_effort(&self, text: &str, reply_to: &str) -> bool {
        match self.attempt(text, reply_to).await {
            Attempt::Sent { .. } => true,
            Attempt::Retryable { error, .. } | Attempt::Fatal { error } => {
                warn!(reply_to, %error, "Best-effort reply not delivered");
                false
            }
        }
    }

    /// Retry due queue rows, oldest `next_retry_at` first.
    #[tracing::instrument(skip_all)]
    pub async fn sweep(&self) -> Result<SweepReport, StoreError> {
        let now = self.clock.now();
        let leased = self
            .store
            .lease_due_replies(now, now - self.policy.lease, self.policy.sweep_batch_size)
            .await?;

        let mut report = SweepReport {
            attempted: leased.len(),
            ..SweepReport::default()
        };
        for row in leased {
            match self.attempt(&row.reply_text, &row.reply_to).await {
                Attempt::Sent { channel, reply_id } => {
                    self.store.complete_reply(&row.event_id, self.clock.now()).await?;
                    info!(event_id = %row.event_id, %channel, %reply_id, attempts = row.attempts, "Queued reply delivered");
                    report.succeeded += 1;
                }
                Attempt::Retryable {
                    error,
                    next_retry_at,
                } => {
                    self.store
                        .reschedule_reply(&row.event_id, next_retry_at, &error, self.clock.now())
                        .await?;
                    debug!(event_id = %row.event_id, %next_retry_at, "Queued reply rescheduled");
                    report.failed += 1;
                }
                Attempt::Fatal { error } => {
                    self.store.fail_reply(&row.event_id, &error, self.clock.now()).await?;
                    warn!(event_id = %row.event_id, %error, "Queued reply failed permanently");
                    report.failed += 1;
                }
            }
        }
        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                succeeded = report.succeeded,
                failed = report.failed,
                "Retry sweep complete"
            );
        }
        Ok(report)
    }
}
