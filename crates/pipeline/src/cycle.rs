use std::sync::Arc;

use chrono::{DateTime, Utc};
use quasar_core::{AppError, Handle};
use quasar_social::normalize::newer_id;
use quasar_social::{EventSource, Mention, OperatorContext, SourceError};
use quasar_storage::{StoreError, TipStore};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::batcher::{self, BatchedIntent, ParsedMention};
use crate::clock::Clock;
use crate::dispatcher::{ReplyDispatcher, SweepReport};
use crate::executor::TransferExecutor;
use crate::intake;
use crate::ledger::{self, TransferOutcome};
use crate::parser::CommandParser;
use crate::replies::{self, Reply, ReplyUrls};
use crate::resolver::AccountResolver;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub query: String,
    /// Mentions authored by this handle are never treated as commands.
    pub bot_handle: Handle,
    pub urls: ReplyUrls,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollReport {
    pub fetched: usize,
    /// Mentions left after deduplication.
    pub fresh: usize,
    /// Member events this cycle took ownership of.
    pub processed: usize,
    /// Events marked processed without any effect.
    pub ignored: usize,
    pub batches: usize,
    pub transfer_failures: usize,
    /// Batches dropped because a party's account row was unusable.
    pub unresolved: usize,
    pub newest_id: Option<String>,
    pub rate_limited_until: Option<DateTime<Utc>>,
}

/// One poll cycle: fetch, dedup, parse, batch, resolve, execute, record, reply.
pub struct Pipeline {
    source: Arc<dyn EventSource>,
    store: Arc<dyn TipStore>,
    parser: CommandParser,
    resolver: AccountResolver,
    executor: TransferExecutor,
    dispatcher: Arc<ReplyDispatcher>,
    clock: Arc<dyn Clock>,
    config: PipelineConfig,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<dyn EventSource>,
        store: Arc<dyn TipStore>,
        parser: CommandParser,
        resolver: AccountResolver,
        executor: TransferExecutor,
        dispatcher: Arc<ReplyDispatcher>,
        clock: Arc<dyn Clock>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            source,
            store,
            parser,
            resolver,
            executor,
            dispatcher,
            clock,
            config,
        }
    }

    /// Run one cycle from `since`. The stored cursor is neither read nor written.
    #[tracing::instrument(skip_all, fields(since = since.unwrap_or("-")))]
    pub async fn run_poll_cycle(&self, since: Option<&str>) -> Result<PollReport, AppError> {
        let page = match self.source.search(&self.config.query, since).await {
            Ok(page) => page,
            Err(SourceError::RateLimited { resume_at }) => {
                warn!(?resume_at, "Search rate limited, skipping cycle");
                return Ok(PollReport {
                    rate_limited_until: resume_at,
                    ..PollReport::default()
                });
            }
            Err(e) => return Err(AppError::Upstream(e.to_string())),
        };

        let mut report = PollReport {
            fetched: page.mentions.len(),
            newest_id: page.newest_id,
            ..PollReport::default()
        };

        let fresh = intake::filter_new(self.store.as_ref(), page.mentions).await?;
        report.fresh = fresh.len();

        let (parsed, ignored) = self.split_commands(fresh);
        for event_id in &ignored {
            if self.store.mark_processed(event_id, self.clock.now()).await? {
                report.ignored += 1;
            }
        }

        let batches = batcher::group(parsed);
        for batch in batches {
            match self.process_batch(batch).await? {
                BatchResult::Skipped => {}
                BatchResult::Unresolved { members } => {
                    report.unresolved += 1;
                    report.processed += members;
                }
                BatchResult::Done { members, failed } => {
                    report.batches += 1;
                    report.processed += members;
                    if failed {
                        report.transfer_failures += 1;
                    }
                }
            }
        }

        info!(
            fetched = report.fetched,
            fresh = report.fresh,
            processed = report.processed,
            ignored = report.ignored,
            batches = report.batches,
            transfer_failures = report.transfer_failures,
            unresolved = report.unresolved,
            "Poll cycle complete"
        );
        Ok(report)
    }

    /// Parsed commands, and the ids of events that can never become one.
    fn split_commands(&self, mentions: Vec<Mention>) -> (Vec<ParsedMention>, Vec<String>) {
        let mut parsed = Vec::new();
        let mut ignored = Vec::new();
        for mention in mentions {
            if mention.author == self.config.bot_handle {
                ignored.push(mention.id);
                continue;
            }
            match self.parser.parse(&mention.text) {
                Some(intent) if intent.recipient != mention.author => parsed.push(ParsedMention {
                    event_id: mention.id,
                    sender: mention.author,
                    intent,
                }),
                Some(_) => {
                    debug!(event_id = %mention.id, "Ignoring self-tip");
                    ignored.push(mention.id);
                }
                None => {
                    debug!(event_id = %mention.id, "Mention carries no tip command");
                    ignored.push(mention.id);
                }
            }
        }
        (parsed, ignored)
    }

    #[tracing::instrument(skip_all, fields(sender = %batch.sender, recipient = %batch.recipient, token = %batch.token))]
    async fn process_batch(&self, mut batch: BatchedIntent) -> Result<BatchResult, AppError> {
        let parties = match self.resolver.resolve(&batch.sender, &batch.recipient).await {
            Ok(parties) => parties,
            Err(e) if e.is_transient() => return Err(e.into()),
            Err(e) => {
                // Unmarked members would stall every later cycle on this batch.
                warn!(error = %e, total = %batch.total, "Dropping batch with unresolvable parties");
                let owned = self.take_ownership(&batch).await?;
                if !owned.is_empty() {
                    let text = format!(
                        "Tip batch dropped: {} {} from {} to {}, events [{}]: {e}",
                        batch.total,
                        batch.token,
                        batch.sender,
                        batch.recipient,
                        owned.join(", "),
                    );
                    self.alert(&text, &owned[0], None).await;
                }
                return Ok(BatchResult::Unresolved { members: owned.len() });
            }
        };

        let owned = self.take_ownership(&batch).await?;
        batch.retain_members(|m| owned.contains(&m.event_id));
        if batch.members.is_empty() {
            debug!("Batch fully claimed by another cycle");
            return Ok(BatchResult::Skipped);
        }

        let outcome = match &parties.sender {
            Some(sender) => match self
                .executor
                .execute(sender, &parties.recipient, batch.total, batch.token)
                .await
            {
                Ok(settlement) => TransferOutcome::Settled(settlement),
                Err(e) => {
                    warn!(error = %e, total = %batch.total, "Transfer failed");
                    TransferOutcome::Failed(e.to_string())
                }
            },
            None => TransferOutcome::SenderIncapable,
        };

        let activated = parties.recipient_activated();
        let plan = ledger::plan(&batch, &outcome, activated, self.clock.now());
        let reply = replies::compose(&batch, &outcome, activated, &self.config.urls);
        let commit = match ledger::commit(self.store.as_ref(), &plan).await {
            Ok(commit) => commit,
            Err(e) => {
                self.report_unrecorded(&batch, &outcome, reply.as_ref(), &e).await;
                return Err(e.into());
            }
        };
        debug!(
            history = commit.history_inserted,
            claims = commit.claims_inserted,
            superseded = commit.claims_removed,
            "Ledger committed"
        );

        if let Some(reply) = reply {
            self.dispatcher.dispatch(&reply).await?;
        }

        Ok(BatchResult::Done {
            members: batch.members.len(),
            failed: matches!(outcome, TransferOutcome::Failed(_)),
        })
    }

    /// Mark every member processed. Members already marked belong to an
    /// overlapping cycle and are left out.
    async fn take_ownership(&self, batch: &BatchedIntent) -> Result<Vec<String>, AppError> {
        let mut owned = Vec::with_capacity(batch.members.len());
        for member in &batch.members {
            if self.store.mark_processed(&member.event_id, self.clock.now()).await? {
                owned.push(member.event_id.clone());
            }
        }
        Ok(owned)
    }

    /// The members are marked processed but the ledger write failed, so no
    /// later cycle will see them again. Hand the operator everything needed
    /// to reconcile, and tell the sender when value has already moved.
    async fn report_unrecorded(
        &self,
        batch: &BatchedIntent,
        outcome: &TransferOutcome,
        reply: Option<&Reply>,
        cause: &StoreError,
    ) {
        let settlement_ref = outcome.settlement().map(|s| s.reference.clone());
        error!(
            reference = settlement_ref.as_deref().unwrap_or("-"),
            events = ?batch.event_ids(),
            error = %cause,
            "Ledger commit failed after events were marked processed"
        );

        let moved = match &settlement_ref {
            Some(reference) => format!("transfer {reference} settled"),
            None => "no value moved".to_string(),
        };
        let text = format!(
            "Ledger write failed ({moved}): {} {} from {} to {}, events [{}]: {cause}",
            batch.total,
            batch.token,
            batch.sender,
            batch.recipient,
            batch.event_ids().join(", "),
        );
        let first_event = batch.first_event().unwrap_or_default();
        self.alert(&text, first_event, settlement_ref.clone()).await;

        if settlement_ref.is_some() {
            if let Some(reply) = reply {
                if let Err(e) = self.dispatcher.dispatch(reply).await {
                    warn!(error = %e, "Reply for unrecorded transfer could not be queued");
                }
            }
        }
    }

    async fn alert(&self, text: &str, event_id: &str, settlement_ref: Option<String>) {
        let context = OperatorContext {
            event_id: event_id.to_string(),
            settlement_ref,
        };
        if !self.dispatcher.alert_operator(text, &context).await {
            warn!(event_id, "No operator received the alert");
        }
    }

    /// Poll from the stored cursor, advancing it only after the cycle succeeds.
    pub async fn run_scheduled_poll(&self) -> Result<PollReport, AppError> {
        let cursor = self.store.cursor().await?;
        let report = self.run_poll_cycle(cursor.as_deref()).await?;

        if let Some(newest) = &report.newest_id {
            let next = match &cursor {
                Some(current) => newer_id(current, newest),
                None => newest.as_str(),
            };
            if cursor.as_deref() != Some(next) {
                self.store.set_cursor(next).await?;
                debug!(cursor = next, "Mention cursor advanced");
            }
        }
        Ok(report)
    }

    pub async fn run_retry_sweep(&self) -> Result<SweepReport, AppError> {
        Ok(self.dispatcher.sweep().await?)
    }
}

enum BatchResult {
    Skipped,
    Unresolved { members: usize },
    Done { members: usize, failed: bool },
}
