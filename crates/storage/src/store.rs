use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quasar_core::{CustodialWallet, Handle};
use sqlx::PgPool;

use crate::error::StoreError;
use crate::models::*;
use crate::repos;

/// Everything the tipping pipeline persists.
///
/// Writes that can overlap between concurrent poll cycles are upserts keyed
/// by event id, so overlapping callers converge instead of duplicating.
#[async_trait]
pub trait TipStore: Send + Sync {
    // ─── Processed events ───

    /// Which of `event_ids` already carry a processed marker.
    async fn processed_among(&self, event_ids: &[String]) -> Result<HashSet<String>, StoreError>;

    /// Insert-if-absent. `true` when this call created the marker.
    async fn mark_processed(&self, event_id: &str, at: DateTime<Utc>) -> Result<bool, StoreError>;

    // ─── Accounts ───

    async fn find_account(&self, handle: &Handle) -> Result<Option<AccountRow>, StoreError>;

    /// `false` when a row for `handle` already existed.
    async fn insert_provisioned_account(
        &self,
        handle: &Handle,
        wallet: &CustodialWallet,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Attach custody material only if the row has none.
    async fn attach_wallet(
        &self,
        handle: &Handle,
        wallet: &CustodialWallet,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn activate_account(
        &self,
        handle: &Handle,
        profile: &Profile,
        wallet: &CustodialWallet,
        at: DateTime<Utc>,
    ) -> Result<AccountRow, StoreError>;

    // ─── Ledger ───

    async fn commit_ledger(&self, batch: &LedgerBatch) -> Result<LedgerCommit, StoreError>;

    async fn history(&self, handle: &Handle) -> Result<Vec<HistoryEntry>, StoreError>;

    async fn pending_claims(&self, handle: &Handle) -> Result<Vec<PendingClaim>, StoreError>;

    async fn claim_pending(
        &self,
        handle: &Handle,
        claim_id: i64,
        at: DateTime<Utc>,
    ) -> Result<Option<HistoryEntry>, StoreError>;

    // ─── Reply queue ───

    async fn enqueue_reply(&self, failure: &ReplyFailure) -> Result<(), StoreError>;

    async fn complete_reply(&self, event_id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn lease_due_replies(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<QueuedReply>, StoreError>;

    async fn reschedule_reply(
        &self,
        event_id: &str,
        next_retry_at: DateTime<Utc>,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn fail_reply(&self, event_id: &str, error: &str, at: DateTime<Utc>)
    -> Result<(), StoreError>;

    async fn queued_reply(&self, event_id: &str) -> Result<Option<QueuedReply>, StoreError>;

    async fn queue_stats(&self, now: DateTime<Utc>) -> Result<QueueStats, StoreError>;

    // ─── Cursor ───

    async fn cursor(&self) -> Result<Option<String>, StoreError>;

    async fn set_cursor(&self, cursor: &str) -> Result<(), StoreError>;
}

/// Postgres-backed [`TipStore`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TipStore for PgStore {
    async fn processed_among(&self, event_ids: &[String]) -> Result<HashSet<String>, StoreError> {
        let seen = repos::get_processed_among(&self.pool, event_ids).await?;
        Ok(seen.into_iter().collect())
    }

    async fn mark_processed(&self, event_id: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        Ok(repos::mark_event_processed(&self.pool, event_id, at).await?)
    }

    async fn find_account(&self, handle: &Handle) -> Result<Option<AccountRow>, StoreError> {
        Ok(repos::get_account(&self.pool, handle).await?)
    }

    async fn insert_provisioned_account(
        &self,
        handle: &Handle,
        wallet: &CustodialWallet,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        Ok(repos::insert_provisioned_account(&self.pool, handle, wallet, at).await?)
    }

    async fn attach_wallet(
        &self,
        handle: &Handle,
        wallet: &CustodialWallet,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        Ok(repos::attach_wallet(&self.pool, handle, wallet, at).await?)
    }

    async fn activate_account(
        &self,
        handle: &Handle,
        profile: &Profile,
        wallet: &CustodialWallet,
        at: DateTime<Utc>,
    ) -> Result<AccountRow, StoreError> {
        Ok(repos::upsert_activated_account(&self.pool, handle, profile, wallet, at).await?)
    }

    async fn commit_ledger(&self, batch: &LedgerBatch) -> Result<LedgerCommit, StoreError> {
        Ok(repos::commit_ledger_batch(&self.pool, batch).await?)
    }

    async fn history(&self, handle: &Handle) -> Result<Vec<HistoryEntry>, StoreError> {
        Ok(repos::get_history(&self.pool, handle).await?)
    }

    async fn pending_claims(&self, handle: &Handle) -> Result<Vec<PendingClaim>, StoreError> {
        Ok(repos::get_pending_claims(&self.pool, handle).await?)
    }

    async fn claim_pending(
        &self,
        handle: &Handle,
        claim_id: i64,
        at: DateTime<Utc>,
    ) -> Result<Option<HistoryEntry>, StoreError> {
        Ok(repos::claim_pending(&self.pool, handle, claim_id, at).await?)
    }

    async fn enqueue_reply(&self, failure: &ReplyFailure) -> Result<(), StoreError> {
        Ok(repos::upsert_queued_reply(&self.pool, failure).await?)
    }

    async fn complete_reply(&self, event_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        Ok(repos::complete_queued_reply(&self.pool, event_id, at).await?)
    }

    async fn lease_due_replies(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<QueuedReply>, StoreError> {
        Ok(repos::lease_due_replies(&self.pool, now, stale_before, limit).await?)
    }

    async fn reschedule_reply(
        &self,
        event_id: &str,
        next_retry_at: DateTime<Utc>,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        Ok(repos::reschedule_queued_reply(&self.pool, event_id, next_retry_at, error, at).await?)
    }

    async fn fail_reply(
        &self,
        event_id: &str,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        Ok(repos::fail_queued_reply(&self.pool, event_id, error, at).await?)
    }

    async fn queued_reply(&self, event_id: &str) -> Result<Option<QueuedReply>, StoreError> {
        Ok(repos::get_queued_reply(&self.pool, event_id).await?)
    }

    async fn queue_stats(&self, now: DateTime<Utc>) -> Result<QueueStats, StoreError> {
        Ok(repos::get_queue_stats(&self.pool, now).await?)
    }

    async fn cursor(&self) -> Result<Option<String>, StoreError> {
        Ok(repos::get_mention_cursor(&self.pool).await?)
    }

    async fn set_cursor(&self, cursor: &str) -> Result<(), StoreError> {
        Ok(repos::set_mention_cursor(&self.pool, cursor).await?)
    }
}
