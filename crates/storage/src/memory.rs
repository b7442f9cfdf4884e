//! In-process [`TipStore`] with the same write semantics as the Postgres
//! repos. Used by pipeline tests and local dry runs.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quasar_core::{CustodialWallet, Handle};
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::models::*;
use crate::store::TipStore;

#[derive(Default)]
struct Inner {
    accounts: BTreeMap<String, AccountRow>,
    history: Vec<HistoryEntry>,
    claims: Vec<PendingClaim>,
    processed: HashMap<String, DateTime<Utc>>,
    replies: BTreeMap<String, QueuedReply>,
    cursor: Option<String>,
    next_id: i64,
    unavailable: bool,
    fail_ledger: bool,
}

impl Inner {
    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable {
            return Err(StoreError::Unavailable("memory store switched off".into()));
        }
        Ok(())
    }

    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn insert_history(&mut self, entry: &NewHistoryEntry) -> bool {
        let exists = self.history.iter().any(|h| {
            h.account_handle == entry.account_handle.as_str()
                && h.kind == entry.kind.as_str()
                && h.entry_key == entry.entry_key
        });
        if exists {
            return false;
        }
        let id = self.next_id();
        self.history.push(HistoryEntry {
            id,
            account_handle: entry.account_handle.to_string(),
            kind: entry.kind.as_str().to_string(),
            amount: entry.amount.to_base_string(),
            token: entry.token.symbol().to_string(),
            counterparty: entry.counterparty.clone(),
            settlement_ref: entry.settlement_ref.clone(),
            entry_key: entry.entry_key.clone(),
            created_at: entry.at,
        });
        true
    }

    fn insert_claim(&mut self, claim: &NewPendingClaim) -> bool {
        let exists = self.claims.iter().any(|c| {
            c.account_handle == claim.account_handle.as_str()
                && c.origin_event == claim.origin_event
                && c.sender == claim.sender.as_str()
        });
        if exists {
            return false;
        }
        let id = self.next_id();
        self.claims.push(PendingClaim {
            id,
            account_handle: claim.account_handle.to_string(),
            amount: claim.amount.to_base_string(),
            token: claim.token.symbol().to_string(),
            origin_event: claim.origin_event.clone(),
            sender: claim.sender.to_string(),
            settlement_ref: claim.settlement_ref.clone(),
            created_at: claim.at,
        });
        true
    }
}

/// Thread-safe in-memory store with switchable fault injection.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with [`StoreError::Unavailable`].
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().await.unavailable = unavailable;
    }

    /// Make only `commit_ledger` fail.
    pub async fn fail_ledger_commits(&self, fail: bool) {
        self.inner.lock().await.fail_ledger = fail;
    }

    /// Number of processed-event markers.
    pub async fn processed_count(&self) -> usize {
        self.inner.lock().await.processed.len()
    }
}

fn wallet_columns(wallet: &CustodialWallet) -> (Option<String>, Option<String>) {
    (
        Some(format!("{:#x}", wallet.address)),
        Some(wallet.encrypted_key.clone()),
    )
}

#[async_trait]
impl TipStore for MemoryStore {
    async fn processed_among(&self, event_ids: &[String]) -> Result<HashSet<String>, StoreError> {
        let inner = self.inner.lock().await;
        inner.check()?;
        Ok(event_ids
            .iter()
            .filter(|id| inner.processed.contains_key(*id))
            .cloned()
            .collect())
    }

    async fn mark_processed(&self, event_id: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check()?;
        if inner.processed.contains_key(event_id) {
            return Ok(false);
        }
        inner.processed.insert(event_id.to_string(), at);
        Ok(true)
    }

    async fn find_account(&self, handle: &Handle) -> Result<Option<AccountRow>, StoreError> {
        let inner = self.inner.lock().await;
        inner.check()?;
        Ok(inner.accounts.get(handle.as_str()).cloned())
    }

    async fn insert_provisioned_account(
        &self,
        handle: &Handle,
        wallet: &CustodialWallet,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check()?;
        if inner.accounts.contains_key(handle.as_str()) {
            return Ok(false);
        }
        let (address, encrypted_key) = wallet_columns(wallet);
        inner.accounts.insert(
            handle.to_string(),
            AccountRow {
                handle: handle.to_string(),
                display_name: handle.username().to_string(),
                avatar_url: String::new(),
                bio: String::new(),
                address,
                encrypted_key,
                activated: false,
                created_at: at,
                updated_at: at,
            },
        );
        Ok(true)
    }

    async fn attach_wallet(
        &self,
        handle: &Handle,
        wallet: &CustodialWallet,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check()?;
        match inner.accounts.get_mut(handle.as_str()) {
            Some(row) if row.encrypted_key.is_none() => {
                (row.address, row.encrypted_key) = wallet_columns(wallet);
                row.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn activate_account(
        &self,
        handle: &Handle,
        profile: &Profile,
        wallet: &CustodialWallet,
        at: DateTime<Utc>,
    ) -> Result<AccountRow, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check()?;
        let row = inner
            .accounts
            .entry(handle.to_string())
            .or_insert_with(|| AccountRow {
                handle: handle.to_string(),
                display_name: String::new(),
                avatar_url: String::new(),
                bio: String::new(),
                address: None,
                encrypted_key: None,
                activated: false,
                created_at: at,
                updated_at: at,
            });
        row.display_name = profile.display_name.clone();
        row.avatar_url = profile.avatar_url.clone();
        row.bio = profile.bio.clone();
        row.activated = true;
        if row.encrypted_key.is_none() {
            (row.address, row.encrypted_key) = wallet_columns(wallet);
        }
        row.updated_at = at;
        Ok(row.clone())
    }

    async fn commit_ledger(&self, batch: &LedgerBatch) -> Result<LedgerCommit, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check()?;
        if inner.fail_ledger {
            return Err(StoreError::Unavailable("ledger commit rejected".into()));
        }
        let mut commit = LedgerCommit::default();
        for entry in &batch.history {
            if inner.insert_history(entry) {
                commit.history_inserted += 1;
            }
        }
        for claim in &batch.claims {
            if inner.insert_claim(claim) {
                commit.claims_inserted += 1;
            }
        }
        if let Some(superseded) = &batch.superseded {
            let before = inner.claims.len();
            inner.claims.retain(|c| {
                !(c.account_handle == superseded.account_handle.as_str()
                    && c.sender == superseded.sender.as_str()
                    && superseded.origin_events.contains(&c.origin_event))
            });
            commit.claims_removed = (before - inner.claims.len()) as u64;
        }
        Ok(commit)
    }

    async fn history(&self, handle: &Handle) -> Result<Vec<HistoryEntry>, StoreError> {
        let inner = self.inner.lock().await;
        inner.check()?;
        let mut entries: Vec<_> = inner
            .history
            .iter()
            .filter(|h| h.account_handle == handle.as_str())
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(entries)
    }

    async fn pending_claims(&self, handle: &Handle) -> Result<Vec<PendingClaim>, StoreError> {
        let inner = self.inner.lock().await;
        inner.check()?;
        let mut claims: Vec<_> = inner
            .claims
            .iter()
            .filter(|c| c.account_handle == handle.as_str())
            .cloned()
            .collect();
        claims.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(claims)
    }

    async fn claim_pending(
        &self,
        handle: &Handle,
        claim_id: i64,
        at: DateTime<Utc>,
    ) -> Result<Option<HistoryEntry>, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check()?;
        let Some(pos) = inner
            .claims
            .iter()
            .position(|c| c.id == claim_id && c.account_handle == handle.as_str())
        else {
            return Ok(None);
        };
        let claim = inner.claims.remove(pos);
        let entry_key = format!("claim:{}", claim.id);
        let exists = inner
            .history
            .iter()
            .any(|h| h.account_handle == claim.account_handle && h.kind == "tip" && h.entry_key == entry_key);
        if !exists {
            let id = inner.next_id();
            inner.history.push(HistoryEntry {
                id,
                account_handle: claim.account_handle.clone(),
                kind: HistoryKind::Tip.as_str().to_string(),
                amount: claim.amount.clone(),
                token: claim.token.clone(),
                counterparty: claim.sender.clone(),
                settlement_ref: claim
                    .settlement_ref
                    .clone()
                    .unwrap_or_else(|| claim.origin_event.clone()),
                entry_key: entry_key.clone(),
                created_at: at,
            });
        }
        Ok(inner
            .history
            .iter()
            .find(|h| h.account_handle == claim.account_handle && h.kind == "tip" && h.entry_key == entry_key)
            .cloned())
    }

    async fn enqueue_reply(&self, failure: &ReplyFailure) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check()?;
        match inner.replies.get_mut(&failure.event_id) {
            Some(row) if row.status() == Some(ReplyStatus::Completed) => {}
            Some(row) => {
                row.reply_text = failure.reply_text.clone();
                if failure.settlement_ref.is_some() {
                    row.settlement_ref = failure.settlement_ref.clone();
                }
                row.attempts += 1;
                row.last_attempt_at = failure.at;
                row.next_retry_at = failure.next_retry_at;
                row.status = failure.status.as_str().to_string();
                row.last_error = Some(failure.error.clone());
                row.updated_at = failure.at;
            }
            None => {
                inner.replies.insert(
                    failure.event_id.clone(),
                    QueuedReply {
                        event_id: failure.event_id.clone(),
                        reply_text: failure.reply_text.clone(),
                        reply_to: failure.reply_to.clone(),
                        settlement_ref: failure.settlement_ref.clone(),
                        attempts: 1,
                        last_attempt_at: failure.at,
                        next_retry_at: failure.next_retry_at,
                        status: failure.status.as_str().to_string(),
                        last_error: Some(failure.error.clone()),
                        created_at: failure.at,
                        updated_at: failure.at,
                    },
                );
            }
        }
        Ok(())
    }

    async fn complete_reply(&self, event_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check()?;
        if let Some(row) = inner.replies.get_mut(event_id) {
            row.status = ReplyStatus::Completed.as_str().to_string();
            row.last_error = None;
            row.updated_at = at;
        }
        Ok(())
    }

    async fn lease_due_replies(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<QueuedReply>, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check()?;
        let mut due: Vec<_> = inner
            .replies
            .values()
            .filter(|r| match r.status() {
                Some(ReplyStatus::Pending) => r.next_retry_at <= now,
                Some(ReplyStatus::Processing) => r.last_attempt_at <= stale_before,
                _ => false,
            })
            .map(|r| (r.next_retry_at, r.event_id.clone()))
            .collect();
        due.sort();
        due.truncate(usize::try_from(limit).unwrap_or(0));

        let mut leased = Vec::with_capacity(due.len());
        for (_, event_id) in due {
            if let Some(row) = inner.replies.get_mut(&event_id) {
                row.status = ReplyStatus::Processing.as_str().to_string();
                row.attempts += 1;
                row.last_attempt_at = now;
                row.updated_at = now;
                leased.push(row.clone());
            }
        }
        Ok(leased)
    }

    async fn reschedule_reply(
        &self,
        event_id: &str,
        next_retry_at: DateTime<Utc>,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check()?;
        if let Some(row) = inner.replies.get_mut(event_id) {
            if row.status() == Some(ReplyStatus::Processing) {
                row.status = ReplyStatus::Pending.as_str().to_string();
                row.next_retry_at = next_retry_at;
                row.last_error = Some(error.to_string());
                row.updated_at = at;
            }
        }
        Ok(())
    }

    async fn fail_reply(
        &self,
        event_id: &str,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check()?;
        if let Some(row) = inner.replies.get_mut(event_id) {
            if row.status() == Some(ReplyStatus::Processing) {
                row.status = ReplyStatus::Failed.as_str().to_string();
                row.last_error = Some(error.to_string());
                row.updated_at = at;
            }
        }
        Ok(())
    }

    async fn queued_reply(&self, event_id: &str) -> Result<Option<QueuedReply>, StoreError> {
        let inner = self.inner.lock().await;
        inner.check()?;
        Ok(inner.replies.get(event_id).cloned())
    }

    async fn queue_stats(&self, now: DateTime<Utc>) -> Result<QueueStats, StoreError> {
        let inner = self.inner.lock().await;
        inner.check()?;
        let mut stats = QueueStats::default();
        for row in inner.replies.values() {
            stats.total += 1;
            match row.status() {
                Some(ReplyStatus::Pending) => {
                    stats.pending += 1;
                    if row.next_retry_at <= now {
                        stats.ready_to_retry += 1;
                    }
                }
                Some(ReplyStatus::Processing) => stats.processing += 1,
                Some(ReplyStatus::Completed) => stats.completed += 1,
                Some(ReplyStatus::Failed) => stats.failed += 1,
                None => {}
            }
        }
        Ok(stats)
    }

    async fn cursor(&self) -> Result<Option<String>, StoreError> {
        let inner = self.inner.lock().await;
        inner.check()?;
        Ok(inner.cursor.clone())
    }

    async fn set_cursor(&self, cursor: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check()?;
        inner.cursor = Some(cursor.to_string());
        Ok(())
    }
}
