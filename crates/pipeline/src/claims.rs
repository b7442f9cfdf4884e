use std::sync::Arc;

use quasar_chain::{Custody, CustodyError};
use quasar_core::Handle;
use quasar_storage::models::{Account, AccountRowError, HistoryEntry, Profile};
use quasar_storage::{StoreError, TipStore};
use thiserror::Error;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::dispatcher::ReplyDispatcher;
use crate::replies::{self, ReplyUrls};

#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("account {0} not found")]
    NotFound(Handle),

    #[error("account {0} has not been activated")]
    NotActivated(Handle),

    #[error("pending claim {0} not found")]
    ClaimNotFound(i64),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Custody(#[from] CustodyError),
}

/// Owner-facing operations: activation and claiming of pending value.
pub struct ClaimService {
    store: Arc<dyn TipStore>,
    custody: Arc<dyn Custody>,
    dispatcher: Arc<ReplyDispatcher>,
    clock: Arc<dyn Clock>,
    urls: ReplyUrls,
}

impl ClaimService {
    pub fn new(
        store: Arc<dyn TipStore>,
        custody: Arc<dyn Custody>,
        dispatcher: Arc<ReplyDispatcher>,
        clock: Arc<dyn Clock>,
        urls: ReplyUrls,
    ) -> Self {
        Self {
            store,
            custody,
            dispatcher,
            clock,
            urls,
        }
    }

    /// Mark the owner of `handle` as authenticated. An existing custodial
    /// wallet is kept since funds may already sit in it.
    #[tracing::instrument(skip_all, fields(handle = %handle))]
    pub async fn activate(&self, handle: &Handle, profile: Profile) -> Result<Account, ClaimError> {
        let existing = match self.store.find_account(handle).await? {
            Some(row) => match Account::try_from(row) {
                Ok(account) => Some(account.wallet().clone()),
                Err(AccountRowError::MissingCustody(_)) => None,
                Err(e) => return Err(StoreError::from(e).into()),
            },
            None => None,
        };
        let wallet = match existing {
            Some(wallet) => wallet,
            None => self.custody.provision()?,
        };

        let row = self
            .store
            .activate_account(handle, &profile, &wallet, self.clock.now())
            .await?;
        let account = Account::try_from(row).map_err(StoreError::from)?;
        info!(address = %account.address(), "Account activated");
        Ok(account)
    }

    /// Move one pending claim into history, then tell the originating thread.
    #[tracing::instrument(skip_all, fields(handle = %handle, claim_id = claim_id))]
    pub async fn claim(&self, handle: &Handle, claim_id: i64) -> Result<HistoryEntry, ClaimError> {
        self.require_activated(handle).await?;
        self.claim_one(handle, claim_id).await
    }

    /// Claim everything pending for `handle`, oldest first.
    pub async fn claim_all(&self, handle: &Handle) -> Result<Vec<HistoryEntry>, ClaimError> {
        self.require_activated(handle).await?;
        let pending = self.store.pending_claims(handle).await?;

        let mut claimed = Vec::with_capacity(pending.len());
        for claim in pending {
            match self.claim_one(handle, claim.id).await {
                Ok(entry) => claimed.push(entry),
                // Claimed concurrently.
                Err(ClaimError::ClaimNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(claimed)
    }

    async fn require_activated(&self, handle: &Handle) -> Result<(), ClaimError> {
        let row = self
            .store
            .find_account(handle)
            .await?
            .ok_or_else(|| ClaimError::NotFound(handle.clone()))?;
        if !row.activated {
            return Err(ClaimError::NotActivated(handle.clone()));
        }
        Ok(())
    }

    async fn claim_one(&self, handle: &Handle, claim_id: i64) -> Result<HistoryEntry, ClaimError> {
        let origin_event = self
            .store
            .pending_claims(handle)
            .await?
            .into_iter()
            .find(|c| c.id == claim_id)
            .map(|c| c.origin_event)
            .ok_or(ClaimError::ClaimNotFound(claim_id))?;

        let entry = self
            .store
            .claim_pending(handle, claim_id, self.clock.now())
            .await?
            .ok_or(ClaimError::ClaimNotFound(claim_id))?;
        info!(claim_id, reference = %entry.settlement_ref, "Pending claim moved to history");

        let text = replies::claimed_text(handle.username(), &self.urls);
        if !self.dispatcher.post_best_effort(&text, &origin_event).await {
            warn!(claim_id, %origin_event, "Claim confirmation reply not posted");
        }
        Ok(entry)
    }
}
