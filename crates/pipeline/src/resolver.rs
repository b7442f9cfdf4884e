use std::sync::Arc;

use quasar_chain::{Custody, CustodyError};
use quasar_core::{AppError, Handle};
use quasar_storage::models::{Account, AccountRow, AccountRowError};
use quasar_storage::{StoreError, TipStore};
use thiserror::Error;
use tracing::{debug, info};

use crate::clock::Clock;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Custody(#[from] CustodyError),

    /// The row disappeared or stayed incomplete after provisioning.
    #[error("account {0} could not be provisioned")]
    Unprovisionable(Handle),
}

impl ResolveError {
    /// Worth retrying the whole cycle: the store itself was unreachable.
    /// Anything else is specific to this batch's rows.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Store(StoreError::Database(_) | StoreError::Unavailable(_))
        )
    }
}

impl From<ResolveError> for AppError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::Store(e) => e.into(),
            ResolveError::Custody(e) => AppError::Custody(e.to_string()),
            e @ ResolveError::Unprovisionable(_) => AppError::Database(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedParties {
    /// `None` when the sender cannot send this cycle.
    pub sender: Option<Account>,
    pub recipient: Account,
}

impl ResolvedParties {
    pub fn sender_capable(&self) -> bool {
        self.sender.is_some()
    }

    pub fn recipient_activated(&self) -> bool {
        self.recipient.is_activated()
    }
}

/// Maps handles to accounts, provisioning recipients on first use.
pub struct AccountResolver {
    store: Arc<dyn TipStore>,
    custody: Arc<dyn Custody>,
    clock: Arc<dyn Clock>,
}

fn typed(row: AccountRow) -> Result<Option<Account>, ResolveError> {
    match Account::try_from(row) {
        Ok(account) => Ok(Some(account)),
        Err(AccountRowError::MissingCustody(_)) => Ok(None),
        Err(e) => Err(StoreError::from(e).into()),
    }
}

impl AccountResolver {
    pub fn new(store: Arc<dyn TipStore>, custody: Arc<dyn Custody>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            custody,
            clock,
        }
    }

    #[tracing::instrument(skip_all, fields(sender = %sender, recipient = %recipient))]
    pub async fn resolve(
        &self,
        sender: &Handle,
        recipient: &Handle,
    ) -> Result<ResolvedParties, ResolveError> {
        let sender = match self.store.find_account(sender).await? {
            Some(row) => typed(row)?,
            None => None,
        };
        let recipient = self.ensure_recipient(recipient).await?;
        Ok(ResolvedParties { sender, recipient })
    }

    async fn ensure_recipient(&self, handle: &Handle) -> Result<Account, ResolveError> {
        let existing = self.store.find_account(handle).await?;
        if let Some(account) = existing.clone().map(typed).transpose()?.flatten() {
            return Ok(account);
        }

        let wallet = self.custody.provision()?;
        let now = self.clock.now();
        if existing.is_none() {
            if self.store.insert_provisioned_account(handle, &wallet, now).await? {
                info!(handle = %handle, address = %wallet.address, "Provisioned recipient account");
            } else {
                debug!(handle = %handle, "Recipient created concurrently");
                // The concurrent row may still lack custody material.
                self.store.attach_wallet(handle, &wallet, now).await?;
            }
        } else if self.store.attach_wallet(handle, &wallet, now).await? {
            info!(handle = %handle, address = %wallet.address, "Attached wallet to recipient account");
        }

        let row = self
            .store
            .find_account(handle)
            .await?
            .ok_or_else(|| ResolveError::Unprovisionable(handle.clone()))?;
        typed(row)?.ok_or_else(|| ResolveError::Unprovisionable(handle.clone()))
    }
}
