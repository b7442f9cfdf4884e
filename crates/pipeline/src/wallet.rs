use std::sync::Arc;

use quasar_chain::{ChainError, ValueTransfer};
use quasar_core::{Address, Amount, Handle, Token};
use quasar_storage::models::{Account, AccountRowError, HistoryKind, LedgerBatch, NewHistoryEntry};
use quasar_storage::{StoreError, TipStore};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

use crate::clock::Clock;
use crate::executor::{TransferError, TransferExecutor};

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("account {0} not found")]
    NotFound(Handle),

    #[error("account {0} has not been activated")]
    NotActivated(Handle),

    #[error("account {0} has no custodial wallet")]
    NoWallet(Handle),

    #[error("withdrawal amount must be positive")]
    InvalidAmount,

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalletBalance {
    pub address: Address,
    pub bnb: Amount,
    pub usdc: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Withdrawal {
    pub reference: String,
    pub confirmed: bool,
    pub from: Address,
    pub to: Address,
    pub amount: Amount,
    pub token: Token,
    /// `false` when the transfer went out but its history entry could not be written.
    pub recorded: bool,
}

/// Owner-facing wallet reads and withdrawals to external addresses.
pub struct WalletService {
    store: Arc<dyn TipStore>,
    executor: TransferExecutor,
    chain: Arc<dyn ValueTransfer>,
    clock: Arc<dyn Clock>,
}

impl WalletService {
    pub fn new(
        store: Arc<dyn TipStore>,
        executor: TransferExecutor,
        chain: Arc<dyn ValueTransfer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            executor,
            chain,
            clock,
        }
    }

    async fn account(&self, handle: &Handle) -> Result<Account, WalletError> {
        let row = self
            .store
            .find_account(handle)
            .await?
            .ok_or_else(|| WalletError::NotFound(handle.clone()))?;
        Account::try_from(row).map_err(|e| match e {
            AccountRowError::MissingCustody(_) => WalletError::NoWallet(handle.clone()),
            e => StoreError::from(e).into(),
        })
    }

    /// On-chain holdings of the custodial wallet behind `handle`.
    pub async fn balance(&self, handle: &Handle) -> Result<WalletBalance, WalletError> {
        let address = self.account(handle).await?.address();
        let bnb = self.chain.balance(address, Token::Bnb).await?;
        let usdc = self.chain.balance(address, Token::Usdc).await?;
        Ok(WalletBalance {
            address,
            bnb: Amount::from_base_units(bnb),
            usdc: Amount::from_base_units(usdc),
        })
    }

    /// Send `amount` of `token` out of the owner's custodial wallet.
    ///
    /// Only activated owners may withdraw. The transfer is submitted once;
    /// a failed history write after settlement is reported, not retried.
    #[tracing::instrument(skip_all, fields(handle = %handle, to = %to, amount = %amount, token = %token))]
    pub async fn withdraw(
        &self,
        handle: &Handle,
        to: Address,
        amount: Amount,
        token: Token,
    ) -> Result<Withdrawal, WalletError> {
        if amount.is_zero() {
            return Err(WalletError::InvalidAmount);
        }
        let account = self.account(handle).await?;
        if !account.is_activated() {
            return Err(WalletError::NotActivated(handle.clone()));
        }

        let settlement = self.executor.withdraw(&account, to, amount, token).await?;
        let reference = settlement.reference.clone();
        let entry = NewHistoryEntry {
            account_handle: handle.clone(),
            kind: HistoryKind::Transfer,
            amount,
            token,
            counterparty: format!("{to:#x}"),
            settlement_ref: reference.clone(),
            entry_key: format!("withdraw:{reference}"),
            at: self.clock.now(),
        };
        let batch = LedgerBatch {
            history: vec![entry],
            ..LedgerBatch::default()
        };
        let recorded = match self.store.commit_ledger(&batch).await {
            Ok(_) => true,
            Err(e) => {
                error!(%reference, error = %e, "Withdrawal settled but history was not written");
                false
            }
        };
        info!(%reference, confirmed = settlement.confirmed, "Withdrawal submitted");

        Ok(Withdrawal {
            reference,
            confirmed: settlement.confirmed,
            from: account.address(),
            to,
            amount,
            token,
            recorded,
        })
    }
}
