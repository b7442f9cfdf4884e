use std::sync::Arc;
use std::time::Duration;

use quasar_chain::{
    ChainError, Custody, CustodyError, FeeQuote, Settlement, TransferRequest, ValueTransfer,
};
use quasar_core::{Address, Amount, Token};
use quasar_storage::models::Account;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("insufficient {token} balance: available {available}, required {required}")]
    InsufficientBalance {
        token: Token,
        available: Amount,
        required: Amount,
    },

    #[error("insufficient BNB for network fee: available {available}, required {required}")]
    InsufficientFee { available: Amount, required: Amount },

    #[error("signing material unusable: {0}")]
    Signing(#[from] CustodyError),

    #[error("derived address {derived} does not match stored address {stored}")]
    AddressMismatch { derived: Address, stored: Address },

    #[error(transparent)]
    Chain(#[from] ChainError),
}

/// The only component that moves value.
pub struct TransferExecutor {
    custody: Arc<dyn Custody>,
    chain: Arc<dyn ValueTransfer>,
    settlement_timeout: Duration,
}

impl TransferExecutor {
    pub fn new(
        custody: Arc<dyn Custody>,
        chain: Arc<dyn ValueTransfer>,
        settlement_timeout: Duration,
    ) -> Self {
        Self {
            custody,
            chain,
            settlement_timeout,
        }
    }

    /// Move `amount` of `token` from `sender` to `recipient`, submitting at most once.
    ///
    /// Every precondition is checked before submission, so an error other
    /// than [`TransferError::Chain`] means nothing was broadcast.
    #[tracing::instrument(skip_all, fields(sender = %sender.handle(), recipient = %recipient.handle(), amount = %amount, token = %token))]
    pub async fn execute(
        &self,
        sender: &Account,
        recipient: &Account,
        amount: Amount,
        token: Token,
    ) -> Result<Settlement, TransferError> {
        self.transfer(sender, recipient.address(), amount, token).await
    }

    /// Move value from a custodial account to an external address.
    #[tracing::instrument(skip_all, fields(sender = %sender.handle(), to = %to, amount = %amount, token = %token))]
    pub async fn withdraw(
        &self,
        sender: &Account,
        to: Address,
        amount: Amount,
        token: Token,
    ) -> Result<Settlement, TransferError> {
        self.transfer(sender, to, amount, token).await
    }

    async fn transfer(
        &self,
        sender: &Account,
        to: Address,
        amount: Amount,
        token: Token,
    ) -> Result<Settlement, TransferError> {
        let signer = self.custody.decrypt_signing_material(sender.wallet())?;
        let stored = sender.address();
        if signer.address() != stored {
            return Err(TransferError::AddressMismatch {
                derived: signer.address(),
                stored,
            });
        }

        let request = TransferRequest {
            from: stored,
            to,
            amount,
            token,
        };
        let fee = self.chain.quote_fee(&request).await?;
        self.check_balances(&request, &fee).await?;

        let settlement = self
            .chain
            .submit_and_await_settlement(signer, &request, fee, self.settlement_timeout)
            .await?;
        if settlement.confirmed {
            info!(reference = %settlement.reference, "Transfer settled");
        } else {
            warn!(reference = %settlement.reference, "Transfer submitted but unconfirmed");
        }
        Ok(settlement)
    }

    async fn check_balances(
        &self,
        request: &TransferRequest,
        fee: &FeeQuote,
    ) -> Result<(), TransferError> {
        let fee_total = fee.total();
        let native = self.chain.balance(request.from, Token::Bnb).await?;

        if request.token.is_native() {
            let required = request.amount.base_units().saturating_add(fee_total);
            if native < required {
                return Err(TransferError::InsufficientBalance {
                    token: request.token,
                    available: Amount::from_base_units(native),
                    required: Amount::from_base_units(required),
                });
            }
            return Ok(());
        }

        let held = self.chain.balance(request.from, request.token).await?;
        if held < request.amount.base_units() {
            return Err(TransferError::InsufficientBalance {
                token: request.token,
                available: Amount::from_base_units(held),
                required: request.amount,
            });
        }
        if native < fee_total {
            return Err(TransferError::InsufficientFee {
                available: Amount::from_base_units(native),
                required: Amount::from_base_units(fee_total),
            });
        }
        Ok(())
    }
}
