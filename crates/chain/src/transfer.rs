use std::time::Duration;

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use quasar_core::{Amount, Token};
use thiserror::Error;

use crate::PrivateKeySigner;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("RPC error: {0}")]
    Rpc(String),

    /// The transaction was mined but its execution failed.
    #[error("transaction {reference} reverted")]
    Reverted { reference: String },
}

/// One value movement between two custodial addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub from: Address,
    pub to: Address,
    pub amount: Amount,
    pub token: Token,
}

/// Gas the network will charge for a transfer, paid in the native asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeQuote {
    pub gas_limit: u64,
    pub gas_price: u128,
}

impl FeeQuote {
    pub fn total(&self) -> U256 {
        U256::from(self.gas_limit).saturating_mul(U256::from(self.gas_price))
    }
}

/// Result of a submitted transfer.
///
/// `confirmed == false` means the wait timed out before a receipt appeared.
/// The transfer may still land; callers must not resubmit it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub reference: String,
    pub confirmed: bool,
}

/// The on-chain primitive the transfer executor builds on.
#[async_trait]
pub trait ValueTransfer: Send + Sync {
    async fn quote_fee(&self, request: &TransferRequest) -> Result<FeeQuote, ChainError>;

    /// Balance of `owner` in `token` base units.
    async fn balance(&self, owner: Address, token: Token) -> Result<U256, ChainError>;

    /// Sign, submit once, and wait up to `timeout` for a receipt.
    async fn submit_and_await_settlement(
        &self,
        signer: PrivateKeySigner,
        request: &TransferRequest,
        fee: FeeQuote,
        timeout: Duration,
    ) -> Result<Settlement, ChainError>;
}
