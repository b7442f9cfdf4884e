use std::time::Duration;

use alloy::network::{ReceiptResponse, TransactionBuilder};
use alloy::primitives::{Address, TxHash, U256};
use alloy::providers::Provider;
use alloy::rpc::types::TransactionRequest;
use alloy::sol_types::SolCall;
use alloy::transports::http::reqwest::Url;
use async_trait::async_trait;
use quasar_core::Token;
use tracing::{debug, info, warn};

use crate::abi::IERC20;
use crate::provider::{BscProvider, create_signing_provider};
use crate::transfer::{ChainError, FeeQuote, Settlement, TransferRequest, ValueTransfer};
use crate::PrivateKeySigner;

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// [`ValueTransfer`] over a JSON-RPC endpoint.
pub struct RpcTransfer {
    rpc_url: Url,
    provider: BscProvider,
    usdc: Address,
}

fn rpc_err(err: impl std::fmt::Display) -> ChainError {
    ChainError::Rpc(err.to_string())
}

impl RpcTransfer {
    pub fn new(rpc_url: &str, usdc: Address) -> eyre::Result<Self> {
        let rpc_url: Url = rpc_url.parse()?;
        let provider = crate::provider::create_provider(rpc_url.as_str())?;
        Ok(Self {
            rpc_url,
            provider,
            usdc,
        })
    }

    /// Unsigned transaction for `request`, without gas fields.
    pub(crate) fn transaction_for(&self, request: &TransferRequest) -> TransactionRequest {
        let amount = request.amount.base_units();
        let tx = TransactionRequest::default().with_from(request.from);
        match request.token {
            Token::Bnb => tx.with_to(request.to).with_value(amount),
            Token::Usdc => {
                let call = IERC20::transferCall {
                    to: request.to,
                    amount,
                };
                tx.with_to(self.usdc).with_input(call.abi_encode())
            }
        }
    }

    /// Poll until a receipt appears; returns its execution status.
    /// Transient RPC errors keep the poll going, the caller bounds the wait.
    async fn await_receipt(&self, hash: TxHash) -> bool {
        loop {
            match self.provider.get_transaction_receipt(hash).await {
                Ok(Some(receipt)) => return receipt.status(),
                Ok(None) => debug!(tx = %hash, "Receipt not available yet"),
                Err(e) => warn!(tx = %hash, error = %e, "Receipt lookup failed, retrying"),
            }
            tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl ValueTransfer for RpcTransfer {
    async fn quote_fee(&self, request: &TransferRequest) -> Result<FeeQuote, ChainError> {
        let tx = self.transaction_for(request);
        let gas_limit = self.provider.estimate_gas(tx).await.map_err(rpc_err)?;
        let gas_price = self.provider.get_gas_price().await.map_err(rpc_err)?;
        Ok(FeeQuote {
            gas_limit,
            gas_price,
        })
    }

    async fn balance(&self, owner: Address, token: Token) -> Result<U256, ChainError> {
        match token {
            Token::Bnb => self.provider.get_balance(owner).await.map_err(rpc_err),
            Token::Usdc => IERC20::new(self.usdc, &self.provider)
                .balanceOf(owner)
                .call()
                .await
                .map_err(rpc_err),
        }
    }

    async fn submit_and_await_settlement(
        &self,
        signer: PrivateKeySigner,
        request: &TransferRequest,
        fee: FeeQuote,
        timeout: Duration,
    ) -> Result<Settlement, ChainError> {
        let provider = create_signing_provider(&self.rpc_url, signer);
        let tx = self
            .transaction_for(request)
            .with_gas_limit(fee.gas_limit)
            .with_gas_price(fee.gas_price);

        let pending = provider.send_transaction(tx).await.map_err(rpc_err)?;
        let hash = *pending.tx_hash();
        let reference = format!("{hash:#x}");
        info!(tx = %reference, token = %request.token, "Transfer submitted");

        match tokio::time::timeout(timeout, self.await_receipt(hash)).await {
            Ok(true) => Ok(Settlement {
                reference,
                confirmed: true,
            }),
            Ok(false) => Err(ChainError::Reverted { reference }),
            Err(_) => {
                warn!(tx = %reference, ?timeout, "Settlement not confirmed before timeout");
                Ok(Settlement {
                    reference,
                    confirmed: false,
                })
            }
        }
    }
}
