pub mod abi;
pub mod custody;
pub mod provider;
pub mod rpc;
pub mod transfer;

pub use abi::IERC20;
pub use alloy::signers::local::PrivateKeySigner;
pub use custody::{AesCustody, Custody, CustodyError};
pub use provider::{BscProvider, create_provider, create_signing_provider};
pub use rpc::RpcTransfer;
pub use transfer::{ChainError, FeeQuote, Settlement, TransferRequest, ValueTransfer};
