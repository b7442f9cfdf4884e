use alloy::network::EthereumWallet;
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::signers::local::PrivateKeySigner;
use alloy::transports::http::reqwest::Url;

/// The BNB Smart Chain RPC provider type used throughout the application.
///
/// Type-erased so read-only and signing providers share one type.
pub type BscProvider = DynProvider;

/// Create a read-only HTTP provider from an RPC URL string.
pub fn create_provider(rpc_url: &str) -> eyre::Result<BscProvider> {
    let url: Url = rpc_url.parse()?;
    Ok(ProviderBuilder::new().connect_http(url).erased())
}

/// Create a provider that fills nonce and chain id and signs with `signer`.
pub fn create_signing_provider(rpc_url: &Url, signer: PrivateKeySigner) -> BscProvider {
    ProviderBuilder::new()
        .wallet(EthereumWallet::from(signer))
        .connect_http(rpc_url.clone())
        .erased()
}
