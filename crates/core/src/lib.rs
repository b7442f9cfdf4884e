pub mod config;
pub mod error;
pub mod telemetry;
pub mod types;

pub use config::Settings;
pub use error::AppError;
pub use types::{Address, Amount, AmountError, CustodialWallet, Handle, Token, U256};
