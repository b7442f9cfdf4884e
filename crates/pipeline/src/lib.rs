pub mod batcher;
pub mod claims;
pub mod clock;
pub mod cycle;
pub mod dispatcher;
pub mod executor;
pub mod intake;
pub mod ledger;
pub mod parser;
pub mod replies;
pub mod resolver;
pub mod wallet;
pub mod wiring;

#[cfg(test)]
mod tests;

pub use claims::{ClaimError, ClaimService};
pub use clock::{Clock, ManualClock, SystemClock};
pub use cycle::{Pipeline, PipelineConfig, PollReport};
pub use dispatcher::{DispatchOutcome, DispatchPolicy, ReplyDispatcher, SweepReport};
pub use wallet::{WalletBalance, WalletError, WalletService, Withdrawal};
pub use wiring::{Services, build_services};
