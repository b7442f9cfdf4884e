use std::sync::Arc;
use std::time::Duration;

use eyre::{WrapErr, eyre};
use quasar_chain::{AesCustody, Custody, RpcTransfer, ValueTransfer};
use quasar_core::{Address, Handle, Settings};
use quasar_social::{
    EventSource, OperatorNotifier, ReplyChannel, TelegramNotifier, XClient, XClientConfig,
};
use quasar_storage::{PgPool, PgStore, TipStore};
use tracing::info;

use crate::claims::ClaimService;
use crate::clock::{Clock, SystemClock};
use crate::cycle::{Pipeline, PipelineConfig};
use crate::dispatcher::{DispatchPolicy, ReplyDispatcher};
use crate::executor::TransferExecutor;
use crate::parser::CommandParser;
use crate::replies::ReplyUrls;
use crate::resolver::AccountResolver;
use crate::wallet::WalletService;

/// Everything a binary needs, built once at startup.
#[derive(Clone)]
pub struct Services {
    pub pipeline: Arc<Pipeline>,
    pub claims: Arc<ClaimService>,
    pub wallets: Arc<WalletService>,
    pub store: Arc<dyn TipStore>,
}

pub fn build_services(settings: &Settings, pool: PgPool) -> eyre::Result<Services> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store: Arc<dyn TipStore> = Arc::new(PgStore::new(pool));

    let master_key = settings
        .encryption_key
        .as_deref()
        .ok_or_else(|| eyre!("ENCRYPTION_KEY must be set"))?;
    let custody: Arc<dyn Custody> = Arc::new(AesCustody::new(master_key)?);

    let usdc: Address = settings
        .usdc_address
        .parse()
        .wrap_err("USDC_ADDRESS is not a valid address")?;
    let chain: Arc<dyn ValueTransfer> = Arc::new(RpcTransfer::new(&settings.rpc_url, usdc)?);

    let x = Arc::new(XClient::new(XClientConfig {
        api_base: settings.twitter_api_base.clone(),
        bearer_token: settings.twitter_bearer_token.clone(),
        user_token: settings.twitter_user_token.clone(),
        request_timeout: Duration::from_secs(15),
    })?);
    let source: Arc<dyn EventSource> = x.clone();
    let channels: Vec<Arc<dyn ReplyChannel>> = vec![x];

    let operator: Option<Arc<dyn OperatorNotifier>> =
        match (&settings.telegram_bot_token, &settings.telegram_chat_id) {
            (Some(token), Some(chat_id)) => {
                info!("Telegram operator fallback enabled");
                let notifier = TelegramNotifier::new(
                    &settings.telegram_api_base,
                    token,
                    chat_id,
                    &settings.explorer_tx_url,
                )?;
                Some(Arc::new(notifier))
            }
            _ => None,
        };

    let dispatcher = Arc::new(ReplyDispatcher::new(
        store.clone(),
        channels,
        operator,
        clock.clone(),
        DispatchPolicy {
            fallback_delay: chrono::Duration::seconds(settings.reply_fallback_delay_secs),
            lease: chrono::Duration::seconds(settings.reply_lease_secs),
            sweep_batch_size: settings.sweep_batch_size,
        },
    ));

    let bot_handle = Handle::parse(&settings.bot_handle)
        .ok_or_else(|| eyre!("BOT_HANDLE {:?} is not a valid handle", settings.bot_handle))?;
    let urls = ReplyUrls {
        explorer_tx_url: settings.explorer_tx_url.clone(),
        signup_url: settings.signup_url.clone(),
    };

    let settlement_timeout = Duration::from_secs(settings.settlement_timeout_secs);
    let pipeline = Pipeline::new(
        source,
        store.clone(),
        CommandParser::new(&bot_handle)?,
        AccountResolver::new(store.clone(), custody.clone(), clock.clone()),
        TransferExecutor::new(custody.clone(), chain.clone(), settlement_timeout),
        dispatcher.clone(),
        clock.clone(),
        PipelineConfig {
            query: settings.search_query.clone(),
            bot_handle,
            urls: urls.clone(),
        },
    );
    let wallets = WalletService::new(
        store.clone(),
        TransferExecutor::new(custody.clone(), chain.clone(), settlement_timeout),
        chain,
        clock.clone(),
    );
    let claims = ClaimService::new(store.clone(), custody, dispatcher, clock, urls);

    Ok(Services {
        pipeline: Arc::new(pipeline),
        claims: Arc::new(claims),
        wallets: Arc::new(wallets),
        store,
    })
}
