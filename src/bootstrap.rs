use solana_sdk::signature::Signer;
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

use crate::{
    api::handler::AppState,
    config::KeeperConfig,
    error::AppResult,
    execution::{DeliveryRouter, HttpOptimizer, KeypairSigner},
    funding::{FundingGuard, TopUp, TopUpSource},
    keeper::{Keeper, KeeperSettings},
    ledger::{InheritanceProgram, LedgerClient, RpcLedgerClient},
};

/// Wire every keeper component from a validated configuration
pub fn initialize_keeper(config: &KeeperConfig) -> AppResult<AppState> {
    info!("Initializing keeper components ...");

    let client = RpcLedgerClient::new(config.rpc_url());
    info!("✅ Ledger client ready: {} ({:?})", client.url(), config.network);
    let ledger: Arc<dyn LedgerClient> = Arc::new(client);

    let program = InheritanceProgram::new(config.program_id()?);
    info!("✅ Inheritance program: {}", program.program_id());

    let keypair = Arc::new(config.keeper_keypair()?);
    let operating_account = keypair.pubkey();
    info!("🔑 Operating account: {}", operating_account);

    let mut router = DeliveryRouter::new(
        ledger.clone(),
        Arc::new(KeypairSigner::new(keypair)),
        config.routing_policy(),
        config.fee_policy(),
        config.backoff(),
        config.confirmation_settings(),
    );

    match &config.builder_url {
        Some(url) => {
            let optimizer =
                HttpOptimizer::new(url.clone(), Duration::from_millis(config.builder_timeout_ms))?;
            router = router.with_optimizer(Arc::new(optimizer));
            info!("✅ Transaction builder registered: {}", url);
        }
        None => warn!("⚠️  No transaction builder configured - enhanced route degrades to standard"),
    }

    if let Some(url) = &config.enhanced_rpc_url {
        router = router.with_enhanced_ledger(Arc::new(RpcLedgerClient::new(url.clone())));
        info!("✅ Enhanced submission endpoint: {}", url);
    }

    let top_up = match config.top_up_source {
        TopUpSource::Airdrop => TopUp::Airdrop,
        TopUpSource::Treasury => match config.treasury_keypair()? {
            Some(treasury) => TopUp::Treasury(Arc::new(treasury)),
            None => TopUp::Disabled,
        },
        TopUpSource::Disabled => TopUp::Disabled,
    };
    let funding = FundingGuard::new(
        ledger.clone(),
        operating_account,
        top_up,
        config.funding_settings(),
    );

    let settings = KeeperSettings::from_config(config)?;
    info!(
        "⚙️  Mode {:?}, batch {}, concurrency {}, {}",
        settings.mode,
        settings.batch_size,
        settings.concurrency,
        if settings.targets.is_empty() {
            "discovering all records".to_string()
        } else {
            format!("{} explicit targets", settings.targets.len())
        }
    );

    let keeper = Keeper::new(settings, ledger, program, router, funding);

    Ok(AppState {
        keeper,
        operating_account,
    })
}
