use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use solana_sdk::{pubkey::Pubkey, signature::Keypair};
use std::str::FromStr;
use std::time::Duration;

use crate::{
    error::{AppError, AppResult},
    execution::{AccountTier, ConfirmationSettings, FeePolicy, RoutingPolicy},
    funding::{FundingSettings, TopUpSource},
    retry::BackoffPolicy,
};

/// Cluster the keeper operates on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Devnet,
    Testnet,
    Localnet,
}

impl Network {
    pub fn default_rpc_url(self) -> &'static str {
        match self {
            Network::Mainnet => "https://api.mainnet-beta.solana.com",
            Network::Devnet => "https://api.devnet.solana.com",
            Network::Testnet => "https://api.testnet.solana.com",
            Network::Localnet => "http://127.0.0.1:8899",
        }
    }

    /// SECURITY: the faucet primitive must never be used against mainnet
    pub fn allows_airdrop(self) -> bool {
        !matches!(self, Network::Mainnet)
    }
}

/// What "executing" an eligible record means
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Keeper signs, pays and submits the execution itself
    AutoExecute,
    /// Keeper hands back unsigned per-heir claim transactions
    PrepareClaim,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

/// Keeper configuration.
///
/// Sources, lowest precedence first: optional `keeper.toml` (path from
/// `KEEPER_CONFIG`), then `KEEPER_*` environment variables. Nested fields
/// use a double underscore, e.g. `KEEPER_RETRY__MAX_ATTEMPTS`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KeeperConfig {
    pub network: Network,
    /// Overrides the network's default endpoint
    pub rpc_url: Option<String>,
    /// Submission endpoint for the enhanced route
    pub enhanced_rpc_url: Option<String>,
    /// Remote transaction builder; the enhanced route degrades without it
    pub builder_url: Option<String>,
    pub builder_timeout_ms: u64,
    pub program_id: String,
    /// Operating keypair: inline JSON byte array or path to a keypair file
    pub keypair: Option<String>,
    pub treasury_keypair: Option<String>,

    pub poll_interval_secs: u64,
    pub batch_size: usize,
    pub concurrency: usize,
    /// Explicit record accounts to monitor; empty means discover all
    pub targets: Vec<String>,
    pub execution_mode: ExecutionMode,
    pub account_tier: AccountTier,

    pub min_operating_balance_lamports: u64,
    pub top_up_amount_lamports: u64,
    pub top_up_source: TopUpSource,
    pub top_up_max_attempts: u32,
    pub funding_cooldown_secs: u64,

    pub retry: BackoffPolicy,
    pub record_timeout_secs: u64,
    pub cycle_deadline_secs: u64,
    pub launch_stagger_ms: u64,
    pub claim_refresh_secs: u64,
    pub pending_signature_ttl_secs: u64,
    pub confirmation_timeout_secs: u64,
    pub confirmation_poll_ms: u64,

    pub compute_unit_limit: u32,
    pub low_compute_unit_price: u64,
    pub normal_compute_unit_price: u64,
    pub high_compute_unit_price: u64,
    pub fee_escalation_multiplier: f64,
    pub max_compute_unit_price: u64,
    pub high_value_threshold_sol: Decimal,

    /// Operator status API; disabled when unset
    pub status_bind_address: Option<String>,
    pub log_format: LogFormat,
    /// Log destination; stdout when unset
    pub log_file: Option<String>,
}

impl Default for KeeperConfig {
    fn default() -> Self {
        let fees = FeePolicy::default();
        Self {
            network: Network::Devnet,
            rpc_url: None,
            enhanced_rpc_url: None,
            builder_url: None,
            builder_timeout_ms: 5_000,
            program_id: String::new(),
            keypair: None,
            treasury_keypair: None,
            poll_interval_secs: 60,
            batch_size: 50,
            concurrency: 5,
            targets: Vec::new(),
            execution_mode: ExecutionMode::AutoExecute,
            account_tier: AccountTier::Free,
            min_operating_balance_lamports: 50_000_000,
            top_up_amount_lamports: 1_000_000_000,
            top_up_source: TopUpSource::Airdrop,
            top_up_max_attempts: 3,
            funding_cooldown_secs: 300,
            retry: BackoffPolicy::default(),
            record_timeout_secs: 90,
            cycle_deadline_secs: 300,
            launch_stagger_ms: 200,
            claim_refresh_secs: 60,
            pending_signature_ttl_secs: 120,
            confirmation_timeout_secs: 45,
            confirmation_poll_ms: 1_000,
            compute_unit_limit: fees.compute_unit_limit,
            low_compute_unit_price: fees.low_compute_unit_price,
            normal_compute_unit_price: fees.normal_compute_unit_price,
            high_compute_unit_price: fees.high_compute_unit_price,
            fee_escalation_multiplier: fees.escalation_multiplier,
            max_compute_unit_price: fees.max_compute_unit_price,
            high_value_threshold_sol: dec!(100),
            status_bind_address: None,
            log_format: LogFormat::Text,
            log_file: None,
        }
    }
}

impl KeeperConfig {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let path = std::env::var("KEEPER_CONFIG").unwrap_or_else(|_| "keeper".to_string());

        config::Config::builder()
            .add_source(config::File::with_name(&path).required(false))
            .add_source(
                config::Environment::with_prefix("KEEPER")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("targets")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    pub fn validate(&self) -> AppResult<()> {
        let invalid = |msg: &str| Err(AppError::Config(msg.to_string()));

        if self.batch_size == 0 {
            return invalid("batch_size must be positive");
        }
        if self.concurrency == 0 || self.concurrency >= self.batch_size {
            return invalid("concurrency must be positive and smaller than batch_size");
        }
        if self.poll_interval_secs == 0 {
            return invalid("poll_interval_secs must be positive");
        }
        if self.retry.max_attempts == 0 || self.top_up_max_attempts == 0 {
            return invalid("attempt budgets must be positive");
        }
        if self.record_timeout_secs == 0
            || self.cycle_deadline_secs == 0
            || self.confirmation_timeout_secs == 0
            || self.confirmation_poll_ms == 0
        {
            return invalid("timeouts must be positive");
        }
        if self.record_timeout_secs <= self.confirmation_timeout_secs {
            return invalid("record_timeout_secs must exceed confirmation_timeout_secs");
        }
        if self.fee_escalation_multiplier < 1.0 {
            return invalid("fee_escalation_multiplier must be at least 1.0");
        }
        // The reserve absorbs the one record a funding chunk may overrun by
        if self.min_operating_balance_lamports
            < self.fee_policy().worst_case_exposure(self.retry.max_attempts)
        {
            return invalid(
                "min_operating_balance_lamports must cover every attempt of one record at the maximum fee",
            );
        }
        if self.top_up_source == TopUpSource::Airdrop && !self.network.allows_airdrop() {
            return invalid("airdrop top-up is not available on mainnet");
        }
        if self.top_up_source == TopUpSource::Treasury && self.treasury_keypair.is_none() {
            return invalid("treasury top-up requires treasury_keypair");
        }

        self.program_id()?;
        self.target_addresses()?;
        Ok(())
    }

    pub fn rpc_url(&self) -> String {
        self.rpc_url
            .clone()
            .unwrap_or_else(|| self.network.default_rpc_url().to_string())
    }

    pub fn program_id(&self) -> AppResult<Pubkey> {
        if self.program_id.is_empty() {
            return Err(AppError::Config("program_id is required".to_string()));
        }
        Pubkey::from_str(&self.program_id)
            .map_err(|e| AppError::Config(format!("invalid program_id: {}", e)))
    }

    pub fn target_addresses(&self) -> AppResult<Vec<Pubkey>> {
        self.targets
            .iter()
            .filter(|t| !t.trim().is_empty())
            .map(|t| {
                Pubkey::from_str(t.trim())
                    .map_err(|e| AppError::Config(format!("invalid target {}: {}", t, e)))
            })
            .collect()
    }

    pub fn discover_all(&self) -> bool {
        self.targets.iter().all(|t| t.trim().is_empty())
    }

    pub fn keeper_keypair(&self) -> AppResult<Keypair> {
        match &self.keypair {
            Some(source) => parse_keypair(source),
            None => Err(AppError::Config("keypair is required".to_string())),
        }
    }

    pub fn treasury_keypair(&self) -> AppResult<Option<Keypair>> {
        self.treasury_keypair.as_deref().map(parse_keypair).transpose()
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.retry.clone()
    }

    pub fn fee_policy(&self) -> FeePolicy {
        FeePolicy {
            compute_unit_limit: self.compute_unit_limit,
            low_compute_unit_price: self.low_compute_unit_price,
            normal_compute_unit_price: self.normal_compute_unit_price,
            high_compute_unit_price: self.high_compute_unit_price,
            escalation_multiplier: self.fee_escalation_multiplier,
            max_compute_unit_price: self.max_compute_unit_price,
        }
    }

    pub fn routing_policy(&self) -> RoutingPolicy {
        RoutingPolicy {
            high_value_threshold_sol: self.high_value_threshold_sol,
        }
    }

    pub fn confirmation_settings(&self) -> ConfirmationSettings {
        ConfirmationSettings {
            timeout: Duration::from_secs(self.confirmation_timeout_secs),
            poll_interval: Duration::from_millis(self.confirmation_poll_ms),
        }
    }

    pub fn funding_settings(&self) -> FundingSettings {
        FundingSettings {
            minimum_balance: self.min_operating_balance_lamports,
            top_up_amount: self.top_up_amount_lamports,
            backoff: self.retry.clone().with_max_attempts(self.top_up_max_attempts),
            airdrop_allowed: self.network.allows_airdrop(),
            settle_checks: 5,
            settle_interval: Duration::from_secs(2),
        }
    }
}

/// Keypair from an inline JSON byte array or a keypair file path
fn parse_keypair(source: &str) -> AppResult<Keypair> {
    let trimmed = source.trim();
    let json = if trimmed.starts_with('[') {
        trimmed.to_string()
    } else {
        std::fs::read_to_string(trimmed)
            .map_err(|e| AppError::Config(format!("cannot read keypair file {}: {}", trimmed, e)))?
    };

    let bytes: Vec<u8> = serde_json::from_str(&json)
        .map_err(|e| AppError::Config(format!("keypair is not a JSON byte array: {}", e)))?;

    Keypair::try_from(bytes.as_slice())
        .map_err(|e| AppError::Config(format!("invalid keypair bytes: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_sdk::signature::Signer;

    fn valid() -> KeeperConfig {
        KeeperConfig {
            program_id: Pubkey::new_unique().to_string(),
            ..KeeperConfig::default()
        }
    }

    #[test]
    fn test_defaults_validate() {
        assert!(valid().validate().is_ok());
        assert!(valid().discover_all());
        assert_eq!(valid().rpc_url(), "https://api.devnet.solana.com");
    }

    #[test]
    fn test_concurrency_must_be_below_batch_size() {
        let config = KeeperConfig {
            concurrency: 50,
            ..valid()
        };
        assert!(config.validate().is_err());

        let config = KeeperConfig {
            concurrency: 0,
            ..valid()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_values_rejected() {
        assert!(KeeperConfig { batch_size: 0, ..valid() }.validate().is_err());
        assert!(KeeperConfig { poll_interval_secs: 0, ..valid() }.validate().is_err());
        assert!(KeeperConfig { record_timeout_secs: 0, ..valid() }.validate().is_err());

        let mut config = valid();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reserve_must_cover_one_record() {
        // 3 attempts * 2 submissions * 205_000 lamports
        let config = KeeperConfig {
            min_operating_balance_lamports: 1_229_999,
            ..valid()
        };
        assert!(config.validate().is_err());

        let config = KeeperConfig {
            min_operating_balance_lamports: 1_230_000,
            ..valid()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_pubkeys_rejected() {
        assert!(KeeperConfig::default().validate().is_err());
        let config = KeeperConfig {
            targets: vec!["not-a-key".to_string()],
            ..valid()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_airdrop_refused_on_mainnet() {
        let config = KeeperConfig {
            network: Network::Mainnet,
            ..valid()
        };
        assert!(config.validate().is_err());

        let config = KeeperConfig {
            network: Network::Mainnet,
            top_up_source: TopUpSource::Disabled,
            ..valid()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_inline_keypair() {
        let keypair = Keypair::new();
        let json = serde_json::to_string(&keypair.to_bytes().to_vec()).unwrap();
        let config = KeeperConfig {
            keypair: Some(json),
            ..valid()
        };
        assert_eq!(config.keeper_keypair().unwrap().pubkey(), keypair.pubkey());
    }

    #[test]
    fn test_layered_sources_fill_defaults() {
        let target = Pubkey::new_unique().to_string();
        let config: KeeperConfig = config::Config::builder()
            .set_override("batch_size", 20)
            .unwrap()
            .set_override("targets", vec![target.clone()])
            .unwrap()
            .set_override("execution_mode", "prepare_claim")
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.batch_size, 20);
        assert_eq!(config.concurrency, 5);
        assert_eq!(config.execution_mode, ExecutionMode::PrepareClaim);
        assert_eq!(config.targets, vec![target]);
        assert!(!config.discover_all());
        assert_eq!(config.retry.max_attempts, 3);
    }
}
