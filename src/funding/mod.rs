// Funding guard - keeps the keeper's fee-paying account solvent
//
// The operating balance is shared by every execution in a batch, so the
// guard is consulted once per batch (and once per funding chunk), never
// per record.

use serde::{Deserialize, Serialize};
use solana_sdk::{
    instruction::{AccountMeta, Instruction},
    pubkey::Pubkey,
    signature::{Keypair, Signer},
    transaction::Transaction,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::{
    error::FundingError,
    ledger::{client::SubmitOptions, models::lamports_to_sol, LedgerClient},
    retry::BackoffPolicy,
};

const SYSTEM_TRANSFER: u32 = 2;

/// Where top-up lamports come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopUpSource {
    /// Cluster faucet; non-production clusters only
    Airdrop,
    /// Transfer from a separately configured treasury key
    Treasury,
    Disabled,
}

/// Resolved top-up strategy
pub enum TopUp {
    Airdrop,
    Treasury(Arc<Keypair>),
    Disabled,
}

#[derive(Debug, Clone)]
pub struct FundingSettings {
    pub minimum_balance: u64,
    pub top_up_amount: u64,
    /// Bounds the number of top-up requests per `top_up()` call
    pub backoff: BackoffPolicy,
    pub airdrop_allowed: bool,
    /// Balance re-checks after a top-up; funds land asynchronously
    pub settle_checks: u32,
    pub settle_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FundingStatus {
    pub balance: u64,
    pub minimum: u64,
    pub sufficient: bool,
}

/// System program transfer, encoded by hand
pub fn system_transfer(from: &Pubkey, to: &Pubkey, lamports: u64) -> Instruction {
    let mut data = Vec::with_capacity(12);
    data.extend_from_slice(&SYSTEM_TRANSFER.to_le_bytes());
    data.extend_from_slice(&lamports.to_le_bytes());

    Instruction {
        program_id: Pubkey::new_from_array([0u8; 32]),
        accounts: vec![AccountMeta::new(*from, true), AccountMeta::new(*to, false)],
        data,
    }
}

/// How many records may run against one funding check.
///
/// `record_exposure` is the most one record can spend across all of its
/// attempts. Worst-case consumption `k * record_exposure` never exceeds the
/// headroom above the minimum by more than one record's exposure, which the
/// configured minimum balance covers.
pub fn chunk_size(balance: u64, minimum: u64, record_exposure: u64, concurrency: usize) -> usize {
    let headroom = balance.saturating_sub(minimum);
    let affordable = (headroom / record_exposure.max(1)).saturating_add(1);
    let affordable = usize::try_from(affordable).unwrap_or(usize::MAX);
    affordable.min(concurrency).max(1)
}

pub struct FundingGuard {
    ledger: Arc<dyn LedgerClient>,
    account: Pubkey,
    top_up: TopUp,
    settings: FundingSettings,
}

impl FundingGuard {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        account: Pubkey,
        top_up: TopUp,
        settings: FundingSettings,
    ) -> Self {
        Self {
            ledger,
            account,
            top_up,
            settings,
        }
    }

    pub fn account(&self) -> &Pubkey {
        &self.account
    }

    pub fn minimum_balance(&self) -> u64 {
        self.settings.minimum_balance
    }

    pub async fn check_balance(&self) -> Result<FundingStatus, FundingError> {
        let balance = self
            .ledger
            .get_balance(&self.account)
            .await
            .map_err(|e| FundingError::BalanceUnavailable(e.to_string()))?;

        Ok(FundingStatus {
            balance,
            minimum: self.settings.minimum_balance,
            sufficient: balance >= self.settings.minimum_balance,
        })
    }

    /// Request more lamports, bounded by the backoff policy's attempt budget
    pub async fn top_up(&self) -> Result<(), FundingError> {
        let amount = self.settings.top_up_amount;

        match &self.top_up {
            TopUp::Disabled => {
                return Err(FundingError::TopUpUnavailable(
                    "no top-up source configured".to_string(),
                ))
            }
            TopUp::Airdrop if !self.settings.airdrop_allowed => {
                return Err(FundingError::TopUpUnavailable(
                    "airdrops are not available on this network".to_string(),
                ))
            }
            _ => {}
        }

        info!(
            "💧 Topping up operating account {} with {} SOL",
            self.account,
            lamports_to_sol(amount)
        );

        self.settings
            .backoff
            .retry(
                "top_up",
                |_| self.request_top_up(amount),
                |e: &FundingError| matches!(e, FundingError::TopUpFailed(_)),
            )
            .await
    }

    async fn request_top_up(&self, amount: u64) -> Result<(), FundingError> {
        match &self.top_up {
            TopUp::Airdrop => {
                let signature = self
                    .ledger
                    .request_airdrop(&self.account, amount)
                    .await
                    .map_err(|e| FundingError::TopUpFailed(e.to_string()))?;
                info!("✓ Airdrop requested: {}", signature);
                Ok(())
            }
            TopUp::Treasury(treasury) => {
                let blockhash = self
                    .ledger
                    .latest_blockhash()
                    .await
                    .map_err(|e| FundingError::TopUpFailed(e.to_string()))?;

                let instruction = system_transfer(&treasury.pubkey(), &self.account, amount);
                let transaction = Transaction::new_signed_with_payer(
                    &[instruction],
                    Some(&treasury.pubkey()),
                    &[&**treasury],
                    blockhash,
                );

                let signature = self
                    .ledger
                    .submit_transaction(&transaction, SubmitOptions::default())
                    .await
                    .map_err(|e| FundingError::TopUpFailed(e.to_string()))?;
                info!("✓ Treasury transfer submitted: {}", signature);
                Ok(())
            }
            TopUp::Disabled => Err(FundingError::TopUpUnavailable(
                "no top-up source configured".to_string(),
            )),
        }
    }

    /// Check, top up if needed, re-check.
    ///
    /// Returns the observed balance, or the fatal `Underfunded` error when
    /// the account is still below the minimum.
    pub async fn ensure_funded(&self) -> Result<u64, FundingError> {
        let status = self.check_balance().await?;
        if status.sufficient {
            return Ok(status.balance);
        }

        warn!(
            "⚠️ Operating account {} below minimum: {} < {} lamports",
            self.account, status.balance, status.minimum
        );

        match self.top_up().await {
            Ok(()) => {
                for check in 0..self.settings.settle_checks.max(1) {
                    if check > 0 {
                        tokio::time::sleep(self.settings.settle_interval).await;
                    }
                    let status = self.check_balance().await?;
                    if status.sufficient {
                        info!("✓ Operating account funded: {} lamports", status.balance);
                        return Ok(status.balance);
                    }
                }
            }
            Err(e) => error!("❌ Top-up failed: {}", e),
        }

        let balance = self.check_balance().await.map(|s| s.balance).unwrap_or(status.balance);
        Err(FundingError::Underfunded {
            account: self.account,
            balance,
            minimum: self.settings.minimum_balance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::mock::MockLedger;
    use std::sync::atomic::Ordering;

    fn settings(airdrop_allowed: bool) -> FundingSettings {
        FundingSettings {
            minimum_balance: 1_000_000,
            top_up_amount: 5_000_000,
            backoff: BackoffPolicy {
                max_attempts: 3,
                base_delay_ms: 10,
                jitter: 0.0,
                ..BackoffPolicy::default()
            },
            airdrop_allowed,
            settle_checks: 2,
            settle_interval: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_system_transfer_encoding() {
        let from = Pubkey::new_unique();
        let to = Pubkey::new_unique();
        let ix = system_transfer(&from, &to, 42);
        assert_eq!(ix.program_id.to_string(), "11111111111111111111111111111111");
        assert_eq!(&ix.data[..4], &[2, 0, 0, 0]);
        assert_eq!(u64::from_le_bytes(ix.data[4..].try_into().unwrap()), 42);
        assert!(ix.accounts[0].is_signer);
    }

    #[test]
    fn test_chunk_size_bounds_fee_exposure() {
        // no headroom: exactly one record may dip into the reserve
        assert_eq!(chunk_size(1_000, 1_000, 100, 8), 1);
        assert_eq!(chunk_size(1_350, 1_000, 100, 8), 4);
        assert_eq!(chunk_size(u64::MAX, 0, 1, 8), 8);
        assert_eq!(chunk_size(0, 1_000, 100, 8), 1);
    }

    #[tokio::test]
    async fn test_sufficient_balance_needs_no_top_up() {
        let ledger = Arc::new(MockLedger::new());
        let account = Pubkey::new_unique();
        ledger.set_balance(account, 2_000_000);
        let guard = FundingGuard::new(ledger.clone(), account, TopUp::Airdrop, settings(true));

        assert_eq!(guard.ensure_funded().await.unwrap(), 2_000_000);
        assert_eq!(ledger.airdrops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_airdrop_restores_balance() {
        let ledger = Arc::new(MockLedger::new());
        let account = Pubkey::new_unique();
        let guard = FundingGuard::new(ledger.clone(), account, TopUp::Airdrop, settings(true));

        assert_eq!(guard.ensure_funded().await.unwrap(), 5_000_000);
        assert_eq!(ledger.airdrops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_top_up_is_fatal() {
        let ledger = Arc::new(MockLedger::new());
        let account = Pubkey::new_unique();
        ledger.set_balance(account, 10);
        *ledger.airdrop_fails.lock() = true;
        let guard = FundingGuard::new(ledger.clone(), account, TopUp::Airdrop, settings(true));

        let err = guard.ensure_funded().await.unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, FundingError::Underfunded { balance: 10, .. }));
        // bounded by the attempt budget
        assert_eq!(ledger.airdrops.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_airdrop_refused_on_production_network() {
        let ledger = Arc::new(MockLedger::new());
        let guard = FundingGuard::new(
            ledger.clone(),
            Pubkey::new_unique(),
            TopUp::Airdrop,
            settings(false),
        );

        assert!(matches!(
            guard.top_up().await,
            Err(FundingError::TopUpUnavailable(_))
        ));
        assert!(guard.ensure_funded().await.unwrap_err().is_fatal());
        assert_eq!(ledger.airdrops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_treasury_transfer_is_signed_by_treasury() {
        let ledger = Arc::new(MockLedger::new());
        let treasury = Arc::new(Keypair::new());
        let account = Pubkey::new_unique();
        let guard = FundingGuard::new(
            ledger.clone(),
            account,
            TopUp::Treasury(treasury.clone()),
            settings(false),
        );

        guard.top_up().await.unwrap();
        let submitted = ledger.submitted.lock();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].message.account_keys[0], treasury.pubkey());
        assert!(submitted[0].message.account_keys.contains(&account));
    }
}
