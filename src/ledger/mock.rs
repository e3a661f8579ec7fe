// In-memory ledger used by unit tests across the crate.

use async_trait::async_trait;
use parking_lot::Mutex;
use solana_hash::Hash;
use solana_sdk::{pubkey::Pubkey, signature::Signature, transaction::Transaction};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crate::{
    error::LedgerError,
    ledger::{
        client::{AccountFilter, AccountSnapshot, LedgerClient, SignatureState, SubmitOptions},
        models::InheritanceRecord,
        program::InheritanceProgram,
    },
};

#[derive(Default)]
pub struct MockLedger {
    pub accounts: Mutex<HashMap<Pubkey, AccountSnapshot>>,
    pub balances: Mutex<HashMap<Pubkey, u64>>,
    /// Scripted submit results, consumed front to back; empty means success
    pub submit_results: Mutex<VecDeque<Result<(), LedgerError>>>,
    pub submitted: Mutex<Vec<Transaction>>,
    pub submit_attempts: AtomicUsize,
    /// Holds every submission this long before answering
    pub submit_delay: Mutex<Option<Duration>>,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    /// Scripted signature statuses, consumed front to back
    pub statuses: Mutex<VecDeque<SignatureState>>,
    /// Returned once the scripted statuses run out
    pub default_status: Mutex<Option<SignatureState>>,
    pub status_polls: AtomicUsize,
    pub scan_error: Mutex<Option<LedgerError>>,
    pub airdrop_fails: Mutex<bool>,
    pub airdrops: AtomicUsize,
    pub balance_checks: AtomicUsize,
    blockhash_counter: AtomicU64,
}

impl MockLedger {
    pub fn new() -> Self {
        Self {
            default_status: Mutex::new(Some(SignatureState::Confirmed)),
            ..Default::default()
        }
    }

    pub fn put_record(&self, program: &InheritanceProgram, record: &InheritanceRecord) {
        self.accounts
            .lock()
            .insert(record.address, program.encode(record));
    }

    pub fn remove_account(&self, address: &Pubkey) {
        self.accounts.lock().remove(address);
    }

    pub fn set_balance(&self, address: Pubkey, lamports: u64) {
        self.balances.lock().insert(address, lamports);
    }

    pub fn script_submit(&self, result: Result<(), LedgerError>) {
        self.submit_results.lock().push_back(result);
    }

    pub fn script_status(&self, status: SignatureState) {
        self.statuses.lock().push_back(status);
    }

    pub fn set_default_status(&self, status: SignatureState) {
        *self.default_status.lock() = Some(status);
    }

    pub fn set_submit_delay(&self, delay: Duration) {
        *self.submit_delay.lock() = Some(delay);
    }

    pub fn balance_checks(&self) -> usize {
        self.balance_checks.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn submitted_count(&self) -> usize {
        self.submitted.lock().len()
    }

    pub fn attempts(&self) -> usize {
        self.submit_attempts.load(Ordering::SeqCst)
    }

    pub fn polls(&self) -> usize {
        self.status_polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    async fn fetch_account(&self, address: &Pubkey) -> Result<Option<AccountSnapshot>, LedgerError> {
        Ok(self.accounts.lock().get(address).cloned())
    }

    async fn fetch_accounts_by_filter(
        &self,
        _program_id: &Pubkey,
        filters: &[AccountFilter],
    ) -> Result<Vec<(Pubkey, AccountSnapshot)>, LedgerError> {
        if let Some(e) = self.scan_error.lock().clone() {
            return Err(e);
        }

        let accounts = self.accounts.lock();
        let mut matches: Vec<(Pubkey, AccountSnapshot)> = accounts
            .iter()
            .filter(|(_, account)| {
                filters.iter().all(|f| {
                    account
                        .data
                        .get(f.offset..f.offset + f.bytes.len())
                        .map(|slice| slice == f.bytes.as_slice())
                        .unwrap_or(false)
                })
            })
            .map(|(address, account)| (*address, account.clone()))
            .collect();
        matches.sort_by_key(|(address, _)| *address);
        Ok(matches)
    }

    async fn latest_blockhash(&self) -> Result<Hash, LedgerError> {
        let n = self.blockhash_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&n.to_le_bytes());
        Ok(Hash::new_from_array(bytes))
    }

    async fn get_balance(&self, address: &Pubkey) -> Result<u64, LedgerError> {
        self.balance_checks.fetch_add(1, Ordering::SeqCst);
        Ok(self.balances.lock().get(address).copied().unwrap_or(0))
    }

    async fn submit_transaction(
        &self,
        transaction: &Transaction,
        _options: SubmitOptions,
    ) -> Result<Signature, LedgerError> {
        self.submit_attempts.fetch_add(1, Ordering::SeqCst);

        let delay = *self.submit_delay.lock();
        if let Some(delay) = delay {
            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }

        let scripted = self.submit_results.lock().pop_front();
        if let Some(Err(e)) = scripted {
            return Err(e);
        }
        self.submitted.lock().push(transaction.clone());
        Ok(transaction.signatures.first().copied().unwrap_or_default())
    }

    async fn signature_status(&self, _signature: &Signature) -> Result<SignatureState, LedgerError> {
        self.status_polls.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = self.statuses.lock().pop_front() {
            return Ok(status);
        }
        Ok(self
            .default_status
            .lock()
            .clone()
            .unwrap_or(SignatureState::NotFound))
    }

    async fn request_airdrop(&self, address: &Pubkey, lamports: u64) -> Result<Signature, LedgerError> {
        self.airdrops.fetch_add(1, Ordering::SeqCst);
        if *self.airdrop_fails.lock() {
            return Err(LedgerError::rpc("airdrop request failed: 429 Too Many Requests"));
        }
        *self.balances.lock().entry(*address).or_insert(0) += lamports;
        Ok(Signature::default())
    }
}
