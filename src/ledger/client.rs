use async_trait::async_trait;
use solana_client::{
    nonblocking::rpc_client::RpcClient,
    rpc_config::{RpcAccountInfoConfig, RpcProgramAccountsConfig, RpcSendTransactionConfig},
    rpc_filter::{Memcmp, RpcFilterType},
};
use solana_commitment_config::CommitmentConfig;
use solana_hash::Hash;
use solana_sdk::{pubkey::Pubkey, signature::Signature, transaction::Transaction};
use tracing::{debug, instrument};

use crate::error::LedgerError;

/// Raw account as returned by the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSnapshot {
    pub data: Vec<u8>,
    pub lamports: u64,
}

/// Byte-prefix filter applied during account enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountFilter {
    pub offset: usize,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitOptions {
    pub skip_preflight: bool,
    pub max_retries: Option<usize>,
}

/// Status of a submitted signature as seen by the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureState {
    /// The ledger has no record of the signature (yet, or ever)
    NotFound,
    /// Processed but not yet at confirmed commitment
    Pending,
    Confirmed,
    Finalized,
    /// The transaction landed and failed
    Failed(String),
}

impl SignatureState {
    pub fn is_success(&self) -> bool {
        matches!(self, SignatureState::Confirmed | SignatureState::Finalized)
    }
}

/// Ledger adapter - the only component that talks to the cluster
///
/// Implementations must be cheap to share behind an `Arc`.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Fetch one account; `None` when it does not exist (e.g. closed)
    async fn fetch_account(&self, address: &Pubkey) -> Result<Option<AccountSnapshot>, LedgerError>;

    /// Enumerate program accounts matching all filters
    async fn fetch_accounts_by_filter(
        &self,
        program_id: &Pubkey,
        filters: &[AccountFilter],
    ) -> Result<Vec<(Pubkey, AccountSnapshot)>, LedgerError>;

    async fn latest_blockhash(&self) -> Result<Hash, LedgerError>;

    async fn get_balance(&self, address: &Pubkey) -> Result<u64, LedgerError>;

    async fn submit_transaction(
        &self,
        transaction: &Transaction,
        options: SubmitOptions,
    ) -> Result<Signature, LedgerError>;

    async fn signature_status(&self, signature: &Signature) -> Result<SignatureState, LedgerError>;

    /// Funding primitive; only meaningful on non-production clusters
    async fn request_airdrop(&self, address: &Pubkey, lamports: u64) -> Result<Signature, LedgerError>;
}

/// JSON-RPC backed ledger client
pub struct RpcLedgerClient {
    client: RpcClient,
    url: String,
}

impl RpcLedgerClient {
    pub fn new(url: String) -> Self {
        let client = RpcClient::new_with_commitment(url.clone(), CommitmentConfig::confirmed());
        Self { client, url }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl LedgerClient for RpcLedgerClient {
    async fn fetch_account(&self, address: &Pubkey) -> Result<Option<AccountSnapshot>, LedgerError> {
        let response = self
            .client
            .get_account_with_commitment(address, CommitmentConfig::confirmed())
            .await
            .map_err(|e| LedgerError::rpc(format!("getAccountInfo {}: {}", address, e)))?;

        Ok(response.value.map(|account| AccountSnapshot {
            data: account.data,
            lamports: account.lamports,
        }))
    }

    #[instrument(skip(self, filters), fields(program = %program_id))]
    async fn fetch_accounts_by_filter(
        &self,
        program_id: &Pubkey,
        filters: &[AccountFilter],
    ) -> Result<Vec<(Pubkey, AccountSnapshot)>, LedgerError> {
        let config = RpcProgramAccountsConfig {
            filters: Some(
                filters
                    .iter()
                    .map(|f| RpcFilterType::Memcmp(Memcmp::new_base58_encoded(f.offset, &f.bytes)))
                    .collect(),
            ),
            account_config: RpcAccountInfoConfig {
                commitment: Some(CommitmentConfig::confirmed()),
                ..Default::default()
            },
            ..Default::default()
        };

        let accounts = self
            .client
            .get_program_accounts_with_config(program_id, config)
            .await
            .map_err(|e| LedgerError::rpc(format!("getProgramAccounts: {}", e)))?;

        debug!("Fetched {} program accounts", accounts.len());

        Ok(accounts
            .into_iter()
            .map(|(address, account)| {
                (
                    address,
                    AccountSnapshot {
                        data: account.data,
                        lamports: account.lamports,
                    },
                )
            })
            .collect())
    }

    async fn latest_blockhash(&self) -> Result<Hash, LedgerError> {
        self.client
            .get_latest_blockhash()
            .await
            .map_err(|e| LedgerError::rpc(format!("getLatestBlockhash: {}", e)))
    }

    async fn get_balance(&self, address: &Pubkey) -> Result<u64, LedgerError> {
        self.client
            .get_balance(address)
            .await
            .map_err(|e| LedgerError::rpc(format!("getBalance {}: {}", address, e)))
    }

    async fn submit_transaction(
        &self,
        transaction: &Transaction,
        options: SubmitOptions,
    ) -> Result<Signature, LedgerError> {
        let config = RpcSendTransactionConfig {
            skip_preflight: options.skip_preflight,
            max_retries: options.max_retries,
            ..Default::default()
        };

        self.client
            .send_transaction_with_config(transaction, config)
            .await
            .map_err(|e| LedgerError::rpc(format!("sendTransaction: {}", e)))
    }

    async fn signature_status(&self, signature: &Signature) -> Result<SignatureState, LedgerError> {
        let response = self
            .client
            .get_signature_statuses(&[*signature])
            .await
            .map_err(|e| LedgerError::rpc(format!("getSignatureStatuses: {}", e)))?;

        let state = match response.value.into_iter().next().flatten() {
            None => SignatureState::NotFound,
            Some(status) => {
                if let Some(err) = &status.err {
                    SignatureState::Failed(format!("{:?}", err))
                } else if status.satisfies_commitment(CommitmentConfig::finalized()) {
                    SignatureState::Finalized
                } else if status.satisfies_commitment(CommitmentConfig::confirmed()) {
                    SignatureState::Confirmed
                } else {
                    SignatureState::Pending
                }
            }
        };

        Ok(state)
    }

    async fn request_airdrop(&self, address: &Pubkey, lamports: u64) -> Result<Signature, LedgerError> {
        self.client
            .request_airdrop(address, lamports)
            .await
            .map_err(|e| LedgerError::rpc(format!("requestAirdrop: {}", e)))
    }
}
