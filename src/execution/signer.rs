use solana_hash::Hash;
use solana_sdk::{
    pubkey::Pubkey,
    signature::{Keypair, Signer},
    transaction::Transaction,
};
use std::sync::Arc;

use crate::error::DeliveryError;

/// Signs transaction skeletons on behalf of the keeper.
///
/// Heir self-claims never reach a signer: those transactions are handed back
/// unsigned for the heir's own wallet.
pub trait TransactionSigner: Send + Sync {
    fn pubkey(&self) -> Pubkey;

    fn sign(&self, transaction: Transaction, recent_blockhash: Hash) -> Result<Transaction, DeliveryError>;
}

/// Locally held automated key
pub struct KeypairSigner {
    keypair: Arc<Keypair>,
}

impl KeypairSigner {
    pub fn new(keypair: Arc<Keypair>) -> Self {
        Self { keypair }
    }
}

impl TransactionSigner for KeypairSigner {
    fn pubkey(&self) -> Pubkey {
        self.keypair.pubkey()
    }

    fn sign(
        &self,
        mut transaction: Transaction,
        recent_blockhash: Hash,
    ) -> Result<Transaction, DeliveryError> {
        transaction
            .try_sign(&[&*self.keypair], recent_blockhash)
            .map_err(|e| DeliveryError::Signing(e.to_string()))?;
        Ok(transaction)
    }
}
