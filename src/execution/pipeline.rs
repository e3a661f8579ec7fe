// Transaction pipeline values.
//
// Skeleton -> Optimized -> Signed -> Submitted -> ConfirmationOutcome
//
// Every step consumes its input and returns a new value, so a failure at
// any step leaves nothing half-built behind for a later step to pick up.

use borsh::BorshDeserialize;
use serde::Serialize;
use solana_compute_budget_interface::ComputeBudgetInstruction;
use solana_hash::Hash;
use solana_sdk::{
    instruction::Instruction,
    message::Message,
    pubkey::Pubkey,
    signature::Signature,
    transaction::Transaction,
};
use tokio::time::Instant;

use crate::{
    error::DeliveryError,
    execution::{
        router::{DeliveryContext, Route},
        signer::TransactionSigner,
    },
};

/// Compute-unit price set by a compiled transaction, if any
pub fn compute_unit_price_of(transaction: &Transaction) -> Option<u64> {
    let message = &transaction.message;
    message.instructions.iter().find_map(|ix| {
        let program = message.account_keys.get(ix.program_id_index as usize)?;
        if !solana_compute_budget_interface::check_id(program) {
            return None;
        }
        match ComputeBudgetInstruction::try_from_slice(&ix.data).ok()? {
            ComputeBudgetInstruction::SetComputeUnitPrice(price) => Some(price),
            _ => None,
        }
    })
}

/// What the caller wants done on the ledger, before any fee decisions
#[derive(Debug, Clone)]
pub struct TxSkeleton {
    pub instructions: Vec<Instruction>,
    pub fee_payer: Pubkey,
    pub context: DeliveryContext,
}

impl TxSkeleton {
    pub fn new(instructions: Vec<Instruction>, fee_payer: Pubkey, context: DeliveryContext) -> Self {
        Self {
            instructions,
            fee_payer,
            context,
        }
    }

    /// Standard route build: the keeper prepends its own compute budget.
    pub fn with_compute_budget(
        &self,
        compute_unit_limit: u32,
        compute_unit_price: u64,
        recent_blockhash: Hash,
    ) -> OptimizedTx {
        let mut instructions = Vec::with_capacity(self.instructions.len() + 2);
        instructions.push(ComputeBudgetInstruction::set_compute_unit_limit(compute_unit_limit));
        instructions.push(ComputeBudgetInstruction::set_compute_unit_price(compute_unit_price));
        instructions.extend(self.instructions.iter().cloned());

        let message =
            Message::new_with_blockhash(&instructions, Some(&self.fee_payer), &recent_blockhash);

        OptimizedTx {
            transaction: Transaction::new_unsigned(message),
            route: Route::Standard,
            compute_unit_price,
            recent_blockhash,
        }
    }

    /// Unsigned transaction without any fee adjustments (heir claim hand-off)
    pub fn unsigned(&self, recent_blockhash: Hash) -> Transaction {
        let message =
            Message::new_with_blockhash(&self.instructions, Some(&self.fee_payer), &recent_blockhash);
        Transaction::new_unsigned(message)
    }
}

/// Fee-adjusted, unsigned transaction bound to a recent blockhash
#[derive(Debug, Clone)]
pub struct OptimizedTx {
    pub transaction: Transaction,
    pub route: Route,
    pub compute_unit_price: u64,
    pub recent_blockhash: Hash,
}

impl OptimizedTx {
    pub fn fee_payer(&self) -> Option<&Pubkey> {
        self.transaction.message.account_keys.first()
    }

    pub fn sign(self, signer: &dyn TransactionSigner) -> Result<SignedTx, DeliveryError> {
        let transaction = signer.sign(self.transaction, self.recent_blockhash)?;
        Ok(SignedTx {
            transaction,
            route: self.route,
            compute_unit_price: self.compute_unit_price,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SignedTx {
    pub transaction: Transaction,
    pub route: Route,
    pub compute_unit_price: u64,
}

impl SignedTx {
    pub fn signature(&self) -> Option<Signature> {
        self.transaction.signatures.first().copied()
    }

    pub fn submitted(self, signature: Signature) -> SubmittedTx {
        SubmittedTx {
            signature,
            route: self.route,
            compute_unit_price: self.compute_unit_price,
            submitted_at: Instant::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubmittedTx {
    pub signature: Signature,
    pub route: Route,
    pub compute_unit_price: u64,
    pub submitted_at: Instant,
}

/// Result of confirmation polling.
///
/// `Unknown` is neither success nor failure: the transaction may still land,
/// so re-submission is only safe after the signature has been re-checked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum ConfirmationOutcome {
    Confirmed,
    Failed(String),
    Unknown,
}
