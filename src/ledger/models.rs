use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use std::collections::HashSet;
use std::fmt;

use crate::error::ValidationError;

pub const LAMPORTS_PER_SOL: u64 = 1_000_000_000;

/// Identity of an inheritance record.
///
/// Single-heir records are keyed by their parties; a multi-heir smart wallet
/// is keyed by its own account address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordId {
    Native { owner: Pubkey, heir: Pubkey },
    Token { owner: Pubkey, heir: Pubkey, mint: Pubkey },
    MultiHeir { address: Pubkey },
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::Native { owner, heir } => write!(f, "native:{}:{}", owner, heir),
            RecordId::Token { owner, heir, mint } => {
                write!(f, "token:{}:{}:{}", owner, heir, mint)
            }
            RecordId::MultiHeir { address } => write!(f, "multi:{}", address),
        }
    }
}

/// One heir's share of a record, in whole percent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeirAllocation {
    pub heir: Pubkey,
    pub percentage: u8,
}

/// Asset being inherited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetDescriptor {
    Native,
    Token,
}

/// Record variants. Everything the keeper needs beyond the variant-specific
/// parties is shared on [`InheritanceRecord`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordKind {
    Native { heir: Pubkey },
    Token { heir: Pubkey, mint: Pubkey },
    MultiHeir { allocations: Vec<HeirAllocation> },
}

/// Snapshot of an on-ledger inheritance record.
///
/// INVARIANT: `last_active_at` is only ever written by the owner's activity on
/// the ledger; the keeper never mutates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InheritanceRecord {
    /// Account holding the record on the ledger
    pub address: Pubkey,
    pub owner: Pubkey,
    pub kind: RecordKind,
    pub inactivity_period_secs: i64,
    /// Unix timestamp (seconds) of the owner's last recorded activity
    pub last_active_at: i64,
    pub is_executed: bool,
    /// Amount available to distribute, in base units (lamports or token units)
    pub balance: u64,
}

impl InheritanceRecord {
    pub fn id(&self) -> RecordId {
        match &self.kind {
            RecordKind::Native { heir } => RecordId::Native {
                owner: self.owner,
                heir: *heir,
            },
            RecordKind::Token { heir, mint } => RecordId::Token {
                owner: self.owner,
                heir: *heir,
                mint: *mint,
            },
            RecordKind::MultiHeir { .. } => RecordId::MultiHeir {
                address: self.address,
            },
        }
    }

    pub fn asset(&self) -> AssetDescriptor {
        match self.kind {
            RecordKind::Token { .. } => AssetDescriptor::Token,
            _ => AssetDescriptor::Native,
        }
    }

    pub fn mint(&self) -> Option<Pubkey> {
        match self.kind {
            RecordKind::Token { mint, .. } => Some(mint),
            _ => None,
        }
    }

    /// Allocations in ledger order; single-heir records own 100%.
    pub fn allocations(&self) -> Vec<HeirAllocation> {
        match &self.kind {
            RecordKind::Native { heir } | RecordKind::Token { heir, .. } => vec![HeirAllocation {
                heir: *heir,
                percentage: 100,
            }],
            RecordKind::MultiHeir { allocations } => allocations.clone(),
        }
    }

    pub fn heirs(&self) -> Vec<Pubkey> {
        self.allocations().iter().map(|a| a.heir).collect()
    }

    pub fn heir_count(&self) -> usize {
        match &self.kind {
            RecordKind::MultiHeir { allocations } => allocations.len(),
            _ => 1,
        }
    }

    /// Structural validation. A record failing here is never renormalized or
    /// repaired; it is excluded from automatic execution.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.inactivity_period_secs <= 0 {
            return Err(ValidationError::NonPositiveInactivity(
                self.inactivity_period_secs,
            ));
        }

        if let RecordKind::MultiHeir { allocations } = &self.kind {
            if allocations.is_empty() {
                return Err(ValidationError::NoHeirs);
            }

            let mut seen = HashSet::new();
            for allocation in allocations {
                if allocation.percentage == 0 {
                    return Err(ValidationError::ZeroAllocation(allocation.heir));
                }
                if !seen.insert(allocation.heir) {
                    return Err(ValidationError::DuplicateHeir(allocation.heir));
                }
            }

            let total: u32 = allocations.iter().map(|a| u32::from(a.percentage)).sum();
            if total != 100 {
                return Err(ValidationError::AllocationSum { total });
            }
        }

        Ok(())
    }

    /// Expected per-heir amounts for the current balance.
    ///
    /// Each heir receives `floor(balance * pct / 100)`; the rounding remainder
    /// goes to the last heir so the amounts always sum to the balance.
    pub fn distribution(&self) -> Vec<(Pubkey, u64)> {
        let allocations = self.allocations();
        let mut amounts: Vec<(Pubkey, u64)> = allocations
            .iter()
            .map(|a| {
                let share = u128::from(self.balance) * u128::from(a.percentage) / 100;
                (a.heir, share as u64)
            })
            .collect();

        let assigned: u64 = amounts.iter().map(|(_, amount)| *amount).sum();
        if let Some(last) = amounts.last_mut() {
            last.1 += self.balance.saturating_sub(assigned);
        }
        amounts
    }

    /// Balance expressed in SOL; `None` for token records whose decimals are
    /// not known to the keeper.
    pub fn balance_sol(&self) -> Option<Decimal> {
        match self.asset() {
            AssetDescriptor::Native => Some(lamports_to_sol(self.balance)),
            AssetDescriptor::Token => None,
        }
    }
}

pub fn lamports_to_sol(lamports: u64) -> Decimal {
    Decimal::from(lamports) / Decimal::from(LAMPORTS_PER_SOL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn multi_heir(shares: &[u8], balance: u64) -> InheritanceRecord {
        InheritanceRecord {
            address: Pubkey::new_unique(),
            owner: Pubkey::new_unique(),
            kind: RecordKind::MultiHeir {
                allocations: shares
                    .iter()
                    .map(|pct| HeirAllocation {
                        heir: Pubkey::new_unique(),
                        percentage: *pct,
                    })
                    .collect(),
            },
            inactivity_period_secs: 86_400,
            last_active_at: 0,
            is_executed: false,
            balance,
        }
    }

    #[test]
    fn test_allocations_must_sum_to_exactly_100() {
        assert!(multi_heir(&[70, 30], 1).validate().is_ok());
        assert_eq!(
            multi_heir(&[70, 29], 1).validate(),
            Err(ValidationError::AllocationSum { total: 99 })
        );
        assert_eq!(
            multi_heir(&[70, 31], 1).validate(),
            Err(ValidationError::AllocationSum { total: 101 })
        );
    }

    #[test]
    fn test_invalid_allocation_is_not_renormalized() {
        let record = multi_heir(&[60, 60], LAMPORTS_PER_SOL);
        assert!(record.validate().is_err());
        // The record data is left exactly as observed.
        let shares: Vec<u8> = record.allocations().iter().map(|a| a.percentage).collect();
        assert_eq!(shares, vec![60, 60]);
    }

    #[test]
    fn test_zero_share_and_duplicate_heir_rejected() {
        assert!(matches!(
            multi_heir(&[100, 0], 1).validate(),
            Err(ValidationError::ZeroAllocation(_))
        ));

        let mut record = multi_heir(&[50, 50], 1);
        if let RecordKind::MultiHeir { allocations } = &mut record.kind {
            allocations[1].heir = allocations[0].heir;
        }
        assert!(matches!(
            record.validate(),
            Err(ValidationError::DuplicateHeir(_))
        ));
    }

    #[test]
    fn test_non_positive_inactivity_rejected() {
        let mut record = multi_heir(&[100], 1);
        record.inactivity_period_secs = 0;
        assert_eq!(
            record.validate(),
            Err(ValidationError::NonPositiveInactivity(0))
        );
    }

    #[test]
    fn test_seventy_thirty_distribution() {
        let record = multi_heir(&[70, 30], LAMPORTS_PER_SOL);
        let amounts: Vec<Decimal> = record
            .distribution()
            .iter()
            .map(|(_, lamports)| lamports_to_sol(*lamports))
            .collect();
        assert_eq!(amounts, vec![dec!(0.7), dec!(0.3)]);
    }

    #[test]
    fn test_rounding_remainder_goes_to_last_heir() {
        let record = multi_heir(&[33, 33, 34], 100_000_001);
        let amounts: Vec<u64> = record.distribution().iter().map(|(_, a)| *a).collect();
        assert_eq!(amounts, vec![33_000_000, 33_000_000, 34_000_001]);
        assert_eq!(amounts.iter().sum::<u64>(), 100_000_001);
    }

    #[test]
    fn test_single_heir_record_owns_everything() {
        let heir = Pubkey::new_unique();
        let record = InheritanceRecord {
            address: Pubkey::new_unique(),
            owner: Pubkey::new_unique(),
            kind: RecordKind::Native { heir },
            inactivity_period_secs: 10,
            last_active_at: 0,
            is_executed: false,
            balance: 2_500_000_000,
        };
        assert_eq!(record.distribution(), vec![(heir, 2_500_000_000)]);
        assert_eq!(record.balance_sol(), Some(dec!(2.5)));
        assert_eq!(record.heir_count(), 1);
    }
}
