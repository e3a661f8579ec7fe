use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use solana_sdk::{pubkey::Pubkey, signature::Signature};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::{
    error::FailureKind,
    execution::Route,
    keeper::eligibility::{EligibilityState, Evaluation},
    ledger::models::{AssetDescriptor, InheritanceRecord},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HeirPayout {
    #[serde(serialize_with = "as_string")]
    pub heir: Pubkey,
    pub amount: u64,
}

/// Structured result of a confirmed execution
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    #[serde(serialize_with = "as_string")]
    pub owner: Pubkey,
    #[serde(serialize_with = "as_string")]
    pub record: Pubkey,
    pub asset: AssetDescriptor,
    pub amount_distributed: u64,
    pub distribution: Vec<HeirPayout>,
    pub heir_count: usize,
    #[serde(serialize_with = "as_string")]
    pub signature: Signature,
    pub route: Route,
    pub elapsed_ms: u64,
    pub escalated: bool,
}

impl ExecutionResult {
    /// Amounts come from the record snapshot, never from the route taken.
    pub fn from_record(
        record: &InheritanceRecord,
        signature: Signature,
        route: Route,
        elapsed_ms: u64,
        escalated: bool,
    ) -> Self {
        let distribution: Vec<HeirPayout> = record
            .distribution()
            .into_iter()
            .map(|(heir, amount)| HeirPayout { heir, amount })
            .collect();

        Self {
            owner: record.owner,
            record: record.address,
            asset: record.asset(),
            amount_distributed: distribution.iter().map(|p| p.amount).sum(),
            distribution,
            heir_count: record.heir_count(),
            signature,
            route,
            elapsed_ms,
            escalated,
        }
    }
}

/// Unsigned claim handed to an heir for self-signing
#[derive(Debug, Clone, Serialize)]
pub struct PreparedClaim {
    #[serde(serialize_with = "as_string")]
    pub record: Pubkey,
    #[serde(serialize_with = "as_string")]
    pub owner: Pubkey,
    #[serde(serialize_with = "as_string")]
    pub heir: Pubkey,
    #[serde(serialize_with = "as_string")]
    pub fee_payer: Pubkey,
    pub unsigned_transaction_base64: String,
    pub recent_blockhash: String,
    pub prepared_at: DateTime<Utc>,
}

/// What happened to one record during a cycle
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecordOutcome {
    Executed(ExecutionResult),
    /// Submitted but never observed confirmed or failed; not re-submitted
    /// until the signature is re-checked
    Unknown {
        #[serde(serialize_with = "as_string")]
        record: Pubkey,
        #[serde(serialize_with = "as_string")]
        signature: Signature,
    },
    Failed {
        #[serde(serialize_with = "as_string")]
        record: Pubkey,
        kind: FailureKind,
        reason: String,
        /// Terminal failures exclude the record from automatic execution
        terminal: bool,
    },
    /// Abandoned by the per-record timeout; a submission made before that
    /// is re-checked like an unknown outcome
    TimedOut {
        #[serde(serialize_with = "as_string")]
        record: Pubkey,
        #[serde(skip_serializing_if = "Option::is_none", serialize_with = "as_opt_string")]
        signature: Option<Signature>,
    },
    ClaimsPrepared {
        #[serde(serialize_with = "as_string")]
        record: Pubkey,
        claims: usize,
    },
}

impl RecordOutcome {
    pub fn record(&self) -> Pubkey {
        match self {
            RecordOutcome::Executed(result) => result.record,
            RecordOutcome::Unknown { record, .. }
            | RecordOutcome::Failed { record, .. }
            | RecordOutcome::TimedOut { record, .. }
            | RecordOutcome::ClaimsPrepared { record, .. } => *record,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub active: usize,
    pub inactive: usize,
    pub eligible: usize,
    pub executed: usize,
    pub failed: usize,
}

impl StateCounts {
    pub fn record(&mut self, state: EligibilityState) {
        match state {
            EligibilityState::Active => self.active += 1,
            EligibilityState::Inactive => self.inactive += 1,
            EligibilityState::Eligible => self.eligible += 1,
            EligibilityState::Executed => self.executed += 1,
            EligibilityState::Failed => self.failed += 1,
        }
    }
}

/// Summary of one keeper cycle
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub monitored: usize,
    pub batch_size: usize,
    pub states: StateCounts,
    pub executed: usize,
    pub failed: usize,
    pub unknown: usize,
    pub timed_out: usize,
    /// Eligible records left for the next cycle (deadline or funding)
    pub deferred: usize,
    pub prepared_claims: usize,
    pub removed: usize,
    pub funding_skipped: bool,
    pub discovery_error: Option<String>,
    pub results: Vec<ExecutionResult>,
    pub failures: BTreeMap<String, String>,
}

impl CycleReport {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            cycle_id: Uuid::new_v4(),
            started_at,
            finished_at: started_at,
            monitored: 0,
            batch_size: 0,
            states: StateCounts::default(),
            executed: 0,
            failed: 0,
            unknown: 0,
            timed_out: 0,
            deferred: 0,
            prepared_claims: 0,
            removed: 0,
            funding_skipped: false,
            discovery_error: None,
            results: Vec::new(),
            failures: BTreeMap::new(),
        }
    }

    pub fn absorb(&mut self, outcome: &RecordOutcome) {
        match outcome {
            RecordOutcome::Executed(result) => {
                self.executed += 1;
                self.results.push(result.clone());
            }
            RecordOutcome::Unknown { .. } => self.unknown += 1,
            RecordOutcome::Failed { record, reason, .. } => {
                self.failed += 1;
                self.failures.insert(record.to_string(), reason.clone());
            }
            RecordOutcome::TimedOut { .. } => self.timed_out += 1,
            RecordOutcome::ClaimsPrepared { claims, .. } => self.prepared_claims += claims,
        }
    }
}

/// Keeper-level status
#[derive(Debug, Clone, Serialize)]
pub struct KeeperStatus {
    pub running: bool,
    pub phase: CyclePhase,
    pub monitored_count: usize,
    pub failed_count: usize,
    pub pending_count: usize,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub check_interval_ms: u64,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_discovery_error: Option<String>,
    pub last_report: Option<CycleReport>,
}

/// Per-record status, produced by the same evaluation that gates execution
#[derive(Debug, Clone, Serialize)]
pub struct RecordStatus {
    #[serde(serialize_with = "as_string")]
    pub address: Pubkey,
    #[serde(serialize_with = "as_string")]
    pub owner: Pubkey,
    pub asset: AssetDescriptor,
    pub mint: Option<String>,
    pub state: EligibilityState,
    pub eligible: bool,
    pub reason: String,
    pub balance: u64,
    pub balance_sol: Option<Decimal>,
    pub time_remaining_secs: i64,
    pub heir_count: usize,
    pub pending_signature: Option<String>,
}

impl RecordStatus {
    pub fn new(
        record: &InheritanceRecord,
        evaluation: Evaluation,
        pending: Option<&Signature>,
    ) -> Self {
        Self {
            address: record.address,
            owner: record.owner,
            asset: record.asset(),
            mint: record.mint().map(|m| m.to_string()),
            eligible: evaluation.is_eligible(),
            state: evaluation.state,
            reason: evaluation.reason,
            balance: record.balance,
            balance_sol: record.balance_sol(),
            time_remaining_secs: evaluation.time_remaining_secs,
            heir_count: record.heir_count(),
            pending_signature: pending.map(|s| s.to_string()),
        }
    }
}

/// Orchestrator phase: Idle → Scanning → Evaluating → Executing → Reporting → Idle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    Idle,
    Scanning,
    Evaluating,
    Executing,
    Reporting,
}

fn as_string<T: std::fmt::Display, S: serde::Serializer>(
    value: &T,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

fn as_opt_string<T: std::fmt::Display, S: serde::Serializer>(
    value: &Option<T>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match value {
        Some(value) => serializer.collect_str(value),
        None => serializer.serialize_none(),
    }
}
