// Working set of monitored inheritance records.
//
// Single writer: only the orchestrator mutates the registry, and only
// between the network phases of a cycle. Readers (status API) take
// snapshots.

use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use solana_sdk::{pubkey::Pubkey, signature::Signature};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::{
    error::{AppError, AppResult},
    ledger::{
        client::LedgerClient,
        models::{InheritanceRecord, RecordId},
        program::InheritanceProgram,
    },
};

/// Permanent exclusion from automatic execution; cleared only by an operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureMark {
    pub reason: String,
    pub marked_at: i64,
}

/// Submitted signature whose outcome was never observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSignature {
    pub signature: Signature,
    pub submitted_at: i64,
}

#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub record: InheritanceRecord,
    pub failure: Option<FailureMark>,
    pub pending: Option<PendingSignature>,
    pub claim_prepared_at: Option<i64>,
    pub consecutive_failures: u32,
    pub last_seen: i64,
}

impl RegistryEntry {
    fn new(record: InheritanceRecord, now: i64) -> Self {
        Self {
            record,
            failure: None,
            pending: None,
            claim_prepared_at: None,
            consecutive_failures: 0,
            last_seen: now,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RefreshSummary {
    pub observed: usize,
    pub added: usize,
    pub updated: usize,
    pub skipped: usize,
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<RecordId, RegistryEntry>,
    /// Insertion order, walked by the batch cursor
    order: Vec<RecordId>,
    cursor: usize,
    /// Addresses of records executed by us or elsewhere, kept only while the
    /// ledger still returns them
    retired: HashSet<Pubkey>,
    last_refresh_error: Option<String>,
}

impl RegistryState {
    fn upsert(&mut self, record: InheritanceRecord, now: i64) -> bool {
        let id = record.id();
        match self.entries.get_mut(&id) {
            Some(entry) => {
                merge_record(&mut entry.record, record);
                entry.last_seen = now;
                false
            }
            None => {
                self.entries.insert(id, RegistryEntry::new(record, now));
                self.order.push(id);
                true
            }
        }
    }

    fn remove(&mut self, id: &RecordId) -> Option<RegistryEntry> {
        let entry = self.entries.remove(id)?;
        if let Some(position) = self.order.iter().position(|x| x == id) {
            self.order.remove(position);
            if position < self.cursor {
                self.cursor -= 1;
            }
        }
        if self.cursor >= self.order.len() {
            self.cursor = 0;
        }
        Some(entry)
    }
}

/// Merge a fresh observation into a known record.
///
/// `last_active_at` never moves backwards and `is_executed` never flips back;
/// everything else follows the newer observation.
fn merge_record(known: &mut InheritanceRecord, fresh: InheritanceRecord) {
    let last_active_at = known.last_active_at.max(fresh.last_active_at);
    let is_executed = known.is_executed || fresh.is_executed;
    *known = InheritanceRecord {
        last_active_at,
        is_executed,
        ..fresh
    };
}

#[derive(Default)]
pub struct Registry {
    state: RwLock<RegistryState>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or merge; returns true when the record was not known before
    pub fn add(&self, record: InheritanceRecord, now: i64) -> bool {
        self.state.write().upsert(record, now)
    }

    pub fn remove(&self, id: &RecordId) -> Option<RegistryEntry> {
        self.state.write().remove(id)
    }

    pub fn list(&self) -> Vec<InheritanceRecord> {
        let state = self.state.read();
        state
            .order
            .iter()
            .filter_map(|id| state.entries.get(id))
            .map(|entry| entry.record.clone())
            .collect()
    }

    pub fn entries(&self) -> Vec<RegistryEntry> {
        let state = self.state.read();
        state
            .order
            .iter()
            .filter_map(|id| state.entries.get(id).cloned())
            .collect()
    }

    pub fn get(&self, id: &RecordId) -> Option<RegistryEntry> {
        self.state.read().entries.get(id).cloned()
    }

    pub fn find_by_address(&self, address: &Pubkey) -> Option<RegistryEntry> {
        self.state
            .read()
            .entries
            .values()
            .find(|entry| entry.record.address == *address)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn failed_count(&self) -> usize {
        self.state
            .read()
            .entries
            .values()
            .filter(|entry| entry.failure.is_some())
            .count()
    }

    pub fn pending_count(&self) -> usize {
        self.state
            .read()
            .entries
            .values()
            .filter(|entry| entry.pending.is_some())
            .count()
    }

    pub fn last_refresh_error(&self) -> Option<String> {
        self.state.read().last_refresh_error.clone()
    }

    pub fn is_retired(&self, address: &Pubkey) -> bool {
        self.state.read().retired.contains(address)
    }

    /// Next `size` records in rotation, skipping failed ones
    pub fn next_batch(&self, size: usize) -> Vec<(RecordId, Pubkey)> {
        let mut state = self.state.write();
        let len = state.order.len();
        let mut batch = Vec::with_capacity(size.min(len));
        let mut visited = 0;

        while batch.len() < size && visited < len {
            let index = (state.cursor + visited) % len;
            let id = state.order[index];
            if let Some(entry) = state.entries.get(&id) {
                if entry.failure.is_none() {
                    batch.push((id, entry.record.address));
                }
            }
            visited += 1;
        }

        if len > 0 {
            state.cursor = (state.cursor + visited) % len;
        }
        batch
    }

    pub fn mark_failed(&self, id: &RecordId, reason: impl Into<String>, now: i64) {
        if let Some(entry) = self.state.write().entries.get_mut(id) {
            entry.failure = Some(FailureMark {
                reason: reason.into(),
                marked_at: now,
            });
            entry.pending = None;
        }
    }

    /// Operator override for a failed record
    pub fn clear_failure(&self, id: &RecordId) -> bool {
        match self.state.write().entries.get_mut(id) {
            Some(entry) => {
                entry.consecutive_failures = 0;
                entry.failure.take().is_some()
            }
            None => false,
        }
    }

    pub fn mark_pending(&self, id: &RecordId, signature: Signature, now: i64) {
        if let Some(entry) = self.state.write().entries.get_mut(id) {
            entry.pending = Some(PendingSignature {
                signature,
                submitted_at: now,
            });
        }
    }

    pub fn clear_pending(&self, id: &RecordId) {
        if let Some(entry) = self.state.write().entries.get_mut(id) {
            entry.pending = None;
        }
    }

    pub fn mark_claim_prepared(&self, id: &RecordId, now: i64) {
        if let Some(entry) = self.state.write().entries.get_mut(id) {
            entry.claim_prepared_at = Some(now);
        }
    }

    /// Returns the new consecutive failure count
    pub fn record_attempt_failure(&self, id: &RecordId) -> u32 {
        match self.state.write().entries.get_mut(id) {
            Some(entry) => {
                entry.consecutive_failures += 1;
                entry.consecutive_failures
            }
            None => 0,
        }
    }

    /// Drop an executed record from the working set for good
    pub fn retire(&self, id: &RecordId) -> Option<RegistryEntry> {
        let mut state = self.state.write();
        let entry = state.remove(id)?;
        state.retired.insert(entry.record.address);
        Some(entry)
    }

    /// Discover-all refresh from a full program scan.
    ///
    /// All network reads happen before the registry is touched. On any scan
    /// failure the previous snapshot is kept and the error is returned.
    pub async fn refresh_from_ledger(
        &self,
        ledger: &dyn LedgerClient,
        program: &InheritanceProgram,
        now: i64,
    ) -> AppResult<RefreshSummary> {
        let mut observed = Vec::new();

        for (layout, filter) in program.discovery_filters() {
            match ledger
                .fetch_accounts_by_filter(program.program_id(), std::slice::from_ref(&filter))
                .await
            {
                Ok(accounts) => {
                    debug!("Scan found {} {:?} accounts", accounts.len(), layout);
                    observed.extend(accounts);
                }
                Err(e) => {
                    warn!("⚠️ Ledger scan failed, keeping last snapshot: {}", e);
                    self.state.write().last_refresh_error = Some(e.to_string());
                    return Err(e.into());
                }
            }
        }

        let seen: HashSet<Pubkey> = observed.iter().map(|(address, _)| *address).collect();
        let records = observed
            .into_iter()
            .filter_map(|(address, account)| match program.decode(address, &account) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("Skipping undecodable account {}: {}", address, e);
                    None
                }
            })
            .collect();

        Ok(self.apply(records, &seen, now))
    }

    /// Explicit-target refresh; retired targets are not fetched again.
    pub async fn sync_targets(
        &self,
        ledger: &dyn LedgerClient,
        program: &InheritanceProgram,
        targets: &[Pubkey],
        now: i64,
    ) -> AppResult<RefreshSummary> {
        let wanted: Vec<Pubkey> = targets
            .iter()
            .filter(|address| !self.is_retired(address))
            .copied()
            .collect();

        let fetched = join_all(wanted.iter().map(|address| ledger.fetch_account(address))).await;

        let mut records = Vec::new();
        let mut first_error: Option<AppError> = None;

        for (address, result) in wanted.iter().zip(fetched) {
            match result {
                Ok(Some(account)) => match program.decode(*address, &account) {
                    Ok(record) => records.push(record),
                    Err(e) => warn!("Target {} is not an inheritance record: {}", address, e),
                },
                Ok(None) => warn!("Target {} does not exist on the ledger", address),
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e.into());
                    }
                }
            }
        }

        if let Some(e) = first_error {
            warn!("⚠️ Target sync failed, keeping last snapshot: {}", e);
            self.state.write().last_refresh_error = Some(e.to_string());
            return Err(e);
        }

        let targeted: HashSet<Pubkey> = targets.iter().copied().collect();
        Ok(self.apply(records, &targeted, now))
    }

    /// Merge observed records. Retirement marks for addresses outside
    /// `covered` are dropped; those accounts are gone or no longer targeted.
    fn apply(
        &self,
        records: Vec<InheritanceRecord>,
        covered: &HashSet<Pubkey>,
        now: i64,
    ) -> RefreshSummary {
        let mut summary = RefreshSummary {
            observed: records.len(),
            ..Default::default()
        };

        let mut state = self.state.write();
        state.last_refresh_error = None;
        state.retired.retain(|address| covered.contains(address));

        for record in records {
            if record.is_executed || state.retired.contains(&record.address) {
                summary.skipped += 1;
                continue;
            }
            if state.upsert(record, now) {
                summary.added += 1;
            } else {
                summary.updated += 1;
            }
        }

        if summary.added > 0 {
            info!(
                "📋 Registry refreshed: {} added, {} updated, {} monitored",
                summary.added,
                summary.updated,
                state.entries.len()
            );
        }
        summary
    }
}
