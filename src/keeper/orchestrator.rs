// Keeper orchestrator - timer-driven scan, evaluate, fund, execute loop
//
// Cycle phases: Idle → Scanning → Evaluating → Executing → Reporting → Idle.
// The registry is only mutated here, and only between the network phases of
// a cycle. Per-record failures never abort a batch; funding failures abort
// only the current batch.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use governor::{clock::DefaultClock, state::InMemoryState, state::NotKeyed, Quota, RateLimiter};
use parking_lot::{Mutex, RwLock};
use solana_sdk::{pubkey::Pubkey, signature::Signature};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    config::{ExecutionMode, KeeperConfig},
    error::{AppError, AppResult, DeliveryError, FailureKind, FundingError},
    execution::{
        optimizer::encode_transaction, AccountTier, ConfirmationOutcome, DeliveryContext,
        DeliveryRouter, PriorityClass, TransactionType, TxSkeleton,
    },
    funding::{chunk_size, FundingGuard, FundingStatus},
    keeper::{
        eligibility::{assess, EligibilityState},
        registry::{PendingSignature, Registry, RegistryEntry},
        report::{
            CyclePhase, CycleReport, ExecutionResult, KeeperStatus, PreparedClaim, RecordOutcome,
            RecordStatus,
        },
    },
    ledger::{
        client::{LedgerClient, SignatureState},
        models::{InheritanceRecord, RecordId},
        program::InheritanceProgram,
    },
    retry::BackoffPolicy,
};

type LaunchLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Orchestrator tuning, resolved from [`KeeperConfig`]
#[derive(Debug, Clone)]
pub struct KeeperSettings {
    pub mode: ExecutionMode,
    pub batch_size: usize,
    /// Must stay below `batch_size`
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub record_timeout: Duration,
    /// Soft deadline; records not launched by then wait for the next cycle
    pub cycle_deadline: Duration,
    pub launch_stagger: Duration,
    pub claim_refresh_secs: i64,
    pub pending_ttl_secs: i64,
    pub funding_cooldown: Duration,
    /// Per-record attempts within one cycle
    pub backoff: BackoffPolicy,
    pub tier: AccountTier,
    /// Explicit records to monitor; empty means discover all
    pub targets: Vec<Pubkey>,
}

impl KeeperSettings {
    pub fn from_config(config: &KeeperConfig) -> AppResult<Self> {
        Ok(Self {
            mode: config.execution_mode,
            batch_size: config.batch_size,
            concurrency: config.concurrency,
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            record_timeout: Duration::from_secs(config.record_timeout_secs),
            cycle_deadline: Duration::from_secs(config.cycle_deadline_secs),
            launch_stagger: Duration::from_millis(config.launch_stagger_ms),
            claim_refresh_secs: config.claim_refresh_secs as i64,
            pending_ttl_secs: config.pending_signature_ttl_secs as i64,
            funding_cooldown: Duration::from_secs(config.funding_cooldown_secs),
            backoff: config.backoff(),
            tier: config.account_tier,
            targets: config.target_addresses()?,
        })
    }
}

struct RuntimeState {
    running: bool,
    phase: CyclePhase,
    last_cycle_at: Option<DateTime<Utc>>,
    last_report: Option<CycleReport>,
    cooldown_until: Option<DateTime<Utc>>,
}

struct KeeperInner {
    settings: KeeperSettings,
    ledger: Arc<dyn LedgerClient>,
    program: InheritanceProgram,
    registry: Registry,
    router: DeliveryRouter,
    funding: FundingGuard,
    keeper_pubkey: Pubkey,
    limiter: Option<LaunchLimiter>,
    /// Serializes cycles between the timer loop and manual checks
    cycle_lock: tokio::sync::Mutex<()>,
    state: RwLock<RuntimeState>,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    claims: RwLock<Vec<PreparedClaim>>,
}

/// Resolution of a remembered unknown-outcome signature
enum PendingResolution {
    Landed,
    /// Safe to submit again
    Cleared,
    Wait,
}

/// Explicit keeper service object; cheap to clone, shares one state.
#[derive(Clone)]
pub struct Keeper {
    inner: Arc<KeeperInner>,
}

impl Keeper {
    pub fn new(
        settings: KeeperSettings,
        ledger: Arc<dyn LedgerClient>,
        program: InheritanceProgram,
        router: DeliveryRouter,
        funding: FundingGuard,
    ) -> Self {
        let limiter = Quota::with_period(settings.launch_stagger).map(RateLimiter::direct);
        let keeper_pubkey = *funding.account();
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(KeeperInner {
                settings,
                ledger,
                program,
                registry: Registry::new(),
                router,
                funding,
                keeper_pubkey,
                limiter,
                cycle_lock: tokio::sync::Mutex::new(()),
                state: RwLock::new(RuntimeState {
                    running: false,
                    phase: CyclePhase::Idle,
                    last_cycle_at: None,
                    last_report: None,
                    cooldown_until: None,
                }),
                shutdown,
                handle: Mutex::new(None),
                claims: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Start the timer loop in the background
    pub fn start(&self) -> AppResult<()> {
        let mut handle = self.inner.handle.lock();
        if handle.is_some() {
            return Err(AppError::InvalidInput("keeper is already running".to_string()));
        }

        self.inner.shutdown.send_replace(false);
        self.inner.state.write().running = true;

        let keeper = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        let period = self.inner.settings.poll_interval;

        *handle = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("⏰ Keeper loop started, checking every {}s", period.as_secs());

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Some(until) = keeper.cooldown_until() {
                            info!("🧊 Funding cooldown until {}, skipping cycle", until.format("%H:%M:%S"));
                            continue;
                        }
                        keeper.run_cycle().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            keeper.inner.state.write().running = false;
            info!("🛑 Keeper loop stopped");
        }));

        Ok(())
    }

    /// Let the in-flight cycle finish, then halt the loop
    pub async fn stop(&self) {
        self.inner.shutdown.send_replace(true);
        let handle = self.inner.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("❌ Keeper loop ended abnormally: {}", e);
            }
        }
        self.inner.state.write().running = false;
    }

    /// Run exactly one cycle now, regardless of the timer and any cooldown
    pub async fn manual_check(&self) -> CycleReport {
        info!("🔍 Manual check requested");
        self.run_cycle().await
    }

    pub fn get_status(&self) -> KeeperStatus {
        let state = self.inner.state.read();
        let registry = &self.inner.registry;
        KeeperStatus {
            running: state.running,
            phase: state.phase,
            monitored_count: registry.len(),
            failed_count: registry.failed_count(),
            pending_count: registry.pending_count(),
            last_cycle_at: state.last_cycle_at,
            check_interval_ms: self.inner.settings.poll_interval.as_millis() as u64,
            cooldown_until: state.cooldown_until,
            last_discovery_error: registry.last_refresh_error(),
            last_report: state.last_report.clone(),
        }
    }

    /// Status of one record, monitored or not.
    ///
    /// Unmonitored addresses are read straight from the ledger.
    pub async fn get_record_status(&self, address: &Pubkey) -> AppResult<RecordStatus> {
        let now = Utc::now().timestamp();

        if let Some(entry) = self.inner.registry.find_by_address(address) {
            let evaluation = assess(&entry.record, entry.failure.as_ref(), now);
            return Ok(RecordStatus::new(
                &entry.record,
                evaluation,
                entry.pending.as_ref().map(|p| &p.signature),
            ));
        }

        let account = self
            .inner
            .ledger
            .fetch_account(address)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("no account at {}", address)))?;
        let record = self.inner.program.decode(*address, &account)?;
        let evaluation = assess(&record, None, now);
        Ok(RecordStatus::new(&record, evaluation, None))
    }

    pub fn list_records(&self) -> Vec<RecordStatus> {
        let now = Utc::now().timestamp();
        self.inner
            .registry
            .entries()
            .iter()
            .map(|entry| {
                RecordStatus::new(
                    &entry.record,
                    assess(&entry.record, entry.failure.as_ref(), now),
                    entry.pending.as_ref().map(|p| &p.signature),
                )
            })
            .collect()
    }

    pub async fn operating_balance(&self) -> Result<FundingStatus, FundingError> {
        self.inner.funding.check_balance().await
    }

    pub fn prepared_claims(&self) -> Vec<PreparedClaim> {
        self.inner.claims.read().clone()
    }

    /// Operator override: return a failed record to automatic execution
    pub fn reset_failure(&self, address: &Pubkey) -> AppResult<()> {
        let entry = self
            .inner
            .registry
            .find_by_address(address)
            .ok_or_else(|| AppError::NotFound(format!("record {} is not monitored", address)))?;

        if !self.inner.registry.clear_failure(&entry.record.id()) {
            return Err(AppError::InvalidInput(format!(
                "record {} is not marked failed",
                address
            )));
        }
        info!("♻️ Failure mark cleared for {} by operator", address);
        Ok(())
    }

    fn cooldown_until(&self) -> Option<DateTime<Utc>> {
        let mut state = self.inner.state.write();
        match state.cooldown_until {
            Some(until) if until > Utc::now() => Some(until),
            Some(_) => {
                state.cooldown_until = None;
                None
            }
            None => None,
        }
    }

    /// Executed records leave the working set together with any claims
    /// still offered for them
    fn retire(&self, id: &RecordId, address: &Pubkey) {
        self.inner.registry.retire(id);
        self.drop_claims(address);
    }

    fn drop_claims(&self, address: &Pubkey) {
        self.inner.claims.write().retain(|claim| claim.record != *address);
    }

    fn set_phase(&self, phase: CyclePhase) {
        self.inner.state.write().phase = phase;
    }

    fn enter_cooldown(&self) {
        let cooldown = chrono::Duration::from_std(self.inner.settings.funding_cooldown)
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.inner.state.write().cooldown_until = Some(Utc::now() + cooldown);
    }

    #[instrument(skip(self))]
    async fn run_cycle(&self) -> CycleReport {
        let inner = &self.inner;
        let _cycle = inner.cycle_lock.lock().await;

        let started_at = Utc::now();
        let deadline = Instant::now() + inner.settings.cycle_deadline;
        let mut report = CycleReport::new(started_at);

        // Scanning
        self.set_phase(CyclePhase::Scanning);
        let scan = if inner.settings.targets.is_empty() {
            inner
                .registry
                .refresh_from_ledger(inner.ledger.as_ref(), &inner.program, started_at.timestamp())
                .await
        } else {
            inner
                .registry
                .sync_targets(
                    inner.ledger.as_ref(),
                    &inner.program,
                    &inner.settings.targets,
                    started_at.timestamp(),
                )
                .await
        };
        if let Err(e) = scan {
            warn!("⚠️ Discovery failed, continuing with {} known records: {}", inner.registry.len(), e);
            report.discovery_error = Some(e.to_string());
        }

        let batch = inner.registry.next_batch(inner.settings.batch_size);
        report.batch_size = batch.len();

        let ledger = inner.ledger.as_ref();
        let snapshots: Vec<_> = stream::iter(batch)
            .map(|(id, address)| async move { (id, address, ledger.fetch_account(&address).await) })
            .buffer_unordered(inner.settings.concurrency.max(1))
            .collect()
            .await;

        // Evaluating
        self.set_phase(CyclePhase::Evaluating);
        let now = Utc::now().timestamp();
        let mut eligible = Vec::new();

        for (id, address, fetched) in snapshots {
            match fetched {
                Ok(None) => {
                    inner.registry.remove(&id);
                    self.drop_claims(&address);
                    report.removed += 1;
                    info!("🗑️ Record {} no longer exists on the ledger, dropped", address);
                    continue;
                }
                Ok(Some(account)) => match inner.program.decode(address, &account) {
                    Ok(record) => {
                        inner.registry.add(record, now);
                    }
                    Err(e) => inner.registry.mark_failed(&id, e.to_string(), now),
                },
                Err(e) => debug!("Refresh of {} failed, using cached snapshot: {}", address, e),
            }

            let Some(entry) = inner.registry.get(&id) else {
                continue;
            };
            let evaluation = assess(&entry.record, entry.failure.as_ref(), now);
            report.states.record(evaluation.state);

            match evaluation.state {
                EligibilityState::Executed => {
                    self.retire(&id, &address);
                    debug!("Record {} already executed, retired", address);
                }
                EligibilityState::Failed => {
                    if entry.failure.is_none() {
                        inner.registry.mark_failed(&id, evaluation.reason.clone(), now);
                    }
                    warn!(record = %address, reason = %evaluation.reason, "❌ Record excluded from automatic execution");
                }
                EligibilityState::Eligible => eligible.push(entry),
                EligibilityState::Active | EligibilityState::Inactive => {}
            }
        }

        // Unknown outcomes from earlier cycles are re-checked before any
        // re-submission
        let mut ready = Vec::with_capacity(eligible.len());
        for entry in eligible {
            let Some(pending) = entry.pending.clone() else {
                ready.push(entry);
                continue;
            };
            match self.resolve_pending(&entry, &pending, now).await {
                PendingResolution::Landed => {
                    self.retire(&entry.record.id(), &entry.record.address);
                    report.executed += 1;
                }
                PendingResolution::Cleared => {
                    inner.registry.clear_pending(&entry.record.id());
                    ready.push(entry);
                }
                PendingResolution::Wait => report.deferred += 1,
            }
        }

        if !ready.is_empty() {
            self.set_phase(CyclePhase::Executing);
            match inner.settings.mode {
                ExecutionMode::PrepareClaim => self.prepare_batch(ready, now, &mut report).await,
                ExecutionMode::AutoExecute => {
                    self.execute_batch(ready, now, deadline, &mut report).await
                }
            }
        }

        // Reporting
        self.set_phase(CyclePhase::Reporting);
        report.monitored = inner.registry.len();
        report.finished_at = Utc::now();

        info!(
            cycle_id = %report.cycle_id,
            monitored = report.monitored,
            active = report.states.active,
            inactive = report.states.inactive,
            eligible = report.states.eligible,
            failed_records = report.states.failed,
            executed = report.executed,
            failed = report.failed,
            unknown = report.unknown,
            deferred = report.deferred,
            prepared_claims = report.prepared_claims,
            funding_skipped = report.funding_skipped,
            "📊 Cycle complete"
        );

        let mut state = inner.state.write();
        state.last_cycle_at = Some(report.finished_at);
        state.last_report = Some(report.clone());
        state.phase = CyclePhase::Idle;
        report
    }

    async fn resolve_pending(
        &self,
        entry: &RegistryEntry,
        pending: &PendingSignature,
        now: i64,
    ) -> PendingResolution {
        let address = entry.record.address;
        match self.inner.ledger.signature_status(&pending.signature).await {
            Ok(state) if state.is_success() => {
                info!(record = %address, signature = %pending.signature, "✅ Earlier submission confirmed");
                PendingResolution::Landed
            }
            Ok(SignatureState::Failed(reason)) => {
                if FailureKind::classify(&reason) == FailureKind::AlreadyExecuted {
                    return PendingResolution::Landed;
                }
                info!(record = %address, "Earlier submission failed ({}), eligible for retry", reason);
                PendingResolution::Cleared
            }
            Ok(SignatureState::NotFound)
                if now - pending.submitted_at >= self.inner.settings.pending_ttl_secs =>
            {
                info!(record = %address, "Earlier submission expired unseen, eligible for retry");
                PendingResolution::Cleared
            }
            Ok(_) => {
                debug!(record = %address, "Earlier submission still unresolved");
                PendingResolution::Wait
            }
            Err(e) => {
                warn!(record = %address, "Cannot check earlier submission: {}", e);
                PendingResolution::Wait
            }
        }
    }

    /// Heir self-claim mode: no keeper funds are spent
    async fn prepare_batch(&self, ready: Vec<RegistryEntry>, now: i64, report: &mut CycleReport) {
        let refresh = self.inner.settings.claim_refresh_secs;

        for entry in ready {
            if matches!(entry.claim_prepared_at, Some(at) if now - at < refresh) {
                continue;
            }

            let id = entry.record.id();
            let outcome = match self.prepare_claims(&entry.record).await {
                Ok(claims) => {
                    let count = claims.len();
                    let mut stored = self.inner.claims.write();
                    stored.retain(|c| c.record != entry.record.address);
                    stored.extend(claims);
                    RecordOutcome::ClaimsPrepared {
                        record: entry.record.address,
                        claims: count,
                    }
                }
                Err(e) => RecordOutcome::Failed {
                    record: entry.record.address,
                    kind: e.kind(),
                    reason: e.to_string(),
                    terminal: false,
                },
            };
            self.apply_outcome(&id, &outcome, now);
            report.absorb(&outcome);
        }
    }

    /// One unsigned claim per heir, paid and signed by that heir
    pub async fn prepare_claims(
        &self,
        record: &InheritanceRecord,
    ) -> Result<Vec<PreparedClaim>, DeliveryError> {
        let inner = &self.inner;
        let blockhash = inner
            .ledger
            .latest_blockhash()
            .await
            .map_err(|e| DeliveryError::Blockhash(e.to_string()))?;
        let fees = inner.router.fees();
        let prepared_at = Utc::now();

        record
            .heirs()
            .into_iter()
            .map(|heir| {
                let skeleton = TxSkeleton::new(
                    vec![inner.program.claim_instruction(record, &heir)],
                    heir,
                    DeliveryContext {
                        transaction_type: TransactionType::HeirClaim,
                        priority: PriorityClass::Normal,
                        estimated_value_sol: record.balance_sol().unwrap_or_default(),
                        tier: inner.settings.tier,
                    },
                );
                let optimized = skeleton.with_compute_budget(
                    fees.compute_unit_limit,
                    fees.base_price(PriorityClass::Normal),
                    blockhash,
                );

                info!(record = %record.address, heir = %heir, "📝 Claim prepared for heir");
                Ok(PreparedClaim {
                    record: record.address,
                    owner: record.owner,
                    heir,
                    fee_payer: heir,
                    unsigned_transaction_base64: encode_transaction(&optimized.transaction)?,
                    recent_blockhash: blockhash.to_string(),
                    prepared_at,
                })
            })
            .collect()
    }

    /// Keeper-signed execution in funding chunks
    async fn execute_batch(
        &self,
        ready: Vec<RegistryEntry>,
        now: i64,
        deadline: Instant,
        report: &mut CycleReport,
    ) {
        let inner = &self.inner;
        // Every record may spend its whole attempt budget before the next check
        let exposure = inner
            .router
            .fees()
            .worst_case_exposure(inner.settings.backoff.max_attempts);
        let mut queue: VecDeque<RegistryEntry> = ready.into();

        while !queue.is_empty() {
            if Instant::now() >= deadline {
                warn!("⏳ Cycle deadline reached, deferring {} records", queue.len());
                report.deferred += queue.len();
                break;
            }

            let balance = match inner.funding.ensure_funded().await {
                Ok(balance) => balance,
                Err(e) => {
                    error!(
                        "🚫 Funding unavailable, skipping {} eligible records until next cycle: {}",
                        queue.len(),
                        e
                    );
                    report.funding_skipped = true;
                    report.deferred += queue.len();
                    self.enter_cooldown();
                    break;
                }
            };

            let k = chunk_size(
                balance,
                inner.funding.minimum_balance(),
                exposure,
                inner.settings.concurrency,
            );
            let chunk: Vec<RegistryEntry> = queue.drain(..k.min(queue.len())).collect();
            debug!("Executing chunk of {} with balance {}", chunk.len(), balance);

            let outcomes: Vec<_> = stream::iter(chunk)
                .map(|entry| self.launch(entry, deadline))
                .buffer_unordered(inner.settings.concurrency.max(1))
                .collect()
                .await;

            for (id, outcome) in outcomes {
                match outcome {
                    Some(outcome) => {
                        self.apply_outcome(&id, &outcome, now);
                        report.absorb(&outcome);
                    }
                    None => report.deferred += 1,
                }
            }
        }
    }

    async fn launch(&self, entry: RegistryEntry, deadline: Instant) -> (RecordId, Option<RecordOutcome>) {
        let id = entry.record.id();
        if let Some(limiter) = &self.inner.limiter {
            limiter.until_ready().await;
        }
        if Instant::now() >= deadline {
            return (id, None);
        }

        let address = entry.record.address;
        let (submitted, _) = watch::channel(None);
        let outcome = match tokio::time::timeout(
            self.inner.settings.record_timeout,
            self.execute_record(&entry.record, &submitted),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                let signature = *submitted.borrow();
                warn!(
                    record = %address,
                    signature = ?signature,
                    "⏱️ Record handling timed out, abandoned for this cycle"
                );
                RecordOutcome::TimedOut {
                    record: address,
                    signature,
                }
            }
        };
        (id, Some(outcome))
    }

    /// Up to R delivery attempts for one record within this cycle
    #[instrument(skip_all, fields(record = %record.address))]
    async fn execute_record(
        &self,
        record: &InheritanceRecord,
        on_submit: &watch::Sender<Option<Signature>>,
    ) -> RecordOutcome {
        let inner = &self.inner;
        let skeleton = TxSkeleton::new(
            vec![inner.program.execute_instruction(record, &inner.keeper_pubkey)],
            inner.keeper_pubkey,
            DeliveryContext {
                transaction_type: TransactionType::InheritanceExecution,
                priority: PriorityClass::Normal,
                estimated_value_sol: record.balance_sol().unwrap_or_default(),
                tier: inner.settings.tier,
            },
        );

        debug!(
            "Estimated fee {} lamports",
            inner.router.estimate_cost(&skeleton.context).total
        );

        let skeleton = &skeleton;
        let router = &inner.router;
        let delivered = inner
            .settings
            .backoff
            .retry(
                "execute_record",
                |_| async move {
                    let outcome = router.deliver_tracked(skeleton, on_submit).await?;
                    match &outcome.confirmation {
                        ConfirmationOutcome::Failed(reason) => Err(DeliveryError::ExecutionFailed {
                            signature: outcome.signature.to_string(),
                            reason: reason.clone(),
                        }),
                        _ => Ok(outcome),
                    }
                },
                DeliveryError::is_retryable,
            )
            .await;

        match delivered {
            Ok(outcome) if outcome.success => {
                let result = ExecutionResult::from_record(
                    record,
                    outcome.signature,
                    outcome.route_used,
                    outcome.elapsed_ms,
                    outcome.escalated,
                );
                info!(
                    owner = %result.owner,
                    amount = result.amount_distributed,
                    heirs = result.heir_count,
                    signature = %result.signature,
                    route = %result.route,
                    "✅ Inheritance executed"
                );
                RecordOutcome::Executed(result)
            }
            Ok(outcome) => {
                warn!(
                    signature = %outcome.signature,
                    "❓ Outcome unknown after confirmation timeout, will re-check before re-submitting"
                );
                RecordOutcome::Unknown {
                    record: record.address,
                    signature: outcome.signature,
                }
            }
            Err(e) => {
                let kind = e.kind();
                let terminal = matches!(
                    kind,
                    FailureKind::AlreadyExecuted
                        | FailureKind::InvalidRecord
                        | FailureKind::AuthorizationRejected
                );
                error!(kind = ?kind, terminal, "❌ Execution failed: {}", e);
                RecordOutcome::Failed {
                    record: record.address,
                    kind,
                    reason: e.to_string(),
                    terminal,
                }
            }
        }
    }

    fn apply_outcome(&self, id: &RecordId, outcome: &RecordOutcome, now: i64) {
        let registry = &self.inner.registry;
        match outcome {
            RecordOutcome::Executed(_)
            | RecordOutcome::Failed {
                kind: FailureKind::AlreadyExecuted,
                ..
            } => self.retire(id, &outcome.record()),
            RecordOutcome::Unknown { signature, .. }
            | RecordOutcome::TimedOut {
                signature: Some(signature),
                ..
            } => registry.mark_pending(id, *signature, now),
            RecordOutcome::Failed {
                reason,
                terminal: true,
                ..
            } => registry.mark_failed(id, reason.clone(), now),
            RecordOutcome::Failed { .. } | RecordOutcome::TimedOut { .. } => {
                let failures = registry.record_attempt_failure(id);
                debug!("Record {} has failed {} consecutive cycles", id, failures);
            }
            RecordOutcome::ClaimsPrepared { .. } => registry.mark_claim_prepared(id, now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LedgerError;
    use crate::execution::{
        optimizer::decode_transaction, ConfirmationSettings, FeePolicy, KeypairSigner, Route,
        RoutingPolicy,
    };
    use crate::funding::{FundingSettings, TopUp};
    use crate::ledger::mock::MockLedger;
    use crate::ledger::models::{HeirAllocation, RecordKind, LAMPORTS_PER_SOL};
    use rust_decimal_macros::dec;
    use solana_sdk::signature::{Keypair, Signer};
    use std::sync::atomic::Ordering;

    const DAY: i64 = 86_400;

    fn backoff() -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: 3,
            base_delay_ms: 10,
            jitter: 0.0,
            ..BackoffPolicy::default()
        }
    }

    fn settings(mode: ExecutionMode) -> KeeperSettings {
        KeeperSettings {
            mode,
            batch_size: 10,
            concurrency: 3,
            poll_interval: Duration::from_secs(30),
            record_timeout: Duration::from_secs(10),
            cycle_deadline: Duration::from_secs(120),
            launch_stagger: Duration::ZERO,
            claim_refresh_secs: 60,
            pending_ttl_secs: 120,
            funding_cooldown: Duration::from_secs(300),
            backoff: backoff(),
            tier: AccountTier::Free,
            targets: Vec::new(),
        }
    }

    struct Harness {
        keeper: Keeper,
        ledger: Arc<MockLedger>,
        program: InheritanceProgram,
        operator: Pubkey,
    }

    fn harness(mode: ExecutionMode) -> Harness {
        harness_with(settings(mode), InheritanceProgram::new(Pubkey::new_unique()))
    }

    fn harness_with(settings: KeeperSettings, program: InheritanceProgram) -> Harness {
        let ledger = Arc::new(MockLedger::new());
        let keypair = Arc::new(Keypair::new());
        let operator = keypair.pubkey();
        ledger.set_balance(operator, 10 * LAMPORTS_PER_SOL);

        let router = DeliveryRouter::new(
            ledger.clone(),
            Arc::new(KeypairSigner::new(keypair)),
            RoutingPolicy {
                high_value_threshold_sol: dec!(100),
            },
            FeePolicy::default(),
            backoff(),
            ConfirmationSettings {
                timeout: Duration::from_secs(2),
                poll_interval: Duration::from_millis(100),
            },
        );
        let funding = FundingGuard::new(
            ledger.clone(),
            operator,
            TopUp::Airdrop,
            FundingSettings {
                minimum_balance: LAMPORTS_PER_SOL / 10,
                top_up_amount: LAMPORTS_PER_SOL,
                backoff: backoff(),
                airdrop_allowed: true,
                settle_checks: 2,
                settle_interval: Duration::from_millis(10),
            },
        );

        let keeper = Keeper::new(settings, ledger.clone(), program.clone(), router, funding);
        Harness {
            keeper,
            ledger,
            program,
            operator,
        }
    }

    fn now() -> i64 {
        Utc::now().timestamp()
    }

    fn native(program: &InheritanceProgram, last_active: i64, balance: u64) -> InheritanceRecord {
        let owner = Pubkey::new_unique();
        let heir = Pubkey::new_unique();
        InheritanceRecord {
            address: program.record_address(&RecordId::Native { owner, heir }),
            owner,
            kind: RecordKind::Native { heir },
            inactivity_period_secs: DAY,
            last_active_at: last_active,
            is_executed: false,
            balance,
        }
    }

    fn multi_heir(program: &InheritanceProgram, shares: &[u8], balance: u64) -> InheritanceRecord {
        let owner = Pubkey::new_unique();
        InheritanceRecord {
            address: program.smart_wallet_address(&owner),
            owner,
            kind: RecordKind::MultiHeir {
                allocations: shares
                    .iter()
                    .map(|&percentage| HeirAllocation {
                        heir: Pubkey::new_unique(),
                        percentage,
                    })
                    .collect(),
            },
            inactivity_period_secs: DAY,
            last_active_at: now() - 90_000,
            is_executed: false,
            balance,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_c_reported_amounts_follow_allocations() {
        let h = harness(ExecutionMode::AutoExecute);
        let record = multi_heir(&h.program, &[70, 30], LAMPORTS_PER_SOL);
        h.ledger.put_record(&h.program, &record);

        let report = h.keeper.manual_check().await;

        assert_eq!(report.executed, 1);
        let result = &report.results[0];
        let amounts: Vec<u64> = result.distribution.iter().map(|p| p.amount).collect();
        assert_eq!(amounts, vec![700_000_000, 300_000_000]);
        assert_eq!(result.amount_distributed, LAMPORTS_PER_SOL);
        assert_eq!(result.heir_count, 2);
        assert_eq!(result.owner, record.owner);
        assert!(h.keeper.registry().is_empty());
        assert_eq!(h.ledger.submitted_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_c_amounts_independent_of_route() {
        let h = harness(ExecutionMode::AutoExecute);
        let record = multi_heir(&h.program, &[70, 30], LAMPORTS_PER_SOL);
        h.ledger.put_record(&h.program, &record);
        h.ledger.script_submit(Err(LedgerError::rpc("Blockhash not found")));

        let report = h.keeper.manual_check().await;

        let result = &report.results[0];
        assert!(result.escalated);
        assert_eq!(result.route, Route::Standard);
        let amounts: Vec<u64> = result.distribution.iter().map(|p| p.amount).collect();
        assert_eq!(amounts, vec![700_000_000, 300_000_000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_e_underfunded_batch_is_skipped_not_crashed() {
        let h = harness(ExecutionMode::AutoExecute);
        h.ledger.set_balance(h.operator, 1_000);
        *h.ledger.airdrop_fails.lock() = true;
        h.ledger
            .put_record(&h.program, &native(&h.program, now() - 90_000, LAMPORTS_PER_SOL));

        let report = h.keeper.manual_check().await;

        assert!(report.funding_skipped);
        assert_eq!(report.deferred, 1);
        assert_eq!(h.ledger.attempts(), 0);
        assert_eq!(h.keeper.registry().len(), 1);
        assert!(h.keeper.get_status().cooldown_until.is_some());

        // the loop keeps ticking through the cooldown
        h.keeper.start().unwrap();
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert!(h.keeper.get_status().running);
        h.keeper.stop().await;
        assert!(!h.keeper.get_status().running);

        // once funds arrive the next check executes
        *h.ledger.airdrop_fails.lock() = false;
        let report = h.keeper.manual_check().await;
        assert_eq!(report.executed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_outcome_is_rechecked_not_resubmitted() {
        let h = harness(ExecutionMode::AutoExecute);
        h.ledger.set_default_status(SignatureState::Pending);
        let record = native(&h.program, now() - 90_000, LAMPORTS_PER_SOL);
        h.ledger.put_record(&h.program, &record);

        let report = h.keeper.manual_check().await;
        assert_eq!(report.unknown, 1);
        assert_eq!(report.executed, 0);
        assert_eq!(h.ledger.submitted_count(), 1);
        let entry = h.keeper.registry().get(&record.id()).unwrap();
        assert!(entry.pending.is_some());

        // still unresolved: deferred, no second submission
        let report = h.keeper.manual_check().await;
        assert_eq!(report.deferred, 1);
        assert_eq!(h.ledger.submitted_count(), 1);

        h.ledger.set_default_status(SignatureState::Confirmed);
        let report = h.keeper.manual_check().await;
        assert_eq!(report.executed, 1);
        assert_eq!(h.ledger.submitted_count(), 1);
        assert!(h.keeper.registry().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_structurally_invalid_record_is_excluded() {
        let h = harness(ExecutionMode::AutoExecute);
        let invalid = multi_heir(&h.program, &[60, 30], LAMPORTS_PER_SOL);
        h.ledger.put_record(&h.program, &invalid);

        let report = h.keeper.manual_check().await;
        assert_eq!(report.states.failed, 1);
        assert_eq!(h.ledger.attempts(), 0);
        assert_eq!(h.keeper.get_status().failed_count, 1);

        let status = h.keeper.get_record_status(&invalid.address).await.unwrap();
        assert_eq!(status.state, EligibilityState::Failed);
        assert!(!status.eligible);

        // excluded from later batches too
        let report = h.keeper.manual_check().await;
        assert_eq!(report.batch_size, 0);
        assert_eq!(h.ledger.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_authorization_rejection_is_terminal() {
        let h = harness(ExecutionMode::AutoExecute);
        let record = native(&h.program, now() - 90_000, LAMPORTS_PER_SOL);
        h.ledger.put_record(&h.program, &record);
        h.ledger
            .script_submit(Err(LedgerError::rpc("custom program error: 0x1770")));

        let report = h.keeper.manual_check().await;

        assert_eq!(report.failed, 1);
        assert_eq!(h.ledger.attempts(), 1);
        assert!(h.keeper.registry().get(&record.id()).unwrap().failure.is_some());

        h.keeper.reset_failure(&record.address).unwrap();
        let report = h.keeper.manual_check().await;
        assert_eq!(report.executed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_leave_record_for_next_cycle() {
        let h = harness(ExecutionMode::AutoExecute);
        let record = native(&h.program, now() - 90_000, LAMPORTS_PER_SOL);
        h.ledger.put_record(&h.program, &record);
        for _ in 0..6 {
            h.ledger.script_submit(Err(LedgerError::rpc("503 Service Unavailable")));
        }

        let report = h.keeper.manual_check().await;

        assert_eq!(report.failed, 1);
        // three attempts, each with one escalated fallback
        assert_eq!(h.ledger.attempts(), 6);
        let entry = h.keeper.registry().get(&record.id()).unwrap();
        assert!(entry.failure.is_none());
        assert_eq!(entry.consecutive_failures, 1);

        let report = h.keeper.manual_check().await;
        assert_eq!(report.executed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_executed_elsewhere_retires_record() {
        let h = harness(ExecutionMode::AutoExecute);
        let record = native(&h.program, now() - 90_000, LAMPORTS_PER_SOL);
        h.ledger.put_record(&h.program, &record);
        h.ledger
            .set_default_status(SignatureState::Failed("custom program error: 0x1771".to_string()));

        let report = h.keeper.manual_check().await;

        assert_eq!(report.failed, 1);
        assert_eq!(h.ledger.attempts(), 1);
        assert!(h.keeper.registry().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_account_is_dropped() {
        let h = harness(ExecutionMode::AutoExecute);
        let record = native(&h.program, now(), LAMPORTS_PER_SOL);
        h.ledger.put_record(&h.program, &record);

        let report = h.keeper.manual_check().await;
        assert_eq!(report.states.active, 1);
        assert_eq!(h.keeper.registry().len(), 1);

        h.ledger.remove_account(&record.address);
        let report = h.keeper.manual_check().await;
        assert_eq!(report.removed, 1);
        assert!(h.keeper.registry().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_and_empty_records_are_not_executed() {
        let h = harness(ExecutionMode::AutoExecute);
        h.ledger
            .put_record(&h.program, &native(&h.program, now() - 3_600, LAMPORTS_PER_SOL));
        h.ledger
            .put_record(&h.program, &native(&h.program, now() - 90_000, 0));

        let report = h.keeper.manual_check().await;

        assert_eq!(report.states.active, 1);
        assert_eq!(report.states.inactive, 1);
        assert_eq!(h.ledger.attempts(), 0);
        assert_eq!(h.keeper.get_status().monitored_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prepare_claim_mode_emits_unsigned_claims_per_heir() {
        let h = harness(ExecutionMode::PrepareClaim);
        h.ledger.set_balance(h.operator, 0);
        let record = multi_heir(&h.program, &[50, 50], LAMPORTS_PER_SOL);
        h.ledger.put_record(&h.program, &record);

        let report = h.keeper.manual_check().await;

        assert_eq!(report.prepared_claims, 2);
        assert_eq!(h.ledger.attempts(), 0);
        assert_eq!(h.ledger.airdrops.load(Ordering::SeqCst), 0);

        let claims = h.keeper.prepared_claims();
        assert_eq!(claims.len(), 2);
        for (claim, heir) in claims.iter().zip(record.heirs()) {
            assert_eq!(claim.heir, heir);
            assert_eq!(claim.fee_payer, heir);
            let tx = decode_transaction(&claim.unsigned_transaction_base64).unwrap();
            assert_eq!(tx.message.account_keys[0], heir);
            assert!(tx.signatures.iter().all(|s| *s == Default::default()));
        }

        // not re-issued before the refresh window
        let report = h.keeper.manual_check().await;
        assert_eq!(report.prepared_claims, 0);
        assert_eq!(h.keeper.prepared_claims().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_status_matches_execution_gate() {
        let h = harness(ExecutionMode::AutoExecute);
        let record = native(&h.program, now() - 3_600, 5 * LAMPORTS_PER_SOL / 2);
        h.ledger.put_record(&h.program, &record);

        let status = h.keeper.get_record_status(&record.address).await.unwrap();
        assert_eq!(status.state, EligibilityState::Active);
        assert_eq!(status.balance_sol, Some(dec!(2.5)));
        assert!(status.time_remaining_secs > 0);

        assert!(matches!(
            h.keeper.get_record_status(&Pubkey::new_unique()).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_targets_limit_monitoring() {
        let program = InheritanceProgram::new(Pubkey::new_unique());
        let watched = native(&program, now(), LAMPORTS_PER_SOL);
        let ignored = native(&program, now(), LAMPORTS_PER_SOL);

        let mut targeted = settings(ExecutionMode::AutoExecute);
        targeted.targets = vec![watched.address];
        let h = harness_with(targeted, program);
        h.ledger.put_record(&h.program, &watched);
        h.ledger.put_record(&h.program, &ignored);

        h.keeper.manual_check().await;
        let monitored: Vec<Pubkey> = h.keeper.list_records().iter().map(|s| s.address).collect();
        assert_eq!(monitored, vec![watched.address]);
    }

    fn put_eligible(h: &Harness, count: usize) -> Vec<InheritanceRecord> {
        (0..count)
            .map(|_| {
                let record = native(&h.program, now() - 90_000, LAMPORTS_PER_SOL);
                h.ledger.put_record(&h.program, &record);
                record
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_claims_withdrawn_when_record_executed_or_closed() {
        let h = harness(ExecutionMode::PrepareClaim);
        let wallet = multi_heir(&h.program, &[50, 50], LAMPORTS_PER_SOL);
        let single = native(&h.program, now() - 90_000, LAMPORTS_PER_SOL);
        h.ledger.put_record(&h.program, &wallet);
        h.ledger.put_record(&h.program, &single);

        h.keeper.manual_check().await;
        assert_eq!(h.keeper.prepared_claims().len(), 3);

        // one heir claimed the wallet, the other record was closed
        h.ledger.put_record(
            &h.program,
            &InheritanceRecord {
                is_executed: true,
                ..wallet.clone()
            },
        );
        h.ledger.remove_account(&single.address);

        h.keeper.manual_check().await;
        assert!(h.keeper.registry().is_empty());
        assert!(h.keeper.prepared_claims().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_before_submission_counts_as_failed_attempt() {
        let h = harness(ExecutionMode::AutoExecute);
        let record = put_eligible(&h, 1).remove(0);
        h.ledger.set_submit_delay(Duration::from_secs(30));

        let report = h.keeper.manual_check().await;

        assert_eq!(report.timed_out, 1);
        assert_eq!(report.executed, 0);
        let entry = h.keeper.registry().get(&record.id()).unwrap();
        assert!(entry.pending.is_none());
        assert_eq!(entry.consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_after_submission_keeps_signature_for_recheck() {
        let mut short = settings(ExecutionMode::AutoExecute);
        // shorter than the 2s confirmation window
        short.record_timeout = Duration::from_secs(1);
        let h = harness_with(short, InheritanceProgram::new(Pubkey::new_unique()));
        let record = put_eligible(&h, 1).remove(0);
        h.ledger.set_default_status(SignatureState::Pending);

        let report = h.keeper.manual_check().await;
        assert_eq!(report.timed_out, 1);
        assert_eq!(h.ledger.submitted_count(), 1);
        let pending = h.keeper.registry().get(&record.id()).unwrap().pending.unwrap();
        assert_eq!(
            Some(pending.signature),
            h.ledger.submitted.lock()[0].signatures.first().copied()
        );

        // the earlier signature is consulted before anything is sent again
        let report = h.keeper.manual_check().await;
        assert_eq!(report.deferred, 1);
        assert_eq!(h.ledger.submitted_count(), 1);

        h.ledger.set_default_status(SignatureState::Confirmed);
        let report = h.keeper.manual_check().await;
        assert_eq!(report.executed, 1);
        assert_eq!(h.ledger.submitted_count(), 1);
        assert!(h.keeper.registry().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_deadline_defers_unlaunched_records() {
        let mut tight = settings(ExecutionMode::AutoExecute);
        tight.concurrency = 1;
        tight.cycle_deadline = Duration::from_secs(5);
        let h = harness_with(tight, InheritanceProgram::new(Pubkey::new_unique()));
        put_eligible(&h, 4);
        h.ledger.set_submit_delay(Duration::from_secs(3));

        let report = h.keeper.manual_check().await;

        // one record every 3s: launches at 0s and 3s, then the deadline passes
        assert_eq!(report.executed, 2);
        assert_eq!(report.deferred, 2);
        assert_eq!(h.ledger.attempts(), 2);
        assert_eq!(h.keeper.registry().len(), 2);

        let report = h.keeper.manual_check().await;
        assert_eq!(report.executed, 2);
        assert!(h.keeper.registry().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_funding_rechecked_before_each_chunk() {
        // headroom for three transactions, not for one record's whole
        // attempt budget: one record per funding check
        let h = harness(ExecutionMode::AutoExecute);
        let fee = FeePolicy::default().worst_case_fee();
        h.ledger.set_balance(h.operator, LAMPORTS_PER_SOL / 10 + 3 * fee);
        put_eligible(&h, 4);

        let report = h.keeper.manual_check().await;
        assert_eq!(report.executed, 4);
        assert_eq!(h.ledger.balance_checks(), 4);

        // ample headroom: chunks are bounded by the concurrency cap of 3
        let h = harness(ExecutionMode::AutoExecute);
        put_eligible(&h, 4);

        let report = h.keeper.manual_check().await;
        assert_eq!(report.executed, 4);
        assert_eq!(h.ledger.balance_checks(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_cap_bounds_in_flight_submissions() {
        let h = harness(ExecutionMode::AutoExecute);
        put_eligible(&h, 7);
        h.ledger.set_submit_delay(Duration::from_secs(1));

        let report = h.keeper.manual_check().await;

        assert_eq!(report.executed, 7);
        assert_eq!(h.ledger.max_in_flight(), 3);
    }
}
