use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use solana_sdk::{
    instruction::{AccountMeta, Instruction},
    message::Message,
    signature::Signature,
    transaction::Transaction,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::{
    error::DeliveryError,
    execution::{
        optimizer::{decode_transaction, encode_transaction, OptimizationRequest, TransactionOptimizer},
        pipeline::{
            compute_unit_price_of, ConfirmationOutcome, OptimizedTx, SignedTx, SubmittedTx,
            TxSkeleton,
        },
        signer::TransactionSigner,
    },
    ledger::client::{LedgerClient, SignatureState, SubmitOptions},
    retry::BackoffPolicy,
};

/// Lamports charged per signature
pub const BASE_FEE_PER_SIGNATURE: u64 = 5_000;

/// Primary submission plus one escalated fallback
pub const SUBMISSIONS_PER_DELIVERY: u64 = 2;

/// Submission path for a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    /// Plain RPC submission, keeper-chosen compute budget
    Standard,
    /// Builder-optimized compute budget, submitted through the enhanced endpoint
    Enhanced,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Standard => write!(f, "standard"),
            Route::Enhanced => write!(f, "enhanced"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RoutePlan {
    pub primary: Route,
    pub fallback: Route,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    /// Keeper-driven inheritance execution
    InheritanceExecution,
    /// Heir-signed claim prepared by the keeper
    HeirClaim,
    /// Operating-account top-up
    FundingTransfer,
}

impl TransactionType {
    pub fn is_critical(self) -> bool {
        matches!(self, TransactionType::InheritanceExecution)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    Low,
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountTier {
    Free,
    Pro,
    Enterprise,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryContext {
    pub transaction_type: TransactionType,
    pub priority: PriorityClass,
    pub estimated_value_sol: Decimal,
    pub tier: AccountTier,
}

/// Pure route selection.
///
/// No network access and no interior state: identical contexts always map to
/// identical plans.
#[derive(Debug, Clone)]
pub struct RoutingPolicy {
    pub high_value_threshold_sol: Decimal,
}

impl RoutingPolicy {
    pub fn choose_route(&self, context: &DeliveryContext) -> RoutePlan {
        const RELIABLE: RoutePlan = RoutePlan {
            primary: Route::Enhanced,
            fallback: Route::Standard,
        };

        // Critical types are never downgraded by tier
        if context.transaction_type.is_critical() {
            return RELIABLE;
        }

        if context.tier == AccountTier::Enterprise
            || context.priority == PriorityClass::High
            || context.estimated_value_sol >= self.high_value_threshold_sol
        {
            return RELIABLE;
        }

        match context.tier {
            AccountTier::Pro => RoutePlan {
                primary: Route::Standard,
                fallback: Route::Enhanced,
            },
            _ => RoutePlan {
                primary: Route::Standard,
                fallback: Route::Standard,
            },
        }
    }
}

/// Compute budget and priority-fee parameters
#[derive(Debug, Clone)]
pub struct FeePolicy {
    pub compute_unit_limit: u32,
    /// Micro-lamports per compute unit, per priority class
    pub low_compute_unit_price: u64,
    pub normal_compute_unit_price: u64,
    pub high_compute_unit_price: u64,
    pub escalation_multiplier: f64,
    pub max_compute_unit_price: u64,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            compute_unit_limit: 200_000,
            low_compute_unit_price: 1_000,
            normal_compute_unit_price: 10_000,
            high_compute_unit_price: 100_000,
            escalation_multiplier: 2.0,
            max_compute_unit_price: 1_000_000,
        }
    }
}

impl FeePolicy {
    pub fn base_price(&self, priority: PriorityClass) -> u64 {
        let price = match priority {
            PriorityClass::Low => self.low_compute_unit_price,
            PriorityClass::Normal => self.normal_compute_unit_price,
            PriorityClass::High => self.high_compute_unit_price,
        };
        price.min(self.max_compute_unit_price)
    }

    /// Next price level; always strictly higher unless already at the cap.
    pub fn escalate(&self, price: u64) -> u64 {
        let scaled = (price as f64 * self.escalation_multiplier.max(1.0)) as u64;
        scaled.max(price.saturating_add(1)).min(self.max_compute_unit_price)
    }

    pub fn priority_fee(&self, compute_unit_price: u64) -> u64 {
        let micro = u128::from(compute_unit_price) * u128::from(self.compute_unit_limit);
        micro.div_ceil(1_000_000) as u64
    }

    /// Upper bound on what one keeper transaction can cost
    pub fn worst_case_fee(&self) -> u64 {
        BASE_FEE_PER_SIGNATURE + self.priority_fee(self.max_compute_unit_price)
    }

    /// Upper bound on what `attempts` deliveries of one record can cost.
    ///
    /// Enhanced submissions skip preflight, so a transaction that lands and
    /// fails is still charged.
    pub fn worst_case_exposure(&self, attempts: u32) -> u64 {
        self.worst_case_fee()
            .saturating_mul(SUBMISSIONS_PER_DELIVERY * u64::from(attempts.max(1)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CostEstimate {
    pub base_fee: u64,
    pub extra_fee: u64,
    pub total: u64,
}

/// Result of one delivery through the router
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryOutcome {
    #[serde(with = "signature_string")]
    pub signature: Signature,
    pub route_used: Route,
    pub elapsed_ms: u64,
    pub success: bool,
    pub escalated: bool,
    pub confirmation: ConfirmationOutcome,
}

mod signature_string {
    use serde::Serializer;
    use solana_sdk::signature::Signature;

    pub fn serialize<S: Serializer>(signature: &Signature, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(signature)
    }
}

#[derive(Debug, Clone)]
pub struct ConfirmationSettings {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ConfirmationSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(45),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// DeliveryRouter - decides, builds, sends and confirms keeper transactions
///
/// SECURITY: the router never re-submits after an unknown confirmation
/// outcome; that decision belongs to the caller after a status re-check.
pub struct DeliveryRouter {
    ledger: Arc<dyn LedgerClient>,
    enhanced_ledger: Option<Arc<dyn LedgerClient>>,
    optimizer: Option<Arc<dyn TransactionOptimizer>>,
    signer: Arc<dyn TransactionSigner>,
    routing: RoutingPolicy,
    fees: FeePolicy,
    backoff: BackoffPolicy,
    confirmation: ConfirmationSettings,
}

impl DeliveryRouter {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        signer: Arc<dyn TransactionSigner>,
        routing: RoutingPolicy,
        fees: FeePolicy,
        backoff: BackoffPolicy,
        confirmation: ConfirmationSettings,
    ) -> Self {
        Self {
            ledger,
            enhanced_ledger: None,
            optimizer: None,
            signer,
            routing,
            fees,
            backoff,
            confirmation,
        }
    }

    pub fn with_optimizer(mut self, optimizer: Arc<dyn TransactionOptimizer>) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    pub fn with_enhanced_ledger(mut self, ledger: Arc<dyn LedgerClient>) -> Self {
        self.enhanced_ledger = Some(ledger);
        self
    }

    pub fn choose_route(&self, context: &DeliveryContext) -> RoutePlan {
        self.routing.choose_route(context)
    }

    pub fn fees(&self) -> &FeePolicy {
        &self.fees
    }

    /// Informational only; never consulted before executing.
    pub fn estimate_cost(&self, context: &DeliveryContext) -> CostEstimate {
        let price = self.fees.base_price(context.priority);
        let extra_fee = self.fees.priority_fee(price);
        CostEstimate {
            base_fee: BASE_FEE_PER_SIGNATURE,
            extra_fee,
            total: BASE_FEE_PER_SIGNATURE + extra_fee,
        }
    }

    /// Route actually used at send time; enhanced needs a builder.
    fn effective_route(&self, route: Route) -> Route {
        match route {
            Route::Enhanced if self.optimizer.is_none() => {
                debug!("No transaction builder configured, enhanced route degrades to standard");
                Route::Standard
            }
            other => other,
        }
    }

    /// Produce a fee-adjusted transaction for `route` with a fresh blockhash
    pub async fn build(
        &self,
        route: Route,
        skeleton: &TxSkeleton,
        compute_unit_price: u64,
    ) -> Result<OptimizedTx, DeliveryError> {
        match (route, &self.optimizer) {
            (Route::Enhanced, Some(optimizer)) => {
                self.build_enhanced(optimizer.as_ref(), skeleton, compute_unit_price)
                    .await
            }
            _ => {
                let blockhash = self.fresh_blockhash().await?;
                Ok(skeleton.with_compute_budget(
                    self.fees.compute_unit_limit,
                    compute_unit_price,
                    blockhash,
                ))
            }
        }
    }

    async fn build_enhanced(
        &self,
        optimizer: &dyn TransactionOptimizer,
        skeleton: &TxSkeleton,
        compute_unit_price: u64,
    ) -> Result<OptimizedTx, DeliveryError> {
        let draft = skeleton.unsigned(solana_hash::Hash::default());
        let request = OptimizationRequest {
            transaction: encode_transaction(&draft)?,
            fee_payer: skeleton.fee_payer.to_string(),
            priority_level: skeleton.context.priority,
            min_compute_unit_price: compute_unit_price,
        };

        let response = optimizer.optimize(&request).await?;
        let optimized = decode_transaction(&response.transaction)?;

        let mut message = optimized.message;
        let actual_payer = message.account_keys.first().copied().ok_or_else(|| {
            DeliveryError::MalformedBuilderResponse("transaction has no accounts".to_string())
        })?;
        if actual_payer != skeleton.fee_payer {
            return Err(DeliveryError::FeePayerMismatch {
                expected: skeleton.fee_payer,
                actual: actual_payer,
            });
        }

        // SECURITY: everything we sign besides the compute budget must be
        // exactly what the skeleton asked for
        let expected = program_instructions(&draft.message)?;
        let actual = program_instructions(&message)?;
        if actual != expected {
            warn!("🚨 Builder altered the program instructions, refusing to sign");
            return Err(DeliveryError::InstructionMismatch(format!(
                "{} instructions requested, {} returned, contents differ",
                expected.len(),
                actual.len()
            )));
        }

        // Builders may leave the blockhash for us to fill in
        if message.recent_blockhash == solana_hash::Hash::default() {
            message.recent_blockhash = self.fresh_blockhash().await?;
        }
        let recent_blockhash = message.recent_blockhash;

        // Drop any signatures the builder attached
        let transaction = Transaction::new_unsigned(message);
        let price = compute_unit_price_of(&transaction).unwrap_or(compute_unit_price);

        Ok(OptimizedTx {
            transaction,
            route: Route::Enhanced,
            compute_unit_price: price,
            recent_blockhash,
        })
    }

    async fn fresh_blockhash(&self) -> Result<solana_hash::Hash, DeliveryError> {
        self.ledger
            .latest_blockhash()
            .await
            .map_err(|e| DeliveryError::Blockhash(e.to_string()))
    }

    pub fn sign(&self, optimized: OptimizedTx) -> Result<SignedTx, DeliveryError> {
        optimized.sign(self.signer.as_ref())
    }

    /// Submit once via `signed.route`; failures are classified, not retried.
    #[instrument(skip(self, signed), fields(route = %signed.route))]
    pub async fn send(&self, signed: SignedTx) -> Result<SubmittedTx, DeliveryError> {
        let (client, options) = match signed.route {
            Route::Enhanced => (
                self.enhanced_ledger.as_ref().unwrap_or(&self.ledger),
                SubmitOptions {
                    skip_preflight: true,
                    max_retries: Some(0),
                },
            ),
            Route::Standard => (&self.ledger, SubmitOptions::default()),
        };

        let signature = client
            .submit_transaction(&signed.transaction, options)
            .await
            .map_err(|e| DeliveryError::Submission {
                route: signed.route,
                kind: e.kind(),
                message: e.to_string(),
            })?;

        Ok(signed.submitted(signature))
    }

    async fn build_sign_send(
        &self,
        route: Route,
        skeleton: &TxSkeleton,
        compute_unit_price: u64,
    ) -> Result<SubmittedTx, DeliveryError> {
        let optimized = self.build(route, skeleton, compute_unit_price).await?;
        let signed = self.sign(optimized)?;
        self.send(signed).await
    }

    /// Poll until confirmed, failed, or the timeout elapses.
    ///
    /// Only confirmed/finalized counts as success. Lookup errors are treated
    /// as "no answer yet" and polling continues.
    #[instrument(skip_all, fields(signature = %signature))]
    pub async fn confirm(&self, signature: &Signature) -> ConfirmationOutcome {
        let deadline = Instant::now() + self.confirmation.timeout;

        loop {
            match self.ledger.signature_status(signature).await {
                Ok(state) if state.is_success() => return ConfirmationOutcome::Confirmed,
                Ok(SignatureState::Failed(reason)) => return ConfirmationOutcome::Failed(reason),
                Ok(_) => {}
                Err(e) => debug!("Signature status lookup failed: {}", e),
            }

            if Instant::now() + self.confirmation.poll_interval > deadline {
                warn!(
                    "⏳ No confirmation within {}s",
                    self.confirmation.timeout.as_secs()
                );
                return ConfirmationOutcome::Unknown;
            }
            tokio::time::sleep(self.confirmation.poll_interval).await;
        }
    }

    /// Full delivery: primary route, then on a retryable failure exactly one
    /// escalated retry via the fallback route, then confirmation.
    pub async fn deliver(&self, skeleton: &TxSkeleton) -> Result<DeliveryOutcome, DeliveryError> {
        let (submitted, _) = watch::channel(None);
        self.deliver_tracked(skeleton, &submitted).await
    }

    /// [`deliver`](Self::deliver), publishing the signature as soon as it is
    /// accepted so a caller that gives up during confirmation still knows it.
    #[instrument(skip_all, fields(tx_type = ?skeleton.context.transaction_type))]
    pub async fn deliver_tracked(
        &self,
        skeleton: &TxSkeleton,
        on_submit: &watch::Sender<Option<Signature>>,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        let started = Instant::now();
        let plan = self.choose_route(&skeleton.context);
        let price = self.fees.base_price(skeleton.context.priority);
        let primary = self.effective_route(plan.primary);

        let (submitted, escalated) = match self.build_sign_send(primary, skeleton, price).await {
            Ok(submitted) => (submitted, false),
            Err(e) if e.is_retryable() => {
                let escalated_price = self.fees.escalate(price);
                let fallback = self.effective_route(plan.fallback);
                warn!(
                    "🔁 {} route failed ({:?}), escalating {} -> {} via {}",
                    primary,
                    e.kind(),
                    price,
                    escalated_price,
                    fallback
                );
                tokio::time::sleep(self.backoff.delay_for_attempt(0)).await;
                let submitted = self
                    .build_sign_send(fallback, skeleton, escalated_price)
                    .await?;
                (submitted, true)
            }
            Err(e) => return Err(e),
        };

        info!(
            "📤 Submitted {} via {} route (cu price {})",
            submitted.signature, submitted.route, submitted.compute_unit_price
        );
        on_submit.send_replace(Some(submitted.signature));

        let confirmation = self.confirm(&submitted.signature).await;
        let success = confirmation == ConfirmationOutcome::Confirmed;

        Ok(DeliveryOutcome {
            signature: submitted.signature,
            route_used: submitted.route,
            elapsed_ms: started.elapsed().as_millis() as u64,
            success,
            escalated,
            confirmation,
        })
    }
}

/// Non compute-budget instructions of a compiled message, with the account
/// privileges the message grants them.
fn program_instructions(message: &Message) -> Result<Vec<Instruction>, DeliveryError> {
    let key = |index: u8| {
        message.account_keys.get(index as usize).copied().ok_or_else(|| {
            DeliveryError::MalformedBuilderResponse(format!("account index {} out of range", index))
        })
    };

    let mut instructions = Vec::with_capacity(message.instructions.len());
    for ix in &message.instructions {
        let program_id = key(ix.program_id_index)?;
        if solana_compute_budget_interface::check_id(&program_id) {
            continue;
        }
        let accounts = ix
            .accounts
            .iter()
            .map(|&index| {
                Ok(AccountMeta {
                    pubkey: key(index)?,
                    is_signer: message.is_signer(index as usize),
                    is_writable: message.is_maybe_writable(index as usize, None),
                })
            })
            .collect::<Result<Vec<_>, DeliveryError>>()?;
        instructions.push(Instruction {
            program_id,
            accounts,
            data: ix.data.clone(),
        });
    }
    Ok(instructions)
}
