use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use solana_sdk::pubkey::Pubkey;
use thiserror::Error;

use crate::{execution::router::Route, ledger::program};

/// Top-level error type for the entire keeper
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Funding error: {0}")]
    Funding(#[from] FundingError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// How a failed ledger interaction should be treated.
///
/// Only the first three kinds are safe to retry; everything else is terminal
/// for the current attempt sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The transaction's recent blockhash is no longer valid
    ExpiredBlockhash,
    /// The endpoint throttled us (HTTP 429 and friends)
    RateLimited,
    /// Timeouts, connection resets, 5xx responses
    Transient,
    /// Signature or authority rejected by the cluster or the program
    AuthorizationRejected,
    /// The program reports the record was already executed
    AlreadyExecuted,
    /// The program reports the record itself is structurally invalid
    InvalidRecord,
    /// Any other rejection
    Rejected,
}

impl FailureKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FailureKind::ExpiredBlockhash | FailureKind::RateLimited | FailureKind::Transient
        )
    }

    /// Classify an RPC / program error message.
    ///
    /// Program error codes are matched first so that a custom error embedded
    /// in a generic "transaction failed" message is not mistaken for a
    /// transient failure.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();

        if let Some(kind) = program_error_code(&lower).and_then(program::failure_kind) {
            return kind;
        }

        let already_executed = [
            "alreadyexecuted",
            "alreadyprocessed",
            "already executed",
            "already been processed",
        ];
        if already_executed.iter().any(|p| lower.contains(p)) {
            return FailureKind::AlreadyExecuted;
        }

        let invalid_record = ["invalidallocation"];
        if invalid_record.iter().any(|p| lower.contains(p)) {
            return FailureKind::InvalidRecord;
        }

        let unauthorized = [
            "signature verification",
            "missing signature",
            "invalid signature",
            "unauthorized",
            "privilege escalation",
        ];
        if unauthorized.iter().any(|p| lower.contains(p)) {
            return FailureKind::AuthorizationRejected;
        }

        let expired = [
            "blockhash not found",
            "blockhashnotfound",
            "block height exceeded",
            "blockheightexceeded",
            "transaction expired",
        ];
        if expired.iter().any(|p| lower.contains(p)) {
            return FailureKind::ExpiredBlockhash;
        }

        let rate_limited = ["429", "too many requests", "rate limit"];
        if rate_limited.iter().any(|p| lower.contains(p)) {
            return FailureKind::RateLimited;
        }

        let transient = [
            "timeout",
            "timed out",
            "connection",
            "network",
            "temporarily unavailable",
            "node is behind",
            "unhealthy",
            "502",
            "503",
            "504",
        ];
        if transient.iter().any(|p| lower.contains(p)) {
            return FailureKind::Transient;
        }

        FailureKind::Rejected
    }
}

/// Custom program error code embedded in an RPC or status message, either as
/// `custom program error: 0x1771` or as `Custom(6001)`.
fn program_error_code(lower: &str) -> Option<u32> {
    if let Some(rest) = lower.split("custom program error: 0x").nth(1) {
        let hex: String = rest.chars().take_while(|c| c.is_ascii_hexdigit()).collect();
        return u32::from_str_radix(&hex, 16).ok();
    }
    let rest = lower.split("custom(").nth(1)?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Errors raised by the ledger client adapter
#[derive(Error, Debug, Clone)]
pub enum LedgerError {
    #[error("RPC request failed ({kind:?}): {message}")]
    Rpc { kind: FailureKind, message: String },

    #[error("Account {address} could not be decoded: {reason}")]
    Decode { address: Pubkey, reason: String },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

impl LedgerError {
    pub fn rpc(message: impl Into<String>) -> Self {
        let message = message.into();
        LedgerError::Rpc {
            kind: FailureKind::classify(&message),
            message,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            LedgerError::Rpc { kind, .. } => *kind,
            LedgerError::Decode { .. } => FailureKind::InvalidRecord,
            LedgerError::InvalidAddress(_) => FailureKind::Rejected,
        }
    }
}

/// Transaction delivery errors
#[derive(Error, Debug, Clone)]
pub enum DeliveryError {
    #[error("Submission via {route} failed ({kind:?}): {message}")]
    Submission {
        route: Route,
        kind: FailureKind,
        message: String,
    },

    #[error("Transaction builder request failed: {0}")]
    Builder(String),

    #[error("Transaction builder returned a malformed transaction: {0}")]
    MalformedBuilderResponse(String),

    #[error("Fee payer mismatch: expected {expected}, got {actual}")]
    FeePayerMismatch { expected: Pubkey, actual: Pubkey },

    /// SECURITY: the builder may only add compute budget instructions
    #[error("Transaction builder altered the program instructions: {0}")]
    InstructionMismatch(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Could not fetch a recent blockhash: {0}")]
    Blockhash(String),

    #[error("Ledger rejected transaction {signature}: {reason}")]
    ExecutionFailed { signature: String, reason: String },
}

impl DeliveryError {
    pub fn kind(&self) -> FailureKind {
        match self {
            DeliveryError::Submission { kind, .. } => *kind,
            DeliveryError::Builder(_) | DeliveryError::Blockhash(_) => FailureKind::Transient,
            DeliveryError::MalformedBuilderResponse(_)
            | DeliveryError::FeePayerMismatch { .. }
            | DeliveryError::InstructionMismatch(_) => FailureKind::Rejected,
            DeliveryError::Signing(_) => FailureKind::AuthorizationRejected,
            DeliveryError::ExecutionFailed { reason, .. } => FailureKind::classify(reason),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

/// Operating-account funding errors
#[derive(Error, Debug, Clone)]
pub enum FundingError {
    /// Fatal for the current batch: the keeper cannot pay fees
    #[error("Operating account {account} under-funded: {balance} < {minimum} lamports")]
    Underfunded {
        account: Pubkey,
        balance: u64,
        minimum: u64,
    },

    #[error("Top-up unavailable: {0}")]
    TopUpUnavailable(String),

    #[error("Top-up failed: {0}")]
    TopUpFailed(String),

    #[error("Balance check failed: {0}")]
    BalanceUnavailable(String),
}

impl FundingError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, FundingError::Underfunded { .. })
    }
}

/// Structural defects of an inheritance record
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Heir allocations sum to {total}, expected exactly 100")]
    AllocationSum { total: u32 },

    #[error("Record has no heirs")]
    NoHeirs,

    #[error("Heir {0} has a zero allocation")]
    ZeroAllocation(Pubkey),

    #[error("Heir {0} appears more than once")]
    DuplicateHeir(Pubkey),

    #[error("Inactivity period must be positive, got {0}s")]
    NonPositiveInactivity(i64),

    #[error("Unrecognized account layout: {0}")]
    UnknownLayout(String),
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code) = match &self {
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            AppError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "INVALID_INPUT"),
            AppError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "INVALID_RECORD"),
            AppError::Funding(_) => (StatusCode::SERVICE_UNAVAILABLE, "UNDERFUNDED"),
            AppError::Ledger(e) if e.kind().is_retryable() => {
                (StatusCode::BAD_GATEWAY, "LEDGER_UNAVAILABLE")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        let body = Json(ErrorResponse {
            error: self.to_string(),
            error_code: error_code.to_string(),
        });

        (status, body).into_response()
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(error: std::io::Error) -> Self {
        AppError::Internal(format!("I/O error: {:?}", error))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(error: reqwest::Error) -> Self {
        AppError::Delivery(DeliveryError::Builder(error.to_string()))
    }
}

/// Result type alias for the keeper
pub type AppResult<T> = Result<T, AppError>;
