use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    funding::FundingStatus,
    keeper::{KeeperStatus, PreparedClaim, RecordStatus},
};

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub keeper_running: bool,
    /// Set when the last ledger scan failed
    pub discovery_error: Option<String>,
}

/// GET /status
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub keeper: KeeperStatus,
    pub operating_account: String,
    /// Absent when the balance lookup failed
    pub operating_balance: Option<FundingStatus>,
}

/// GET /records
#[derive(Debug, Serialize)]
pub struct RecordListResponse {
    pub count: usize,
    pub records: Vec<RecordStatus>,
}

/// GET /claims
#[derive(Debug, Serialize)]
pub struct ClaimListResponse {
    pub count: usize,
    pub claims: Vec<PreparedClaim>,
}
