use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use solana_sdk::pubkey::Pubkey;
use std::str::FromStr;
use tracing::{info, warn};

use super::models::*;
use crate::{
    error::{AppError, AppResult},
    keeper::{CycleReport, Keeper, RecordStatus},
};

#[derive(Clone)]
pub struct AppState {
    pub keeper: Keeper,
    pub operating_account: Pubkey,
}

fn parse_address(address: &str) -> AppResult<Pubkey> {
    Pubkey::from_str(address)
        .map_err(|e| AppError::InvalidInput(format!("invalid address {}: {}", address, e)))
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = state.keeper.get_status();
    let healthy = status.last_discovery_error.is_none() && status.cooldown_until.is_none();

    Json(HealthResponse {
        status: if healthy { "healthy" } else { "degraded" }.to_string(),
        timestamp: Utc::now(),
        keeper_running: status.running,
        discovery_error: status.last_discovery_error,
    })
}

/// GET /status
pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let operating_balance = match state.keeper.operating_balance().await {
        Ok(status) => Some(status),
        Err(e) => {
            warn!("Operating balance unavailable: {}", e);
            None
        }
    };

    Json(StatusResponse {
        keeper: state.keeper.get_status(),
        operating_account: state.operating_account.to_string(),
        operating_balance,
    })
}

/// GET /records
pub async fn list_records(State(state): State<AppState>) -> Json<RecordListResponse> {
    let records = state.keeper.list_records();
    Json(RecordListResponse {
        count: records.len(),
        records,
    })
}

/// GET /records/:address
pub async fn get_record_status(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> AppResult<Json<RecordStatus>> {
    let address = parse_address(&address)?;
    Ok(Json(state.keeper.get_record_status(&address).await?))
}

/// POST /records/:address/reset - operator override for a failed record
pub async fn reset_record(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> AppResult<Json<RecordStatus>> {
    let address = parse_address(&address)?;
    state.keeper.reset_failure(&address)?;
    Ok(Json(state.keeper.get_record_status(&address).await?))
}

/// GET /claims
pub async fn list_claims(State(state): State<AppState>) -> Json<ClaimListResponse> {
    let claims = state.keeper.prepared_claims();
    Json(ClaimListResponse {
        count: claims.len(),
        claims,
    })
}

/// POST /check - run one cycle now
pub async fn manual_check(State(state): State<AppState>) -> Json<CycleReport> {
    info!("Manual check via status API");
    Json(state.keeper.manual_check().await)
}
