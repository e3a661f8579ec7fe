use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use solana_sdk::transaction::Transaction;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::{error::DeliveryError, execution::router::PriorityClass};

/// Request sent to the remote transaction builder
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationRequest {
    /// Unsigned transaction, bincode + base64
    pub transaction: String,
    pub fee_payer: String,
    pub priority_level: PriorityClass,
    /// Floor for the compute-unit price the builder may pick
    pub min_compute_unit_price: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationResponse {
    /// Optimized unsigned transaction, bincode + base64
    pub transaction: String,
}

/// Remote fee/compute-budget optimizer used by the enhanced route
#[async_trait]
pub trait TransactionOptimizer: Send + Sync {
    async fn optimize(&self, request: &OptimizationRequest) -> Result<OptimizationResponse, DeliveryError>;
}

pub fn encode_transaction(transaction: &Transaction) -> Result<String, DeliveryError> {
    let bytes = bincode::serialize(transaction)
        .map_err(|e| DeliveryError::Builder(format!("failed to serialize transaction: {}", e)))?;
    Ok(BASE64.encode(bytes))
}

/// Decode a builder-produced transaction.
///
/// Anything that does not decode cleanly is `MalformedBuilderResponse`; it
/// is never forwarded.
pub fn decode_transaction(encoded: &str) -> Result<Transaction, DeliveryError> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| DeliveryError::MalformedBuilderResponse(format!("invalid base64: {}", e)))?;

    let transaction: Transaction = bincode::deserialize(&bytes)
        .map_err(|e| DeliveryError::MalformedBuilderResponse(format!("invalid transaction: {}", e)))?;

    if transaction.message.account_keys.is_empty() {
        return Err(DeliveryError::MalformedBuilderResponse(
            "transaction has no account keys".to_string(),
        ));
    }

    Ok(transaction)
}

/// HTTP builder endpoint
pub struct HttpOptimizer {
    client: Client,
    url: String,
}

impl HttpOptimizer {
    pub fn new(url: String, timeout: Duration) -> Result<Self, DeliveryError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DeliveryError::Builder(e.to_string()))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl TransactionOptimizer for HttpOptimizer {
    #[instrument(skip(self, request), fields(fee_payer = %request.fee_payer))]
    async fn optimize(&self, request: &OptimizationRequest) -> Result<OptimizationResponse, DeliveryError> {
        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| DeliveryError::Builder(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryError::Builder(format!("{} {}", status, body)));
        }

        let body = response
            .text()
            .await
            .map_err(|e| DeliveryError::Builder(format!("failed to read response: {}", e)))?;

        debug!("Builder responded with {} bytes", body.len());

        serde_json::from_str(&body)
            .map_err(|e| DeliveryError::MalformedBuilderResponse(format!("invalid JSON: {}", e)))
    }
}
