use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    api::handler::{
        get_record_status, get_status, health_check, list_claims, list_records, manual_check,
        reset_record, AppState,
    },
    error::{AppError, AppResult},
};

pub fn create_app(state: AppState) -> Router {
    info!("⚙️ Setting up status API routes...");

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/status", get(get_status))
        .route("/records", get(list_records))
        .route("/records/:address", get(get_record_status))
        .route("/records/:address/reset", post(reset_record))
        .route("/claims", get(list_claims))
        .route("/check", post(manual_check))
        .layer(CorsLayer::very_permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("✓ Status API routes configured");
    app
}

pub async fn run_server(app: Router, bind_address: &str) -> AppResult<()> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("🌐 Status API listening on: {}", bind_address);

    axum::serve(listener, app)
        .await
        .map_err(|e| AppError::Internal(format!("status API stopped: {}", e)))
}
