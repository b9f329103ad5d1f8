//! Health check endpoints

use super::{ApiResponse, ApiState};
use crate::Currency;
use axum::{extract::State, response::Json};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::warn;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Service version
    pub version: String,
    /// Whether each currency's pool can serve a new deal
    pub pools: BTreeMap<Currency, bool>,
}

/// Health check endpoint
pub async fn health_check(State(state): State<ApiState>) -> Json<ApiResponse<HealthResponse>> {
    let mut status = "healthy";
    let mut pools = BTreeMap::new();

    for currency in Currency::ALL {
        match state.app.pool.has_free(currency).await {
            Ok(available) => {
                pools.insert(currency, available);
            }
            Err(e) => {
                warn!("Health check could not query {} pool: {}", currency, e);
                status = "degraded";
            }
        }
    }

    let response = HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        pools,
    };

    Json(ApiResponse::success(response))
}
