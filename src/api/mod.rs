//! HTTP API for the escrow service
//!
//! This module provides the RESTful surface a messaging front-end drives:
//! - Registering users and looking them up
//! - Creating deals and reporting payment / shipment
//! - Admin review: payment checks, confirmation, fund release
//! - Deposit address pool management

use crate::{EscrowApp, EscrowError};
use axum::{
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

mod admin;
mod deals;
mod health;
mod users;

pub use admin::*;
pub use deals::*;
pub use health::*;
pub use users::*;

/// API state shared across handlers
#[derive(Clone)]
pub struct ApiState {
    /// The escrow application
    pub app: EscrowApp,
}

/// Build the API router
pub fn build_router(app: EscrowApp) -> Router {
    let state = ApiState { app };

    Router::new()
        // Health check
        .route("/health", get(health_check))
        // Users
        .route("/v1/users", post(register_user))
        .route("/v1/users/by-username/:username", get(get_user_by_username))
        // Deals
        .route("/v1/deals", post(create_deal))
        .route("/v1/deals/:deal_id", get(get_deal))
        .route("/v1/deals/:deal_id/paid", post(report_paid))
        .route("/v1/deals/:deal_id/shipped", post(report_shipped))
        .route("/v1/deals/:deal_id/help", post(request_help))
        // Pool pre-flight
        .route("/v1/pool/:currency/available", get(pool_availability))
        // Admin
        .route("/v1/admin/deals", get(list_deals))
        .route("/v1/admin/deals/:deal_id/check", post(check_payment))
        .route("/v1/admin/deals/:deal_id/confirm", post(confirm_payment))
        .route("/v1/admin/deals/:deal_id/release", post(release_funds))
        .route("/v1/admin/pool/sweep", post(sweep_pool))
        .route("/v1/admin/pool/:currency", post(import_addresses))
        .with_state(state)
}

/// Start the HTTP API server with graceful shutdown
pub async fn serve_with_shutdown(
    app: EscrowApp,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let config = app.config.clone();

    let router = build_router(app);

    let router = if config.api.enable_cors {
        router.layer(CorsLayer::permissive())
    } else {
        router
    };

    let addr: std::net::SocketAddr = config
        .api
        .bind_address
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address: {}", e))?;

    info!("Starting HTTP API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
            info!("Received shutdown signal, stopping API server...");
        })
        .await?;

    info!("API server stopped gracefully");
    Ok(())
}

/// Standard API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// Whether the request was successful
    pub success: bool,
    /// Response data (only present if success is true)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Error message (only present if success is false)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    /// Create a successful response
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Create an error response
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Handler result: a status code plus the JSON envelope
pub type ApiReply<T> = (StatusCode, Json<ApiResponse<T>>);

/// Convert EscrowError to HTTP status code
pub fn error_to_status_code(err: &EscrowError) -> StatusCode {
    match err {
        EscrowError::Validation(_) => StatusCode::BAD_REQUEST,
        EscrowError::DealNotFound(_) | EscrowError::UserNotFound(_) => StatusCode::NOT_FOUND,
        EscrowError::IllegalTransition { .. } => StatusCode::CONFLICT,
        EscrowError::PoolExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
        EscrowError::DuplicateId(_)
        | EscrowError::IdSpaceExhausted(_)
        | EscrowError::Database(_)
        | EscrowError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Error reply for a failed operation
pub fn failure<T>(err: EscrowError) -> ApiReply<T> {
    let status = error_to_status_code(&err);
    if status.is_server_error() {
        warn!("API: request failed: {}", err);
    }
    (status, Json(ApiResponse::error(err.to_string())))
}

/// 403 reply
pub fn forbidden<T>(message: impl Into<String>) -> ApiReply<T> {
    (StatusCode::FORBIDDEN, Json(ApiResponse::error(message)))
}

/// Paginated response
#[derive(Debug, Serialize, Deserialize)]
pub struct PaginatedResponse<T> {
    /// Items for this page
    pub items: Vec<T>,
    /// Total number of items
    pub total: u64,
    /// Current page
    pub page: u32,
    /// Items per page
    pub per_page: u32,
    /// Total pages
    pub total_pages: u32,
}

impl<T> PaginatedResponse<T> {
    /// Slice one page out of the full item list
    pub fn paginate(all: Vec<T>, page: u32, per_page: u32) -> Self {
        let page = page.max(1);
        let per_page = per_page.clamp(1, 100);
        let total = all.len() as u64;
        let total_pages = total.div_ceil(per_page as u64) as u32;
        let items = all
            .into_iter()
            .skip((page - 1).saturating_mul(per_page) as usize)
            .take(per_page as usize)
            .collect();
        Self {
            items,
            total,
            page,
            per_page,
            total_pages,
        }
    }
}
