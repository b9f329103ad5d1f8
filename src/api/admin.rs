//! Admin endpoints
//!
//! Every admin request carries the caller's Telegram ID, which must be listed in
//! `escrow.admin_telegram_ids`. Other callers get 403.

use super::{
    deal_response, failure, forbidden, ActorRequest, ApiReply, ApiResponse, ApiState, DealResponse, PaginatedResponse,
};
use crate::{
    escrow::{ConfirmationResult, DealStatus},
    Amount, Currency, EscrowError,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Admin deal listing query
#[derive(Debug, Deserialize)]
pub struct ListDealsQuery {
    /// Caller's Telegram user ID
    pub telegram_id: i64,
    /// Status filter (defaults to the review queue, PAID_WAITING_ADMIN)
    pub status: Option<String>,
    /// Page number (1-based)
    #[serde(default = "default_page")]
    pub page: u32,
    /// Items per page
    #[serde(default = "default_per_page")]
    pub per_page: u32,
}

fn default_page() -> u32 {
    1
}

fn default_per_page() -> u32 {
    20
}

/// Add addresses to the pool
#[derive(Debug, Deserialize)]
pub struct ImportAddressesRequest {
    /// Caller's Telegram user ID
    pub telegram_id: i64,
    /// Addresses to add
    pub addresses: Vec<String>,
}

/// Payment check response
#[derive(Debug, Serialize)]
pub struct ConfirmationResponse {
    /// Deal ID
    pub deal_id: String,
    /// Deal status after the check
    pub status: DealStatus,
    /// Whether a qualifying payment was found
    pub confirmed: bool,
    /// Qualifying transaction
    pub tx_hash: Option<String>,
    /// Qualifying transaction value
    pub observed_amount: Option<Amount>,
    /// Qualifying transaction confirmations
    pub confirmations: Option<u32>,
    /// Failure class (no_transactions, not_qualified, timeout, rate_limited, transport, parse)
    pub failure: Option<&'static str>,
    /// Whether checking again later may help
    pub retryable: bool,
    /// Human-readable diagnostic
    pub error: Option<String>,
}

impl ConfirmationResponse {
    fn new(deal_id: String, status: DealStatus, result: ConfirmationResult) -> Self {
        Self {
            deal_id,
            status,
            error: result.error(),
            failure: result.failure.as_ref().map(|f| f.kind()),
            retryable: result.failure.as_ref().is_some_and(|f| f.is_retryable()),
            confirmed: result.confirmed,
            tx_hash: result.tx_hash,
            observed_amount: result.observed_amount,
            confirmations: result.confirmations,
        }
    }
}

/// Pool import response
#[derive(Debug, Serialize)]
pub struct ImportAddressesResponse {
    /// Currency
    pub currency: Currency,
    /// Addresses submitted
    pub submitted: usize,
    /// Addresses that were new
    pub imported: usize,
}

/// Sweep response
#[derive(Debug, Serialize)]
pub struct SweepResponse {
    /// Reservations released
    pub released: usize,
}

fn require_admin<T>(state: &ApiState, telegram_id: i64) -> Option<ApiReply<T>> {
    if state.app.config.is_admin(telegram_id) {
        None
    } else {
        warn!("API: Rejected admin request from telegram_id={}", telegram_id);
        Some(forbidden("Admin access required"))
    }
}

/// List deals by status
pub async fn list_deals(
    State(state): State<ApiState>,
    Query(query): Query<ListDealsQuery>,
) -> ApiReply<PaginatedResponse<DealResponse>> {
    if let Some(reply) = require_admin(&state, query.telegram_id) {
        return reply;
    }

    let result = async {
        let status = match &query.status {
            Some(s) => s.parse()?,
            None => DealStatus::PaidWaitingAdmin,
        };
        let deals = state.app.engine.list_deals_by_status(status).await?;
        let page = PaginatedResponse::paginate(deals, query.page, query.per_page);

        let mut items = Vec::with_capacity(page.items.len());
        for deal in page.items {
            items.push(deal_response(&state, deal).await?);
        }
        Ok::<_, EscrowError>(PaginatedResponse {
            items,
            total: page.total,
            page: page.page,
            per_page: page.per_page,
            total_pages: page.total_pages,
        })
    }
    .await;

    match result {
        Ok(page) => (StatusCode::OK, Json(ApiResponse::success(page))),
        Err(e) => failure(e),
    }
}

/// Check the deal's deposit address without changing the deal
pub async fn check_payment(
    State(state): State<ApiState>,
    Path(deal_id): Path<String>,
    Json(req): Json<ActorRequest>,
) -> ApiReply<ConfirmationResponse> {
    if let Some(reply) = require_admin(&state, req.telegram_id) {
        return reply;
    }
    info!("API: Check payment: deal_id={}", deal_id);

    let engine = &state.app.engine;
    let result = async {
        let result = engine.check_payment(&deal_id).await?;
        let deal = engine.get_deal(&deal_id).await?;
        Ok::<_, EscrowError>(ConfirmationResponse::new(deal.id, deal.status, result))
    }
    .await;

    match result {
        Ok(response) => (StatusCode::OK, Json(ApiResponse::success(response))),
        Err(e) => failure(e),
    }
}

/// Verify the payment and mark the deal PAID when found
pub async fn confirm_payment(
    State(state): State<ApiState>,
    Path(deal_id): Path<String>,
    Json(req): Json<ActorRequest>,
) -> ApiReply<ConfirmationResponse> {
    if let Some(reply) = require_admin(&state, req.telegram_id) {
        return reply;
    }
    info!("API: Confirm payment: deal_id={}, admin={}", deal_id, req.telegram_id);

    let engine = &state.app.engine;
    let result = async {
        let result = engine.confirm_payment(&deal_id).await?;
        let deal = engine.get_deal(&deal_id).await?;
        Ok::<_, EscrowError>(ConfirmationResponse::new(deal.id, deal.status, result))
    }
    .await;

    match result {
        Ok(response) => {
            info!(
                "API: Payment check for deal {}: confirmed={}, status={}",
                response.deal_id, response.confirmed, response.status
            );
            (StatusCode::OK, Json(ApiResponse::success(response)))
        }
        Err(e) => failure(e),
    }
}

/// Release the funds of a shipped deal
pub async fn release_funds(
    State(state): State<ApiState>,
    Path(deal_id): Path<String>,
    Json(req): Json<ActorRequest>,
) -> ApiReply<DealResponse> {
    if let Some(reply) = require_admin(&state, req.telegram_id) {
        return reply;
    }
    info!("API: Release funds: deal_id={}, admin={}", deal_id, req.telegram_id);

    let result = async {
        let deal = state.app.engine.release_funds(&deal_id).await?;
        deal_response(&state, deal).await
    }
    .await;

    match result {
        Ok(deal) => (StatusCode::OK, Json(ApiResponse::success(deal))),
        Err(e) => failure(e),
    }
}

/// Add deposit addresses to a currency's pool
pub async fn import_addresses(
    State(state): State<ApiState>,
    Path(currency): Path<String>,
    Json(req): Json<ImportAddressesRequest>,
) -> ApiReply<ImportAddressesResponse> {
    if let Some(reply) = require_admin(&state, req.telegram_id) {
        return reply;
    }
    info!(
        "API: Import {} addresses for {}, admin={}",
        req.addresses.len(),
        currency,
        req.telegram_id
    );

    let result = async {
        let currency: Currency = currency.parse()?;
        let imported = state.app.pool.import(currency, &req.addresses).await?;
        Ok::<_, EscrowError>(ImportAddressesResponse {
            currency,
            submitted: req.addresses.len(),
            imported,
        })
    }
    .await;

    match result {
        Ok(response) => (StatusCode::OK, Json(ApiResponse::success(response))),
        Err(e) => failure(e),
    }
}

/// Release every expired, unprotected reservation now
pub async fn sweep_pool(
    State(state): State<ApiState>,
    Json(req): Json<ActorRequest>,
) -> ApiReply<SweepResponse> {
    if let Some(reply) = require_admin(&state, req.telegram_id) {
        return reply;
    }

    match state.app.pool.sweep(chrono::Utc::now()).await {
        Ok(released) => {
            info!("API: Manual sweep released {} reservations", released);
            (StatusCode::OK, Json(ApiResponse::success(SweepResponse { released })))
        }
        Err(e) => failure(e),
    }
}
