//! Deal endpoints for buyers and sellers

use super::{failure, forbidden, ApiReply, ApiResponse, ApiState, UserResponse};
use crate::{
    db::{DealModel, UserModel},
    escrow::{DealStatus, HelpRequest},
    Amount, Currency, EscrowError,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Create a deal
#[derive(Debug, Deserialize)]
pub struct CreateDealRequest {
    /// Telegram ID of the buyer creating the deal
    pub buyer_telegram_id: i64,
    /// Seller's username (with or without @)
    pub seller_username: String,
    /// Currency ticker (BTC or LTC)
    pub currency: String,
    /// Deal amount in major units, as a decimal string
    pub amount: String,
    /// Item description
    pub description: String,
}

/// Identifies the caller of a participant action
#[derive(Debug, Deserialize)]
pub struct ActorRequest {
    /// Caller's Telegram user ID
    pub telegram_id: i64,
}

/// Deal response
#[derive(Debug, Serialize)]
pub struct DealResponse {
    /// Deal ID
    pub deal_id: String,
    /// Lifecycle status
    pub status: DealStatus,
    /// Currency
    pub currency: Currency,
    /// Agreed amount
    pub amount: Amount,
    /// Amount the buyer must send
    pub payable_amount: Amount,
    /// Item description
    pub description: String,
    /// Deposit address
    pub deposit_address: String,
    /// Confirmed transaction hash
    pub tx_hash: Option<String>,
    /// Buyer
    pub buyer: UserResponse,
    /// Seller
    pub seller: UserResponse,
    /// Creation time (ISO 8601)
    pub created_at: String,
    /// Last update time (ISO 8601)
    pub updated_at: String,
}

impl DealResponse {
    fn new(deal: DealModel, buyer: UserModel, seller: UserModel) -> Self {
        Self {
            deal_id: deal.id,
            status: deal.status,
            currency: deal.currency,
            amount: deal.original_amount,
            payable_amount: deal.payable_amount,
            description: deal.description,
            deposit_address: deal.deposit_address,
            tx_hash: deal.tx_hash,
            buyer: buyer.into(),
            seller: seller.into(),
            created_at: deal.created_at.to_rfc3339(),
            updated_at: deal.updated_at.to_rfc3339(),
        }
    }
}

/// Resolve both parties so the front-end can address them without extra lookups
pub(crate) async fn deal_response(state: &ApiState, deal: DealModel) -> Result<DealResponse, EscrowError> {
    let buyer = state.app.engine.get_user(deal.buyer_id).await?;
    let seller = state.app.engine.get_user(deal.seller_id).await?;
    Ok(DealResponse::new(deal, buyer, seller))
}

/// Pool availability response
#[derive(Debug, Serialize)]
pub struct PoolAvailabilityResponse {
    /// Currency
    pub currency: Currency,
    /// Whether a deal could get an address right now
    pub available: bool,
}

/// Create a deal
pub async fn create_deal(
    State(state): State<ApiState>,
    Json(req): Json<CreateDealRequest>,
) -> ApiReply<DealResponse> {
    info!(
        "API: Create deal: buyer={}, seller=@{}, {} {}",
        req.buyer_telegram_id,
        req.seller_username.trim_start_matches('@'),
        req.amount,
        req.currency
    );

    let engine = &state.app.engine;
    let result = async {
        let currency: Currency = req.currency.parse()?;
        let amount: Amount = req.amount.parse()?;
        let buyer = engine.get_user_by_telegram_id(req.buyer_telegram_id).await?;
        let seller = engine.find_user_by_username(&req.seller_username).await?;
        let deal = engine
            .create_deal(buyer.id, seller.id, currency, amount, &req.description)
            .await?;
        Ok(DealResponse::new(deal, buyer, seller))
    }
    .await;

    match result {
        Ok(deal) => {
            info!(
                "API: Deal created: deal_id={}, payable={} {}, address={}",
                deal.deal_id, deal.payable_amount, deal.currency, deal.deposit_address
            );
            (StatusCode::OK, Json(ApiResponse::success(deal)))
        }
        Err(e) => failure(e),
    }
}

/// Get a deal
pub async fn get_deal(
    State(state): State<ApiState>,
    Path(deal_id): Path<String>,
) -> ApiReply<DealResponse> {
    let result = async {
        let deal = state.app.engine.get_deal(&deal_id).await?;
        deal_response(&state, deal).await
    }
    .await;

    match result {
        Ok(deal) => (StatusCode::OK, Json(ApiResponse::success(deal))),
        Err(e) => failure(e),
    }
}

/// The role a caller must hold on a deal
#[derive(Debug, Clone, Copy)]
enum Party {
    Buyer,
    Seller,
    Either,
}

/// Check that `telegram_id` is the given party of the deal
async fn authorize(state: &ApiState, deal_id: &str, telegram_id: i64, party: Party) -> Result<bool, EscrowError> {
    let deal = state.app.engine.get_deal(deal_id).await?;
    let user = state.app.engine.get_user_by_telegram_id(telegram_id).await?;
    Ok(match party {
        Party::Buyer => deal.buyer_id == user.id,
        Party::Seller => deal.seller_id == user.id,
        Party::Either => deal.buyer_id == user.id || deal.seller_id == user.id,
    })
}

/// Buyer reports the payment as sent
pub async fn report_paid(
    State(state): State<ApiState>,
    Path(deal_id): Path<String>,
    Json(req): Json<ActorRequest>,
) -> ApiReply<DealResponse> {
    info!("API: Report paid: deal_id={}, telegram_id={}", deal_id, req.telegram_id);

    match authorize(&state, &deal_id, req.telegram_id, Party::Buyer).await {
        Ok(true) => {}
        Ok(false) => return forbidden(format!("Only the buyer of deal {} can report payment", deal_id)),
        Err(e) => return failure(e),
    }

    let result = async {
        let deal = state.app.engine.report_paid(&deal_id).await?;
        deal_response(&state, deal).await
    }
    .await;

    match result {
        Ok(deal) => (StatusCode::OK, Json(ApiResponse::success(deal))),
        Err(e) => failure(e),
    }
}

/// Seller reports the item as shipped
pub async fn report_shipped(
    State(state): State<ApiState>,
    Path(deal_id): Path<String>,
    Json(req): Json<ActorRequest>,
) -> ApiReply<DealResponse> {
    info!("API: Report shipped: deal_id={}, telegram_id={}", deal_id, req.telegram_id);

    match authorize(&state, &deal_id, req.telegram_id, Party::Seller).await {
        Ok(true) => {}
        Ok(false) => return forbidden(format!("Only the seller of deal {} can report shipment", deal_id)),
        Err(e) => return failure(e),
    }

    let result = async {
        let deal = state.app.engine.report_shipped(&deal_id).await?;
        deal_response(&state, deal).await
    }
    .await;

    match result {
        Ok(deal) => (StatusCode::OK, Json(ApiResponse::success(deal))),
        Err(e) => failure(e),
    }
}

/// Buyer or seller asks an admin to step in
pub async fn request_help(
    State(state): State<ApiState>,
    Path(deal_id): Path<String>,
    Json(req): Json<ActorRequest>,
) -> ApiReply<HelpRequest> {
    info!("API: Help requested: deal_id={}, telegram_id={}", deal_id, req.telegram_id);

    match authorize(&state, &deal_id, req.telegram_id, Party::Either).await {
        Ok(true) => {}
        Ok(false) => return forbidden(format!("Only the buyer or seller of deal {} can ask for help", deal_id)),
        Err(e) => return failure(e),
    }

    match state.app.engine.request_help(&deal_id, req.telegram_id).await {
        Ok(help) => (StatusCode::OK, Json(ApiResponse::success(help))),
        Err(e) => failure(e),
    }
}

/// Whether a deal in `currency` can be created right now
pub async fn pool_availability(
    State(state): State<ApiState>,
    Path(currency): Path<String>,
) -> ApiReply<PoolAvailabilityResponse> {
    let result = async {
        let currency: Currency = currency.parse()?;
        let available = state.app.pool.has_free(currency).await?;
        Ok::<_, EscrowError>(PoolAvailabilityResponse { currency, available })
    }
    .await;

    match result {
        Ok(response) => (StatusCode::OK, Json(ApiResponse::success(response))),
        Err(e) => failure(e),
    }
}
