//! User endpoints

use super::{failure, ApiReply, ApiResponse, ApiState};
use crate::db::UserModel;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Register (or refresh) a user
#[derive(Debug, Deserialize)]
pub struct RegisterUserRequest {
    /// Telegram user ID
    pub telegram_id: i64,
    /// Telegram username
    pub username: Option<String>,
}

/// User response
#[derive(Debug, Serialize)]
pub struct UserResponse {
    /// Internal user ID
    pub id: i64,
    /// Telegram user ID
    pub telegram_id: i64,
    /// Telegram username
    pub username: Option<String>,
    /// Registration time (ISO 8601)
    pub created_at: String,
}

impl From<UserModel> for UserResponse {
    fn from(user: UserModel) -> Self {
        Self {
            id: user.id,
            telegram_id: user.telegram_id,
            username: user.username,
            created_at: user.created_at.to_rfc3339(),
        }
    }
}

/// Register a user on first contact
pub async fn register_user(
    State(state): State<ApiState>,
    Json(req): Json<RegisterUserRequest>,
) -> ApiReply<UserResponse> {
    info!(
        "API: Register user: telegram_id={}, username={:?}",
        req.telegram_id, req.username
    );

    match state
        .app
        .engine
        .register_user(req.telegram_id, req.username.as_deref())
        .await
    {
        Ok(user) => (StatusCode::OK, Json(ApiResponse::success(user.into()))),
        Err(e) => failure(e),
    }
}

/// Look up a user by username
pub async fn get_user_by_username(
    State(state): State<ApiState>,
    Path(username): Path<String>,
) -> ApiReply<UserResponse> {
    match state.app.engine.find_user_by_username(&username).await {
        Ok(user) => (StatusCode::OK, Json(ApiResponse::success(user.into()))),
        Err(e) => failure(e),
    }
}
