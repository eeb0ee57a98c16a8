use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::Json,
};
use push_core::{
    BatchResult, DeviceToken, MultiUserResult, Platform, PushResult, TokenStats, UserId,
};
use push_delivery::{from_request, MessageRequest};
use serde::{Deserialize, Serialize};

use crate::auth::AuthenticatedUser;
use crate::error::ApiError;
use crate::state::ApiState;

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "push-api"
    }))
}

#[derive(Deserialize)]
pub struct RegisterTokenRequest {
    pub token: String,
    pub platform: String,
    #[serde(default)]
    pub device_info: Option<serde_json::Value>,
}

pub async fn register_device_token(
    Extension(state): Extension<ApiState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(req): Json<RegisterTokenRequest>,
) -> Result<Json<DeviceToken>, ApiError> {
    let platform: Platform = req.platform.parse()?;
    let record = state
        .registry
        .register(user.user_id, &req.token, platform, req.device_info)
        .await?;
    Ok(Json(record))
}

#[derive(Serialize)]
pub struct TokenList {
    pub tokens: Vec<DeviceToken>,
}

pub async fn list_device_tokens(
    Extension(state): Extension<ApiState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<TokenList>, ApiError> {
    let tokens = state.registry.find_by_user(user.user_id).await?;
    Ok(Json(TokenList { tokens }))
}

pub async fn unregister_device_token(
    Extension(state): Extension<ApiState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(token): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.registry.unregister(user.user_id, &token).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn token_stats(
    Extension(state): Extension<ApiState>,
) -> Result<Json<TokenStats>, ApiError> {
    Ok(Json(state.registry.stats().await?))
}

#[derive(Deserialize)]
pub struct DevicePushRequest {
    pub token: String,
    #[serde(flatten)]
    pub message: MessageRequest,
}

pub async fn push_to_device(
    Extension(state): Extension<ApiState>,
    Json(req): Json<DevicePushRequest>,
) -> Result<Json<PushResult>, ApiError> {
    let message = from_request(&req.message);
    let result = state.dispatcher.send_to_device(&req.token, &message).await?;
    Ok(Json(result))
}

#[derive(Deserialize)]
pub struct UserPushRequest {
    pub user_id: UserId,
    #[serde(flatten)]
    pub message: MessageRequest,
}

pub async fn push_to_user(
    Extension(state): Extension<ApiState>,
    Json(req): Json<UserPushRequest>,
) -> Result<Json<BatchResult>, ApiError> {
    let message = from_request(&req.message);
    let batch = state.dispatcher.send_to_user(req.user_id, &message).await?;
    Ok(Json(batch))
}

#[derive(Deserialize)]
pub struct UsersPushRequest {
    pub user_ids: Vec<UserId>,
    #[serde(flatten)]
    pub message: MessageRequest,
}

pub async fn push_to_users(
    Extension(state): Extension<ApiState>,
    Json(req): Json<UsersPushRequest>,
) -> Result<Json<MultiUserResult>, ApiError> {
    let message = from_request(&req.message);
    let result = state
        .dispatcher
        .send_to_multiple_users(&req.user_ids, &message)
        .await?;
    Ok(Json(result))
}

#[derive(Deserialize)]
pub struct TopicPushRequest {
    pub topic: String,
    #[serde(flatten)]
    pub message: MessageRequest,
}

pub async fn push_to_topic(
    Extension(state): Extension<ApiState>,
    Json(req): Json<TopicPushRequest>,
) -> Result<Json<PushResult>, ApiError> {
    let message = from_request(&req.message);
    let result = state.dispatcher.send_to_topic(&req.topic, &message).await?;
    Ok(Json(result))
}

#[derive(Deserialize)]
pub struct ValidateRequest {
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct ValidateResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// An unknown answer is reported as invalid, with the reason.
pub async fn validate_token(
    Extension(state): Extension<ApiState>,
    Json(req): Json<ValidateRequest>,
) -> Json<ValidateResponse> {
    let response = match state.dispatcher.validate_token(&req.token).await {
        Ok(valid) => ValidateResponse { valid, error: None },
        Err(e) => ValidateResponse {
            valid: false,
            error: Some(e.to_string()),
        },
    };
    Json(response)
}
