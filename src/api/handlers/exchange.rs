use axum::{extract::Extension, http::HeaderMap, response::Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::{application_id, bearer_token, client_context, ApiError, ErrorBody, UserView};
use crate::lifecycle::{Engine, Error};

#[derive(ToSchema, Deserialize, Debug)]
pub struct CreateExchangeRequest {
    pub target_app_id: Uuid,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct CreateExchangeResponse {
    pub exchange_code: String,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
}

#[derive(ToSchema, Deserialize, Debug)]
pub struct RedeemExchangeRequest {
    pub exchange_code: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct RedeemExchangeResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: u64,
    pub user: UserView,
    pub application_id: Uuid,
}

#[utoipa::path(
    post,
    path = "/v1/token/exchange",
    request_body = CreateExchangeRequest,
    params(
        ("x-application-id" = Option<String>, Header, description = "Application the access token was issued to")
    ),
    responses(
        (status = 200, description = "Single-use exchange code valid for 30 seconds", body = CreateExchangeResponse),
        (status = 401, description = "Invalid, expired or revoked access token", body = ErrorBody),
        (status = 403, description = "Target application is inactive", body = ErrorBody),
        (status = 404, description = "Target application not found", body = ErrorBody),
        (status = 429, description = "Too many exchange codes requested", body = ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "exchange"
)]
pub async fn create_exchange(
    engine: Extension<Engine>,
    headers: HeaderMap,
    Json(request): Json<CreateExchangeRequest>,
) -> Result<Json<CreateExchangeResponse>, ApiError> {
    let token = bearer_token(&headers).ok_or(Error::Unauthorized)?;
    let source_app_id = application_id(&headers)?;
    let client = client_context(&headers);

    let issued = engine
        .exchange
        .create_exchange(token, request.target_app_id, source_app_id, &client)
        .await?;

    Ok(Json(CreateExchangeResponse {
        exchange_code: issued.code,
        expires_at: issued.expires_at,
        redirect_url: issued.redirect_url,
    }))
}

#[utoipa::path(
    post,
    path = "/v1/token/exchange/redeem",
    request_body = RedeemExchangeRequest,
    params(
        ("x-application-id" = Option<String>, Header, description = "Application redeeming the code")
    ),
    responses(
        (status = 200, description = "Token pair scoped to the target application", body = RedeemExchangeResponse),
        (status = 400, description = "Unknown, expired or already redeemed code", body = ErrorBody),
        (status = 403, description = "Code was issued for another application", body = ErrorBody),
        (status = 404, description = "User no longer exists", body = ErrorBody)
    ),
    tag = "exchange"
)]
pub async fn redeem_exchange(
    engine: Extension<Engine>,
    headers: HeaderMap,
    Json(request): Json<RedeemExchangeRequest>,
) -> Result<Json<RedeemExchangeResponse>, ApiError> {
    let redeeming_app_id = application_id(&headers)?;
    let client = client_context(&headers);

    let redeemed = engine
        .exchange
        .redeem_exchange(request.exchange_code.trim(), redeeming_app_id, &client)
        .await?;

    let tokens = redeemed.tokens;
    Ok(Json(RedeemExchangeResponse {
        access_token: tokens.access_token,
        refresh_token: tokens.refresh_token,
        token_type: tokens.token_type.to_string(),
        expires_in: tokens.expires_in,
        user: tokens.user.into(),
        application_id: redeemed.application_id,
    }))
}
