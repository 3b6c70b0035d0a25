use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::{bearer_token, client_context, ApiError, ErrorBody, UserView};
use crate::lifecycle::{Engine, Error, TokenPair};

#[derive(ToSchema, Deserialize, Debug)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: u64,
    pub user: UserView,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_id: Option<Uuid>,
}

impl From<TokenPair> for TokenResponse {
    fn from(pair: TokenPair) -> Self {
        Self {
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
            token_type: pair.token_type.to_string(),
            expires_in: pair.expires_in,
            user: pair.user.into(),
            app_id: pair.app_id,
        }
    }
}

#[utoipa::path(
    post,
    path = "/v1/auth/refresh",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "New token pair; the presented refresh token is revoked", body = TokenResponse),
        (status = 401, description = "Invalid, expired or revoked refresh token", body = ErrorBody)
    ),
    tag = "auth"
)]
pub async fn refresh(
    engine: Extension<Engine>,
    headers: HeaderMap,
    Json(request): Json<RefreshRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    let client = client_context(&headers);
    let pair = engine
        .rotation
        .refresh(request.refresh_token.trim(), &client)
        .await?;
    Ok(Json(pair.into()))
}

#[utoipa::path(
    post,
    path = "/v1/auth/logout",
    responses(
        (status = 204, description = "Access token blacklisted and every refresh token revoked"),
        (status = 401, description = "Missing or undecodable access token", body = ErrorBody),
        (status = 503, description = "Both revocation backends are unavailable", body = ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
pub async fn logout(
    engine: Extension<Engine>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let token = bearer_token(&headers).ok_or(Error::Unauthorized)?;
    let client = client_context(&headers);
    engine.rotation.logout(token, &client).await?;
    Ok(StatusCode::NO_CONTENT)
}
