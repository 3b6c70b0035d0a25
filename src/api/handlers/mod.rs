//! HTTP handlers over the lifecycle engine.
//!
//! Handlers stay thin: pull the caller's credentials and client context out of the
//! request, call one engine operation, and map [`lifecycle::Error`] onto a status code
//! with a JSON `{ "error", "message" }` body.

pub mod exchange;
pub mod health;
pub mod pkce;
pub mod tokens;

use axum::{
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use tracing::error;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::lifecycle::{self, ClientContext};
use crate::store::User;

pub const APPLICATION_ID_HEADER: &str = "x-application-id";

#[derive(ToSchema, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

/// Public view of a user.
#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UserView {
    pub id: Uuid,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub roles: Vec<String>,
}

impl From<User> for UserView {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            email: user.email,
            username: user.username,
            roles: user.roles,
        }
    }
}

#[derive(Debug)]
pub struct ApiError(lifecycle::Error);

impl From<lifecycle::Error> for ApiError {
    fn from(err: lifecycle::Error) -> Self {
        Self(err)
    }
}

impl ApiError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        use lifecycle::Error;
        match &self.0 {
            Error::InvalidToken | Error::TokenExpired | Error::TokenRevoked | Error::Unauthorized => {
                StatusCode::UNAUTHORIZED
            }
            Error::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::InvalidOrExpired | Error::Validation(_) => StatusCode::BAD_REQUEST,
            err if err.is_pkce() => StatusCode::BAD_REQUEST,
            Error::StorageUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("request failed: {}", self.0);
            "internal server error".to_string()
        } else {
            self.0.to_string()
        };
        let body = ErrorBody {
            error: self.0.code().to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}

/// Client address and user agent, preferring proxy headers for the address.
pub fn client_context(headers: &HeaderMap) -> ClientContext {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };
    let ip_address = header("x-forwarded-for")
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .or_else(|| header("x-real-ip"))
        .unwrap_or_default();
    let user_agent = header("user-agent").unwrap_or_default();
    ClientContext::new(ip_address, user_agent)
}

/// Token from an `Authorization: Bearer` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Calling application from `x-application-id`. A malformed value is rejected.
pub fn application_id(headers: &HeaderMap) -> Result<Option<Uuid>, ApiError> {
    match headers.get(APPLICATION_ID_HEADER) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|value| Uuid::parse_str(value.trim()).ok())
            .map(Some)
            .ok_or_else(|| {
                ApiError(lifecycle::Error::Validation(format!(
                    "{APPLICATION_ID_HEADER} must be a UUID"
                )))
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn errors_map_to_status_codes() {
        use lifecycle::Error;
        let cases = [
            (Error::InvalidToken, StatusCode::UNAUTHORIZED),
            (Error::TokenRevoked, StatusCode::UNAUTHORIZED),
            (Error::RateLimitExceeded, StatusCode::TOO_MANY_REQUESTS),
            (Error::NotFound("application"), StatusCode::NOT_FOUND),
            (Error::Forbidden("inactive"), StatusCode::FORBIDDEN),
            (Error::InvalidOrExpired, StatusCode::BAD_REQUEST),
            (Error::ChallengeMismatch, StatusCode::BAD_REQUEST),
            (Error::StorageUnavailable, StatusCode::SERVICE_UNAVAILABLE),
            (Error::Codec("boom".to_string()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn client_context_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("198.51.100.4, 10.0.0.1"));
        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.1"));
        headers.insert("user-agent", HeaderValue::from_static("curl/8.4.0"));

        let client = client_context(&headers);
        assert_eq!(client.ip_address, "198.51.100.4");
        assert_eq!(client.user_agent, "curl/8.4.0");
    }

    #[test]
    fn bearer_token_requires_scheme() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer_token(&headers), Some("abc.def"));
    }

    #[test]
    fn application_id_header_must_be_uuid() {
        let mut headers = HeaderMap::new();
        assert!(matches!(application_id(&headers), Ok(None)));

        headers.insert(APPLICATION_ID_HEADER, HeaderValue::from_static("nope"));
        assert!(application_id(&headers).is_err());

        let id = Uuid::new_v4();
        if let Ok(value) = HeaderValue::from_str(&id.to_string()) {
            headers.insert(APPLICATION_ID_HEADER, value);
        }
        assert!(matches!(application_id(&headers), Ok(Some(found)) if found == id));
    }
}
