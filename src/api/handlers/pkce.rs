use axum::response::Json;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::{ApiError, ErrorBody};
use crate::lifecycle::pkce::{self, CodeChallengeMethod, PkceParams};

#[derive(ToSchema, Deserialize, Debug, Default)]
pub struct ChallengeRequest {
    /// Verifier to derive from; a fresh one is generated when absent.
    pub code_verifier: Option<String>,
    #[serde(default)]
    pub code_challenge_method: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ChallengeResponse {
    pub code_verifier: String,
    pub code_challenge: String,
    pub code_challenge_method: CodeChallengeMethod,
}

#[derive(ToSchema, Deserialize, Debug)]
pub struct VerifyRequest {
    pub code_verifier: String,
    pub code_challenge: String,
    pub code_challenge_method: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct VerifyResponse {
    pub valid: bool,
}

#[utoipa::path(
    post,
    path = "/v1/pkce/challenge",
    request_body = ChallengeRequest,
    responses(
        (status = 200, description = "Verifier with its derived challenge", body = ChallengeResponse),
        (status = 400, description = "Malformed verifier or unsupported method", body = ErrorBody)
    ),
    tag = "pkce"
)]
pub async fn challenge(
    Json(request): Json<ChallengeRequest>,
) -> Result<Json<ChallengeResponse>, ApiError> {
    let method = match request.code_challenge_method.as_deref() {
        Some(method) => method.parse::<CodeChallengeMethod>()?,
        None => CodeChallengeMethod::S256,
    };

    let params = match request.code_verifier {
        None if method == CodeChallengeMethod::S256 => PkceParams::generate()?,
        code_verifier => {
            let code_verifier = match code_verifier {
                Some(code_verifier) => code_verifier,
                None => pkce::generate_code_verifier()?,
            };
            PkceParams {
                code_challenge: pkce::generate_code_challenge(&code_verifier, method)?,
                code_verifier,
                code_challenge_method: method,
            }
        }
    };

    Ok(Json(ChallengeResponse {
        code_verifier: params.code_verifier,
        code_challenge: params.code_challenge,
        code_challenge_method: params.code_challenge_method,
    }))
}

#[utoipa::path(
    post,
    path = "/v1/pkce/verify",
    request_body = VerifyRequest,
    responses(
        (status = 200, description = "Verifier matches the challenge", body = VerifyResponse),
        (status = 400, description = "Verifier, challenge or method rejected", body = ErrorBody)
    ),
    tag = "pkce"
)]
pub async fn verify(Json(request): Json<VerifyRequest>) -> Result<Json<VerifyResponse>, ApiError> {
    pkce::validate_code_challenge(
        &request.code_verifier,
        &request.code_challenge,
        &request.code_challenge_method,
    )?;
    Ok(Json(VerifyResponse { valid: true }))
}
