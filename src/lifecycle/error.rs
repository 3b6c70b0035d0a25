use crate::store::StoreError;

/// Failures surfaced by the lifecycle engine.
///
/// Single-backend storage failures never reach this type; they are logged and absorbed
/// by the revocation store. `StorageUnavailable` means both revocation backends failed.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid token")]
    InvalidToken,
    #[error("token expired")]
    TokenExpired,
    #[error("token revoked")]
    TokenRevoked,
    #[error("unauthorized")]
    Unauthorized,
    #[error("rate limit exceeded")]
    RateLimitExceeded,
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("forbidden: {0}")]
    Forbidden(&'static str),
    #[error("invalid or expired code")]
    InvalidOrExpired,
    #[error("invalid code verifier")]
    InvalidVerifier,
    #[error("invalid code challenge")]
    InvalidChallenge,
    #[error("invalid code challenge method")]
    InvalidMethod,
    #[error("code challenge mismatch")]
    ChallengeMismatch,
    #[error("code challenge required")]
    ChallengeRequired,
    #[error("code challenge method required")]
    MethodRequired,
    #[error("revocation storage unavailable")]
    StorageUnavailable,
    #[error("validation failed: {0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("token codec error: {0}")]
    Codec(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Stable machine-readable code, used in HTTP error bodies and audit details.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidToken => "invalid_token",
            Self::TokenExpired => "token_expired",
            Self::TokenRevoked => "token_revoked",
            Self::Unauthorized => "unauthorized",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::NotFound(_) => "not_found",
            Self::Forbidden(_) => "forbidden",
            Self::InvalidOrExpired => "invalid_or_expired_code",
            Self::InvalidVerifier => "invalid_code_verifier",
            Self::InvalidChallenge => "invalid_code_challenge",
            Self::InvalidMethod => "invalid_code_challenge_method",
            Self::ChallengeMismatch => "code_challenge_mismatch",
            Self::ChallengeRequired => "code_challenge_required",
            Self::MethodRequired => "code_challenge_method_required",
            Self::StorageUnavailable => "storage_unavailable",
            Self::Validation(_) => "validation_error",
            Self::Store(_) | Self::Codec(_) => "internal_error",
        }
    }

    #[must_use]
    pub fn is_pkce(&self) -> bool {
        matches!(
            self,
            Self::InvalidVerifier
                | Self::InvalidChallenge
                | Self::InvalidMethod
                | Self::ChallengeMismatch
                | Self::ChallengeRequired
                | Self::MethodRequired
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_convert() {
        let err: Error = StoreError::Unavailable { backend: "durable" }.into();
        assert!(matches!(err, Error::Store(_)));
        assert_eq!(err.code(), "internal_error");
        assert_eq!(err.to_string(), "durable backend unavailable");
    }

    #[test]
    fn pkce_errors_are_grouped() {
        assert!(Error::ChallengeMismatch.is_pkce());
        assert!(Error::MethodRequired.is_pkce());
        assert!(!Error::TokenRevoked.is_pkce());
    }

    #[test]
    fn codes_distinguish_revoked_from_invalid() {
        assert_ne!(Error::InvalidToken.code(), Error::TokenRevoked.code());
        assert_eq!(Error::NotFound("user").to_string(), "user not found");
    }
}
