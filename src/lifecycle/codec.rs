//! Token codec seam and its HS256 JWT implementation.

use chrono::{DateTime, Utc};
use jsonwebtoken::{errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use super::error::{Error, Result};
use crate::store::User;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<Uuid>,
    pub typ: TokenType,
    pub jti: Uuid,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
}

impl Claims {
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp, 0)
    }

    /// Identity carried by the token.
    #[must_use]
    pub fn user(&self) -> User {
        User {
            id: self.sub,
            email: self.email.clone(),
            username: self.username.clone(),
            roles: self.roles.clone(),
        }
    }
}

/// Signs and validates access and refresh tokens.
pub trait TokenCodec: Send + Sync {
    /// # Errors
    /// [`Error::Codec`] when signing fails.
    fn generate_access_token(&self, user: &User, app_id: Option<Uuid>) -> Result<String>;

    /// # Errors
    /// [`Error::Codec`] when signing fails.
    fn generate_refresh_token(&self, user: &User, app_id: Option<Uuid>) -> Result<String>;

    /// # Errors
    /// [`Error::TokenExpired`] past `exp`, [`Error::InvalidToken`] otherwise.
    fn validate_access_token(&self, token: &str) -> Result<Claims>;

    /// # Errors
    /// [`Error::TokenExpired`] past `exp`, [`Error::InvalidToken`] otherwise.
    fn validate_refresh_token(&self, token: &str) -> Result<Claims>;

    /// Decode claims without checking the signature or expiry. Identity only.
    ///
    /// # Errors
    /// [`Error::InvalidToken`] when the token cannot be decoded.
    fn extract_claims(&self, token: &str) -> Result<Claims>;

    fn access_token_ttl(&self) -> Duration;

    fn refresh_token_ttl(&self) -> Duration;
}

pub struct JwtCodec {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    access_token_ttl: Duration,
    refresh_token_ttl: Duration,
}

impl fmt::Debug for JwtCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtCodec")
            .field("issuer", &self.issuer)
            .field("access_token_ttl", &self.access_token_ttl)
            .field("refresh_token_ttl", &self.refresh_token_ttl)
            .finish_non_exhaustive()
    }
}

impl JwtCodec {
    #[must_use]
    pub fn new(
        secret: &SecretString,
        issuer: impl Into<String>,
        access_token_ttl: Duration,
        refresh_token_ttl: Duration,
    ) -> Self {
        let secret = secret.expose_secret().as_bytes();
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            issuer: issuer.into(),
            access_token_ttl,
            refresh_token_ttl,
        }
    }

    fn generate(&self, user: &User, app_id: Option<Uuid>, typ: TokenType) -> Result<String> {
        let ttl = match typ {
            TokenType::Access => self.access_token_ttl,
            TokenType::Refresh => self.refresh_token_ttl,
        };
        let now = Utc::now().timestamp();
        let ttl = i64::try_from(ttl.as_secs())
            .map_err(|_| Error::Codec("token lifetime out of range".to_string()))?;
        let claims = Claims {
            sub: user.id,
            email: user.email.clone(),
            username: user.username.clone(),
            roles: user.roles.clone(),
            app_id,
            typ,
            // Random id keeps two tokens minted in the same second distinct.
            jti: Uuid::new_v4(),
            iat: now,
            exp: now.saturating_add(ttl),
            iss: self.issuer.clone(),
        };
        self.sign(&claims)
    }

    fn sign(&self, claims: &Claims) -> Result<String> {
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|err| Error::Codec(format!("failed to sign token: {err}")))
    }

    fn validate(&self, token: &str, expected: TokenType) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_aud = false;
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);

        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|err| match err.kind() {
                ErrorKind::ExpiredSignature => Error::TokenExpired,
                _ => Error::InvalidToken,
            })?;

        if data.claims.typ != expected {
            return Err(Error::InvalidToken);
        }
        Ok(data.claims)
    }
}

impl TokenCodec for JwtCodec {
    fn generate_access_token(&self, user: &User, app_id: Option<Uuid>) -> Result<String> {
        self.generate(user, app_id, TokenType::Access)
    }

    fn generate_refresh_token(&self, user: &User, app_id: Option<Uuid>) -> Result<String> {
        self.generate(user, app_id, TokenType::Refresh)
    }

    fn validate_access_token(&self, token: &str) -> Result<Claims> {
        self.validate(token, TokenType::Access)
    }

    fn validate_refresh_token(&self, token: &str) -> Result<Claims> {
        self.validate(token, TokenType::Refresh)
    }

    fn extract_claims(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|_| Error::InvalidToken)
    }

    fn access_token_ttl(&self) -> Duration {
        self.access_token_ttl
    }

    fn refresh_token_ttl(&self) -> Duration {
        self.refresh_token_ttl
    }
}
