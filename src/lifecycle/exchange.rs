//! Cross-application token exchange.
//!
//! A user holding an access token for application A asks for a short-lived,
//! single-use code bound to application B. Application B redeems the code for a
//! fresh token pair scoped to itself. Codes live only in the keyed-TTL cache and
//! redemption claims them with an atomic take, so one code yields at most one pair.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::audit::{AuditAction, AuditEvent, AuditLogger, AuditStatus};
use super::codec::TokenCodec;
use super::config::LifecycleConfig;
use super::error::{Error, Result};
use super::hash::{hash_token, random_code};
use super::revocation::RevocationStore;
use super::rotation::{RefreshRotation, TokenPair};
use super::session::ClientContext;
use crate::store::{ApplicationStore, CacheBackend, StoreError, TokenExchangeCode, UserStore};

const CODE_KEY_PREFIX: &str = "token_exchange:";
const RATE_KEY_PREFIX: &str = "token_exchange_rate:";

/// Issued exchange code. `code` is shown to the client once and never logged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExchangeCode {
    pub code: String,
    pub expires_at: DateTime<Utc>,
    /// Homepage of the target application, when it has one.
    pub redirect_url: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExchangeRedemption {
    pub tokens: TokenPair,
    pub application_id: Uuid,
}

pub struct TokenExchange {
    cache: Arc<dyn CacheBackend>,
    codec: Arc<dyn TokenCodec>,
    revocations: Arc<RevocationStore>,
    rotation: Arc<RefreshRotation>,
    applications: Arc<dyn ApplicationStore>,
    users: Arc<dyn UserStore>,
    audit: AuditLogger,
    config: LifecycleConfig,
}

impl TokenExchange {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        cache: Arc<dyn CacheBackend>,
        codec: Arc<dyn TokenCodec>,
        revocations: Arc<RevocationStore>,
        rotation: Arc<RefreshRotation>,
        applications: Arc<dyn ApplicationStore>,
        users: Arc<dyn UserStore>,
        audit: AuditLogger,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            cache,
            codec,
            revocations,
            rotation,
            applications,
            users,
            audit,
            config: config.normalize(),
        }
    }

    async fn check_rate_limit(&self, user_id: Uuid) -> Result<()> {
        let key = format!("{RATE_KEY_PREFIX}{user_id}");
        let count = self
            .cache
            .increment_window(&key, self.config.exchange_rate_window())
            .await?;
        if count > self.config.exchange_rate_limit() {
            warn!(%user_id, count, "token exchange rate limit exceeded");
            return Err(Error::RateLimitExceeded);
        }
        Ok(())
    }

    /// Issue a code that `target_app_id` can redeem for tokens of the access
    /// token's user.
    ///
    /// # Errors
    /// [`Error::Unauthorized`] for an invalid, expired or revoked access token,
    /// [`Error::RateLimitExceeded`], [`Error::NotFound`] for an unknown application,
    /// [`Error::Forbidden`] for an inactive one.
    pub async fn create_exchange(
        &self,
        access_token: &str,
        target_app_id: Uuid,
        source_app_id: Option<Uuid>,
        client: &ClientContext,
    ) -> Result<ExchangeCode> {
        let claims = self
            .codec
            .validate_access_token(access_token)
            .map_err(|_| Error::Unauthorized)?;
        if self
            .revocations
            .is_blacklisted(&hash_token(access_token))
            .await
        {
            return Err(Error::Unauthorized);
        }

        self.check_rate_limit(claims.sub).await?;

        let application = self
            .applications
            .application_by_id(target_app_id)
            .await?
            .ok_or(Error::NotFound("application"))?;
        if !application.is_active {
            return Err(Error::Forbidden("target application is not active"));
        }

        let code = random_code()?;
        let created_at = Utc::now();
        let ttl = self.config.exchange_code_ttl();
        let expires_at = created_at
            + chrono::Duration::from_std(ttl).map_err(|err| Error::Validation(err.to_string()))?;
        let payload = TokenExchangeCode {
            user_id: claims.sub,
            source_app_id: source_app_id.or(claims.app_id),
            target_app_id,
            created_at,
            expires_at,
        };
        let value = serde_json::to_string(&payload).map_err(StoreError::from)?;
        self.cache
            .set(&format!("{CODE_KEY_PREFIX}{code}"), &value, ttl)
            .await?;

        self.audit.log(
            AuditEvent::new(AuditAction::TokenExchangeCreate, AuditStatus::Success, client)
                .with_user(claims.sub)
                .with_details(json!({ "target_app_id": target_app_id })),
        );
        debug!(user_id = %claims.sub, %target_app_id, "exchange code issued");

        Ok(ExchangeCode {
            code,
            expires_at,
            redirect_url: application.homepage_url.filter(|url| !url.is_empty()),
        })
    }

    /// Redeem a code for a token pair scoped to its target application.
    ///
    /// When `redeeming_app_id` is given it must equal the code's target.
    ///
    /// # Errors
    /// [`Error::InvalidOrExpired`] for an unknown, expired or already redeemed code,
    /// [`Error::Forbidden`] for an application mismatch (the code is consumed),
    /// [`Error::NotFound`] when the user no longer exists.
    pub async fn redeem_exchange(
        &self,
        code: &str,
        redeeming_app_id: Option<Uuid>,
        client: &ClientContext,
    ) -> Result<ExchangeRedemption> {
        let Some(value) = self.cache.take(&format!("{CODE_KEY_PREFIX}{code}")).await? else {
            return Err(Error::InvalidOrExpired);
        };
        let exchange: TokenExchangeCode =
            serde_json::from_str(&value).map_err(StoreError::from)?;
        if exchange.expires_at <= Utc::now() {
            return Err(Error::InvalidOrExpired);
        }

        if let Some(redeeming_app_id) = redeeming_app_id {
            if redeeming_app_id != exchange.target_app_id {
                self.audit.log(
                    AuditEvent::new(
                        AuditAction::TokenExchangeRedeem,
                        AuditStatus::Failed,
                        client,
                    )
                    .with_user(exchange.user_id)
                    .with_details(json!({
                        "reason": "app_mismatch",
                        "expected_app_id": exchange.target_app_id,
                        "redeeming_app_id": redeeming_app_id,
                    })),
                );
                return Err(Error::Forbidden(
                    "exchange code was not issued for this application",
                ));
            }
        }

        let user = self
            .users
            .user_by_id(exchange.user_id)
            .await?
            .ok_or(Error::NotFound("user"))?;

        let tokens = self
            .rotation
            .mint(&user, Some(exchange.target_app_id), client)
            .await?;

        self.audit.log(
            AuditEvent::new(AuditAction::TokenExchangeRedeem, AuditStatus::Success, client)
                .with_user(user.id)
                .with_details(json!({
                    "target_app_id": exchange.target_app_id,
                    "source_app_id": exchange.source_app_id,
                })),
        );
        info!(user_id = %user.id, app_id = %exchange.target_app_id, "exchange code redeemed");

        Ok(ExchangeRedemption {
            tokens,
            application_id: exchange.target_app_id,
        })
    }
}
