//! Sign-in, refresh, and logout transitions of refresh tokens.
//!
//! A refresh token moves `Issued -> Rotated | LoggedOut | Expired` and never back.
//! Rotation revokes the predecessor and inserts the successor in one store call, so
//! two concurrent refreshes of the same token produce exactly one successor.
//! Presenting a rotated token is `TokenRevoked`; the rest of its chain stays valid.

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::audit::{AuditAction, AuditEvent, AuditLogger, AuditStatus};
use super::codec::TokenCodec;
use super::error::{Error, Result};
use super::hash::hash_token;
use super::revocation::RevocationStore;
use super::session::{session_name, ClientContext, NewSession, SessionLedger, SessionRefresh};
use crate::store::{RefreshToken, RefreshTokenStore, User, UserStore};

/// Credentials handed to the client. The raw tokens exist only here.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    /// Access token lifetime in seconds.
    pub expires_in: u64,
    pub user: User,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_id: Option<Uuid>,
}

pub struct RefreshRotation {
    codec: Arc<dyn TokenCodec>,
    revocations: Arc<RevocationStore>,
    sessions: Arc<SessionLedger>,
    tokens: Arc<dyn RefreshTokenStore>,
    users: Arc<dyn UserStore>,
    audit: AuditLogger,
}

struct Minted {
    pair: TokenPair,
    record: RefreshToken,
    access_hash: String,
}

fn chrono_ttl(ttl: std::time::Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(ttl).map_err(|err| Error::Codec(err.to_string()))
}

impl RefreshRotation {
    #[must_use]
    pub fn new(
        codec: Arc<dyn TokenCodec>,
        revocations: Arc<RevocationStore>,
        sessions: Arc<SessionLedger>,
        tokens: Arc<dyn RefreshTokenStore>,
        users: Arc<dyn UserStore>,
        audit: AuditLogger,
    ) -> Self {
        Self {
            codec,
            revocations,
            sessions,
            tokens,
            users,
            audit,
        }
    }

    fn mint_pair(&self, user: &User, app_id: Option<Uuid>, client: &ClientContext) -> Result<Minted> {
        let access_token = self.codec.generate_access_token(user, app_id)?;
        let refresh_token = self.codec.generate_refresh_token(user, app_id)?;
        let device = self.sessions.device_info(&client.user_agent);
        let now = Utc::now();

        let record = RefreshToken {
            id: Uuid::now_v7(),
            user_id: user.id,
            app_id,
            token_hash: hash_token(&refresh_token),
            session_name: session_name(&device),
            device_type: device.device_type,
            os: device.os,
            browser: device.browser,
            ip_address: client.ip_address.clone(),
            created_at: now,
            expires_at: now + chrono_ttl(self.codec.refresh_token_ttl())?,
            revoked_at: None,
        };

        Ok(Minted {
            access_hash: hash_token(&access_token),
            pair: TokenPair {
                access_token,
                refresh_token,
                token_type: "Bearer",
                expires_in: self.codec.access_token_ttl().as_secs(),
                user: user.clone(),
                app_id,
            },
            record,
        })
    }

    fn new_session(minted: &Minted, client: &ClientContext) -> NewSession {
        NewSession {
            user_id: minted.record.user_id,
            app_id: minted.record.app_id,
            token_hash: minted.record.token_hash.clone(),
            access_token_hash: Some(minted.access_hash.clone()),
            client: client.clone(),
            expires_at: minted.record.expires_at,
            session_name: None,
        }
    }

    /// Mint a pair, persist its refresh token and open a session, without auditing.
    /// Callers emit their own audit event.
    ///
    /// # Errors
    /// [`Error::Codec`] or [`Error::Store`]. Session failures are absorbed.
    pub async fn mint(
        &self,
        user: &User,
        app_id: Option<Uuid>,
        client: &ClientContext,
    ) -> Result<TokenPair> {
        let minted = self.mint_pair(user, app_id, client)?;
        self.tokens.create_refresh_token(&minted.record).await?;
        self.sessions
            .create_session_non_fatal(Self::new_session(&minted, client))
            .await;
        Ok(minted.pair)
    }

    /// Complete a sign-in for an already-authenticated user.
    ///
    /// # Errors
    /// As [`RefreshRotation::mint`].
    pub async fn issue_tokens(
        &self,
        user: &User,
        app_id: Option<Uuid>,
        client: &ClientContext,
    ) -> Result<TokenPair> {
        let pair = self.mint(user, app_id, client).await?;
        self.audit.log(
            AuditEvent::new(AuditAction::Signin, AuditStatus::Success, client)
                .with_user(user.id)
                .with_details(json!({ "app_id": app_id })),
        );
        info!(user_id = %user.id, "tokens issued");
        Ok(pair)
    }

    fn refresh_failed(&self, user_id: Option<Uuid>, client: &ClientContext, err: &Error) {
        let mut event = AuditEvent::new(AuditAction::RefreshToken, AuditStatus::Failed, client)
            .with_details(json!({ "reason": err.code() }));
        if let Some(user_id) = user_id {
            event = event.with_user(user_id);
        }
        self.audit.log(event);
    }

    /// Trade a refresh token for a new pair, revoking the presented one.
    ///
    /// # Errors
    /// [`Error::InvalidToken`] for a bad or unknown token, [`Error::TokenRevoked`] for
    /// a blacklisted, logged-out or already rotated token, [`Error::TokenExpired`].
    pub async fn refresh(&self, refresh_token: &str, client: &ClientContext) -> Result<TokenPair> {
        let claims = match self.codec.validate_refresh_token(refresh_token) {
            Ok(claims) => claims,
            Err(err) => {
                let err = match err {
                    Error::TokenExpired => Error::TokenExpired,
                    _ => Error::InvalidToken,
                };
                self.refresh_failed(None, client, &err);
                return Err(err);
            }
        };

        let token_hash = hash_token(refresh_token);
        if self.revocations.is_blacklisted(&token_hash).await {
            self.refresh_failed(Some(claims.sub), client, &Error::TokenRevoked);
            return Err(Error::TokenRevoked);
        }

        let Some(record) = self.tokens.refresh_token_by_hash(&token_hash).await? else {
            self.refresh_failed(Some(claims.sub), client, &Error::InvalidToken);
            return Err(Error::InvalidToken);
        };
        if record.is_revoked() {
            debug!(user_id = %record.user_id, "rotated or revoked refresh token presented");
            self.refresh_failed(Some(record.user_id), client, &Error::TokenRevoked);
            return Err(Error::TokenRevoked);
        }
        if record.is_expired_at(Utc::now()) {
            self.refresh_failed(Some(record.user_id), client, &Error::TokenExpired);
            return Err(Error::TokenExpired);
        }

        let Some(user) = self.users.user_by_id(record.user_id).await? else {
            self.refresh_failed(Some(record.user_id), client, &Error::NotFound("user"));
            return Err(Error::NotFound("user"));
        };

        let minted = self.mint_pair(&user, record.app_id, client)?;
        if !self
            .tokens
            .rotate_refresh_token(&token_hash, &minted.record)
            .await?
        {
            // A concurrent refresh won the rotation.
            self.refresh_failed(Some(user.id), client, &Error::TokenRevoked);
            return Err(Error::TokenRevoked);
        }

        let moved = self
            .sessions
            .refresh_session_non_fatal(SessionRefresh {
                old_token_hash: token_hash,
                new_token_hash: minted.record.token_hash.clone(),
                new_access_token_hash: minted.access_hash.clone(),
                new_expires_at: minted.record.expires_at,
            })
            .await;
        if !moved {
            self.sessions
                .create_session_non_fatal(Self::new_session(&minted, client))
                .await;
        }

        self.audit.log(
            AuditEvent::new(AuditAction::RefreshToken, AuditStatus::Success, client)
                .with_user(user.id),
        );
        Ok(minted.pair)
    }

    /// Sign the user out everywhere.
    ///
    /// The access token is identified without requiring it to still be valid, its
    /// hash is blacklisted for the access-token TTL, and every refresh token and
    /// session of the user is revoked.
    ///
    /// The signature is not checked either. Whoever presents a token naming a user,
    /// including one signed with a foreign key, signs that user out on every device.
    /// No tokens are minted on this path, so the exposure is forced sign-out only.
    ///
    /// # Errors
    /// [`Error::InvalidToken`] when the token cannot be decoded. When both blacklist
    /// backends fail the refresh tokens are still revoked and
    /// [`Error::StorageUnavailable`] is returned.
    pub async fn logout(&self, access_token: &str, client: &ClientContext) -> Result<()> {
        let claims = self.codec.extract_claims(access_token)?;
        let user_id = claims.sub;

        let blacklisted = self
            .revocations
            .add_access_token(&hash_token(access_token), Some(user_id))
            .await;
        if let Err(err) = &blacklisted {
            warn!(%user_id, "failed to blacklist access token on logout: {err}");
        }

        let revoked = self.tokens.revoke_all_user_tokens(user_id).await?;
        if let Err(err) = self.sessions.revoke_user_sessions(user_id).await {
            warn!(%user_id, "failed to revoke sessions on logout: {err}");
        }

        self.audit.log(
            AuditEvent::new(AuditAction::Signout, AuditStatus::Success, client)
                .with_user(user_id)
                .with_details(json!({ "revoked_refresh_tokens": revoked })),
        );
        info!(%user_id, revoked, "user logged out");
        blacklisted
    }

    /// Sign out a single device. Sessions of other users are reported as missing.
    ///
    /// # Errors
    /// [`Error::NotFound`] for an unknown or foreign session, [`Error::Store`].
    pub async fn revoke_session(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        client: &ClientContext,
    ) -> Result<()> {
        let session = self
            .sessions
            .session(session_id)
            .await?
            .filter(|session| session.user_id == user_id)
            .ok_or(Error::NotFound("session"))?;

        if let Err(err) = self.revocations.blacklist_session_tokens(&session).await {
            warn!(%session_id, "continuing session revocation without blacklist: {err}");
        }
        self.tokens.revoke_refresh_token(&session.token_hash).await?;
        self.sessions.revoke_session(session_id).await?;

        self.audit.log(
            AuditEvent::new(AuditAction::SessionRevoked, AuditStatus::Success, client)
                .with_user(user_id)
                .with_details(json!({
                    "session": session_id,
                    "device": session.device_type,
                    "os": session.os,
                })),
        );
        Ok(())
    }

    async fn replace_password(
        &self,
        user_id: Uuid,
        password_hash: &str,
        reset: bool,
        client: &ClientContext,
    ) -> Result<()> {
        if !self.users.update_password_hash(user_id, password_hash).await? {
            return Err(Error::NotFound("user"));
        }

        let revoked = self.tokens.revoke_all_user_tokens(user_id).await?;
        if let Err(err) = self.sessions.revoke_user_sessions(user_id).await {
            warn!(%user_id, "failed to revoke sessions after password change: {err}");
        }

        let details = if reset {
            json!({ "reset": true })
        } else {
            serde_json::Value::Null
        };
        self.audit.log(
            AuditEvent::new(AuditAction::ChangePassword, AuditStatus::Success, client)
                .with_user(user_id)
                .with_details(details),
        );
        info!(%user_id, revoked, reset, "password replaced, refresh tokens revoked");
        Ok(())
    }

    /// Store a new password hash (verified and hashed by the caller) and force
    /// re-authentication everywhere.
    ///
    /// # Errors
    /// [`Error::NotFound`] for an unknown user, [`Error::Store`].
    pub async fn change_password(
        &self,
        user_id: Uuid,
        password_hash: &str,
        client: &ClientContext,
    ) -> Result<()> {
        self.replace_password(user_id, password_hash, false, client)
            .await
    }

    /// Reset-flow variant of [`RefreshRotation::change_password`].
    ///
    /// # Errors
    /// As [`RefreshRotation::change_password`].
    pub async fn reset_password(
        &self,
        user_id: Uuid,
        password_hash: &str,
        client: &ClientContext,
    ) -> Result<()> {
        self.replace_password(user_id, password_hash, true, client)
            .await
    }
}
