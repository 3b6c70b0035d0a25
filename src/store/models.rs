//! Records owned by the durable store and the keyed-TTL cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Durable refresh token record. `token_hash` is the only trace of the raw secret.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefreshToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub app_id: Option<Uuid>,
    pub token_hash: String,
    pub device_type: String,
    pub os: String,
    pub browser: String,
    pub ip_address: String,
    pub session_name: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl RefreshToken {
    #[must_use]
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// One authenticated device/browser instance, paired with a refresh token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    pub app_id: Option<Uuid>,
    #[serde(skip)]
    pub token_hash: String,
    #[serde(skip)]
    pub access_token_hash: Option<String>,
    pub device_type: String,
    pub os: String,
    pub browser: String,
    pub ip_address: String,
    pub user_agent: String,
    pub session_name: String,
    pub last_active_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Session {
    #[must_use]
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && now < self.expires_at
    }
}

/// A token hash marked invalid before its natural expiry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RevocationEntry {
    pub token_hash: String,
    pub user_id: Option<Uuid>,
    pub expires_at: DateTime<Utc>,
}

impl RevocationEntry {
    /// Remaining lifetime, or `None` once the entry has aged out.
    #[must_use]
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Option<Duration> {
        (self.expires_at - now).to_std().ok().filter(|ttl| !ttl.is_zero())
    }
}

/// User as seen by the lifecycle engine (credentials live elsewhere).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub username: Option<String>,
    pub roles: Vec<String>,
}

/// Client application a token can be scoped to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Application {
    pub id: Uuid,
    pub name: String,
    pub homepage_url: Option<String>,
    pub is_active: bool,
}

/// Payload stored under an exchange code in the keyed-TTL cache.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenExchangeCode {
    pub user_id: Uuid,
    pub source_app_id: Option<Uuid>,
    pub target_app_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}
