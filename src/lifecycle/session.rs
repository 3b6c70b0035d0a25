//! Session ledger: one row per authenticated device, following its refresh token.

use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::error::{Error, Result};
use super::hash::hash_token;
use crate::store::{Session, SessionStore};

/// Where a request came from.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientContext {
    pub ip_address: String,
    pub user_agent: String,
}

impl ClientContext {
    #[must_use]
    pub fn new(ip_address: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            ip_address: ip_address.into(),
            user_agent: user_agent.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_type: String,
    pub os: String,
    pub browser: String,
    pub is_bot: bool,
}

impl DeviceInfo {
    fn unknown() -> Self {
        Self {
            device_type: "unknown".to_string(),
            os: "unknown".to_string(),
            browser: "unknown".to_string(),
            is_bot: false,
        }
    }
}

/// User-agent parsing seam.
pub trait DeviceParser: Send + Sync {
    fn parse(&self, user_agent: &str) -> DeviceInfo;
}

/// Keyword heuristics over the lowercased user agent.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeuristicDeviceParser;

const BOT_KEYWORDS: &[&str] = &[
    "bot",
    "crawler",
    "spider",
    "scraper",
    "curl",
    "wget",
    "python-requests",
    "monitor",
    "checker",
    "facebookexternalhit",
];

fn capture(pattern: &str, haystack: &str) -> Option<String> {
    Regex::new(pattern)
        .ok()
        .and_then(|regex| regex.captures(haystack))
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().replace('_', "."))
}

fn with_version(name: &str, pattern: &str, ua: &str) -> String {
    capture(pattern, ua).map_or_else(|| name.to_string(), |version| format!("{name} {version}"))
}

fn detect_bot(ua: &str) -> bool {
    BOT_KEYWORDS.iter().any(|keyword| ua.contains(keyword))
}

fn detect_device_type(ua: &str) -> &'static str {
    if detect_bot(ua) {
        "bot"
    } else if ua.contains("ipad")
        || ua.contains("tablet")
        || (ua.contains("android") && !ua.contains("mobile"))
    {
        "tablet"
    } else if ["mobile", "android", "iphone", "ipod", "windows phone", "blackberry"]
        .iter()
        .any(|keyword| ua.contains(keyword))
    {
        "mobile"
    } else if ["windows", "macintosh", "linux", "x11"]
        .iter()
        .any(|keyword| ua.contains(keyword))
    {
        "desktop"
    } else {
        "unknown"
    }
}

fn detect_os(ua: &str) -> String {
    if ua.contains("windows nt 10.0") {
        "Windows 10/11".to_string()
    } else if ua.contains("windows") {
        "Windows".to_string()
    } else if ua.contains("iphone os") || ua.contains("ipad") {
        with_version("iOS", r"(?:iphone|cpu) os ([\d_]+)", ua)
    } else if ua.contains("mac os x") {
        with_version("macOS", r"mac os x ([\d_]+)", ua)
    } else if ua.contains("android") {
        with_version("Android", r"android ([\d.]+)", ua)
    } else if ua.contains("linux") {
        ["ubuntu", "fedora", "debian"]
            .iter()
            .find(|distro| ua.contains(*distro))
            .map_or_else(
                || "Linux".to_string(),
                |distro| {
                    let mut name = distro.to_string();
                    name[..1].make_ascii_uppercase();
                    name
                },
            )
    } else {
        "unknown".to_string()
    }
}

fn detect_browser(ua: &str) -> String {
    if ua.contains("edg/") {
        with_version("Edge", r"edg/([\d.]+)", ua)
    } else if ua.contains("opr/") || ua.contains("opera/") {
        with_version("Opera", r"(?:opr|opera)/([\d.]+)", ua)
    } else if ua.contains("chrome/") {
        with_version("Chrome", r"chrome/([\d.]+)", ua)
    } else if ua.contains("safari/") {
        with_version("Safari", r"version/([\d.]+)", ua)
    } else if ua.contains("firefox/") {
        with_version("Firefox", r"firefox/([\d.]+)", ua)
    } else if ua.contains("msie") || ua.contains("trident/") {
        with_version("IE", r"(?:msie |rv:)([\d.]+)", ua)
    } else {
        "unknown".to_string()
    }
}

impl DeviceParser for HeuristicDeviceParser {
    fn parse(&self, user_agent: &str) -> DeviceInfo {
        if user_agent.trim().is_empty() {
            return DeviceInfo::unknown();
        }
        let ua = user_agent.to_lowercase();
        DeviceInfo {
            device_type: detect_device_type(&ua).to_string(),
            os: detect_os(&ua),
            browser: detect_browser(&ua),
            is_bot: detect_bot(&ua),
        }
    }
}

/// Human-readable label: "Chrome 120.0 on macOS 14.1", or "curl (Bot)".
#[must_use]
pub fn session_name(device: &DeviceInfo) -> String {
    let browser = if device.browser == "unknown" {
        "Unknown Browser"
    } else {
        device.browser.as_str()
    };
    if device.is_bot {
        return format!("{browser} (Bot)");
    }
    let os = if device.os == "unknown" {
        "Unknown OS"
    } else {
        device.os.as_str()
    };
    format!("{browser} on {os}")
}

#[derive(Clone, Debug)]
pub struct NewSession {
    pub user_id: Uuid,
    pub app_id: Option<Uuid>,
    /// Hash of the paired refresh token.
    pub token_hash: String,
    pub access_token_hash: Option<String>,
    pub client: ClientContext,
    pub expires_at: DateTime<Utc>,
    /// Derived from the user agent when absent.
    pub session_name: Option<String>,
}

impl NewSession {
    fn validate(&self) -> Result<()> {
        if self.user_id.is_nil() {
            return Err(Error::Validation("user_id is required".to_string()));
        }
        if self.token_hash.is_empty() {
            return Err(Error::Validation("token_hash is required".to_string()));
        }
        if self.expires_at <= Utc::now() {
            return Err(Error::Validation(
                "expires_at must be in the future".to_string(),
            ));
        }
        Ok(())
    }
}

/// Rotated hashes to move an existing session onto.
#[derive(Clone, Debug)]
pub struct SessionRefresh {
    pub old_token_hash: String,
    pub new_token_hash: String,
    pub new_access_token_hash: String,
    pub new_expires_at: DateTime<Utc>,
}

impl SessionRefresh {
    fn validate(&self) -> Result<()> {
        if self.old_token_hash.is_empty() {
            return Err(Error::Validation(
                "old_token_hash is required".to_string(),
            ));
        }
        if self.new_token_hash.is_empty() {
            return Err(Error::Validation(
                "new_token_hash is required".to_string(),
            ));
        }
        Ok(())
    }
}

pub struct SessionLedger {
    store: Arc<dyn SessionStore>,
    parser: Arc<dyn DeviceParser>,
    retention: Duration,
}

impl SessionLedger {
    #[must_use]
    pub fn new(
        store: Arc<dyn SessionStore>,
        parser: Arc<dyn DeviceParser>,
        retention: Duration,
    ) -> Self {
        Self {
            store,
            parser,
            retention,
        }
    }

    #[must_use]
    pub fn device_info(&self, user_agent: &str) -> DeviceInfo {
        self.parser.parse(user_agent)
    }

    /// # Errors
    /// [`Error::Validation`] for missing fields, [`Error::Store`] when persisting fails.
    pub async fn create_session(&self, params: NewSession) -> Result<Session> {
        params.validate()?;

        let device = self.parser.parse(&params.client.user_agent);
        let session_name = params
            .session_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| session_name(&device));
        let now = Utc::now();
        let session = Session {
            id: Uuid::now_v7(),
            user_id: params.user_id,
            app_id: params.app_id,
            token_hash: params.token_hash,
            access_token_hash: params.access_token_hash,
            device_type: device.device_type,
            os: device.os,
            browser: device.browser,
            ip_address: params.client.ip_address,
            user_agent: params.client.user_agent,
            session_name,
            last_active_at: now,
            created_at: now,
            expires_at: params.expires_at,
            revoked_at: None,
        };

        if let Err(err) = self.store.create_session(&session).await {
            error!(
                user_id = %session.user_id,
                device_type = %session.device_type,
                "session creation failed: {err}"
            );
            return Err(err.into());
        }

        info!(
            session_id = %session.id,
            user_id = %session.user_id,
            device_type = %session.device_type,
            session_name = %session.session_name,
            "session created"
        );
        Ok(session)
    }

    /// Like [`SessionLedger::create_session`] but never fails the caller.
    pub async fn create_session_non_fatal(&self, params: NewSession) -> Option<Session> {
        match self.create_session(params).await {
            Ok(session) => Some(session),
            Err(err) => {
                warn!("continuing without session record: {err}");
                None
            }
        }
    }

    /// Move the session paired with `old_token_hash` onto the rotated hashes.
    ///
    /// # Errors
    /// [`Error::NotFound`] when no active session is paired with the old hash.
    pub async fn refresh_session(&self, params: SessionRefresh) -> Result<()> {
        params.validate()?;
        let updated = self
            .store
            .refresh_session_tokens(
                &params.old_token_hash,
                &params.new_token_hash,
                &params.new_access_token_hash,
                params.new_expires_at,
            )
            .await?;
        if !updated {
            return Err(Error::NotFound("session"));
        }
        debug!(new_expires_at = %params.new_expires_at, "session tokens refreshed");
        Ok(())
    }

    /// Returns whether the session moved.
    pub async fn refresh_session_non_fatal(&self, params: SessionRefresh) -> bool {
        match self.refresh_session(params).await {
            Ok(()) => true,
            Err(err) => {
                warn!("failed to refresh session tokens: {err}");
                false
            }
        }
    }

    /// Revoke the active session paired with a refresh token hash. A missing session
    /// is not an error.
    ///
    /// # Errors
    /// [`Error::Store`] when the revoke itself fails.
    pub async fn revoke_session_by_token_hash(&self, token_hash: &str) -> Result<()> {
        let session = match self.store.session_by_token_hash(token_hash).await {
            Ok(Some(session)) => session,
            Ok(None) => return Ok(()),
            Err(err) => {
                debug!("session lookup failed during revoke: {err}");
                return Ok(());
            }
        };

        if let Err(err) = self.store.revoke_session(session.id).await {
            warn!(session_id = %session.id, "failed to revoke session: {err}");
            return Err(err.into());
        }
        info!(session_id = %session.id, user_id = %session.user_id, "session revoked");
        Ok(())
    }

    /// # Errors
    /// As [`SessionLedger::revoke_session_by_token_hash`].
    pub async fn revoke_session_by_token(&self, raw_token: &str) -> Result<()> {
        self.revoke_session_by_token_hash(&hash_token(raw_token))
            .await
    }

    /// # Errors
    /// [`Error::Store`].
    pub async fn revoke_session(&self, session_id: Uuid) -> Result<()> {
        Ok(self.store.revoke_session(session_id).await?)
    }

    /// # Errors
    /// [`Error::Store`].
    pub async fn revoke_user_sessions(&self, user_id: Uuid) -> Result<u64> {
        let revoked = self.store.revoke_user_sessions(user_id).await?;
        info!(%user_id, revoked, "user sessions revoked");
        Ok(revoked)
    }

    /// # Errors
    /// [`Error::Store`].
    pub async fn session(&self, session_id: Uuid) -> Result<Option<Session>> {
        Ok(self.store.session_by_id(session_id).await?)
    }

    /// Active sessions, most recently active first.
    ///
    /// # Errors
    /// [`Error::Store`].
    pub async fn list_user_sessions(&self, user_id: Uuid) -> Result<Vec<Session>> {
        Ok(self.store.user_sessions(user_id).await?)
    }

    /// Delete sessions that expired or were revoked longer ago than the retention.
    ///
    /// # Errors
    /// [`Error::Store`].
    pub async fn cleanup_expired_sessions(&self) -> Result<u64> {
        let retention = chrono::Duration::from_std(self.retention)
            .map_err(|err| Error::Validation(err.to_string()))?;
        let deleted = self
            .store
            .delete_expired_sessions(Utc::now() - retention)
            .await?;
        debug!(deleted, "expired sessions cleaned up");
        Ok(deleted)
    }
}
