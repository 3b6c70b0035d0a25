//! Fire-and-forget audit trail.
//!
//! Lifecycle operations describe what happened as an [`AuditEvent`] and hand it to an
//! [`AuditLogger`]. The logger spawns a detached task per event bounded by its own
//! timeout, so a slow sink never delays the response and a cancelled request never
//! cancels the write. Sink failures are logged and dropped.
//!
//! The default sink is [`TracingAuditSink`], which emits events on the `audit` target.
//! [`MemoryAuditSink`] keeps events in memory for tests and local inspection.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use super::session::ClientContext;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Signin,
    RefreshToken,
    Signout,
    ChangePassword,
    SessionRevoked,
    TokenExchangeCreate,
    TokenExchangeRedeem,
}

impl AuditAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Signin => "signin",
            Self::RefreshToken => "refresh_token",
            Self::Signout => "signout",
            Self::ChangePassword => "change_password",
            Self::SessionRevoked => "session_revoked",
            Self::TokenExchangeCreate => "token_exchange_create",
            Self::TokenExchangeRedeem => "token_exchange_redeem",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Success,
    Failed,
}

impl fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Success => "success",
            Self::Failed => "failed",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AuditEvent {
    pub user_id: Option<Uuid>,
    pub action: AuditAction,
    pub status: AuditStatus,
    pub ip_address: String,
    pub user_agent: String,
    pub details: serde_json::Value,
}

impl AuditEvent {
    #[must_use]
    pub fn new(action: AuditAction, status: AuditStatus, client: &ClientContext) -> Self {
        Self {
            user_id: None,
            action,
            status,
            ip_address: client.ip_address.clone(),
            user_agent: client.user_agent.clone(),
            details: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn with_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Audit log storage.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Persist one event, or return an error to have it logged and dropped.
    async fn record(&self, event: &AuditEvent) -> anyhow::Result<()>;
}

/// Default sink that writes events to the `audit` tracing target.
#[derive(Clone, Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: &AuditEvent) -> anyhow::Result<()> {
        info!(
            target: "audit",
            user_id = ?event.user_id,
            action = %event.action,
            status = %event.status,
            ip_address = %event.ip_address,
            user_agent = %event.user_agent,
            details = %event.details,
            "audit event"
        );
        Ok(())
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().await.clone()
    }

    /// Poll until at least `count` events arrived or `timeout` elapsed.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<AuditEvent> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let events = self.events().await;
            if events.len() >= count || tokio::time::Instant::now() >= deadline {
                return events;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: &AuditEvent) -> anyhow::Result<()> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

#[derive(Clone)]
pub struct AuditLogger {
    sink: Arc<dyn AuditSink>,
    timeout: Duration,
}

impl fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditLogger")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl AuditLogger {
    #[must_use]
    pub fn new(sink: Arc<dyn AuditSink>, timeout: Duration) -> Self {
        Self { sink, timeout }
    }

    /// Dispatch an event on a detached task. Never blocks and never fails.
    pub fn log(&self, event: AuditEvent) -> tokio::task::JoinHandle<()> {
        let sink = Arc::clone(&self.sink);
        let timeout = self.timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, sink.record(&event)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(action = %event.action, "failed to write audit event: {err:#}");
                }
                Err(_) => {
                    warn!(action = %event.action, "audit event timed out after {timeout:?}");
                }
            }
        })
    }
}
