use std::time::Duration;

/// Tunables shared by the lifecycle components. Built once at startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LifecycleConfig {
    exchange_code_ttl: Duration,
    exchange_rate_limit: u64,
    exchange_rate_window: Duration,
    audit_timeout: Duration,
    session_retention: Duration,
}

impl LifecycleConfig {
    /// Defaults: 30s exchange codes, 10 exchanges per user per 60s, 10s audit
    /// timeout, and 7 days of retention for expired or revoked sessions.
    #[must_use]
    pub fn new() -> Self {
        Self {
            exchange_code_ttl: Duration::from_secs(30),
            exchange_rate_limit: 10,
            exchange_rate_window: Duration::from_secs(60),
            audit_timeout: Duration::from_secs(10),
            session_retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }

    #[must_use]
    pub fn with_exchange_code_ttl_seconds(mut self, seconds: u64) -> Self {
        self.exchange_code_ttl = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn with_exchange_rate_limit(mut self, limit: u64) -> Self {
        self.exchange_rate_limit = limit;
        self
    }

    #[must_use]
    pub fn with_exchange_rate_window_seconds(mut self, seconds: u64) -> Self {
        self.exchange_rate_window = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn with_audit_timeout_seconds(mut self, seconds: u64) -> Self {
        self.audit_timeout = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn with_session_retention_seconds(mut self, seconds: u64) -> Self {
        self.session_retention = Duration::from_secs(seconds);
        self
    }

    /// Replace zero values that would disable a guard with the smallest sane value.
    #[must_use]
    pub fn normalize(self) -> Self {
        let one_second = Duration::from_secs(1);
        Self {
            exchange_code_ttl: self.exchange_code_ttl.max(one_second),
            exchange_rate_limit: self.exchange_rate_limit.max(1),
            exchange_rate_window: self.exchange_rate_window.max(one_second),
            audit_timeout: self.audit_timeout.max(one_second),
            session_retention: self.session_retention,
        }
    }

    #[must_use]
    pub fn exchange_code_ttl(&self) -> Duration {
        self.exchange_code_ttl
    }

    #[must_use]
    pub fn exchange_rate_limit(&self) -> u64 {
        self.exchange_rate_limit
    }

    #[must_use]
    pub fn exchange_rate_window(&self) -> Duration {
        self.exchange_rate_window
    }

    #[must_use]
    pub fn audit_timeout(&self) -> Duration {
        self.audit_timeout
    }

    #[must_use]
    pub fn session_retention(&self) -> Duration {
        self.session_retention
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self::new()
    }
}
