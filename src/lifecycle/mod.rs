//! Token and session lifecycle.
//!
//! The components are layered bottom-up:
//!
//! - [`pkce`] and [`hash`]: stateless primitives.
//! - [`codec`]: signs and validates access/refresh tokens ([`TokenCodec`]).
//! - [`revocation`]: dual-backend blacklist of token hashes.
//! - [`session`]: one session row per issued refresh token.
//! - [`rotation`]: sign-in, refresh, logout and password-change transitions.
//! - [`exchange`]: single-use cross-application exchange codes.
//!
//! [`Engine`] wires them over a set of [`Backends`].

pub mod audit;
pub mod codec;
pub mod config;
pub mod error;
pub mod exchange;
pub mod hash;
pub mod pkce;
pub mod revocation;
pub mod rotation;
pub mod session;

use std::sync::Arc;

use crate::store::{
    ApplicationStore, CacheBackend, RefreshTokenStore, RevocationRepository, SessionStore,
    UserStore,
};

pub use self::audit::{AuditAction, AuditEvent, AuditLogger, AuditSink, AuditStatus};
pub use self::codec::{Claims, JwtCodec, TokenCodec, TokenType};
pub use self::config::LifecycleConfig;
pub use self::error::{Error, Result};
pub use self::exchange::{ExchangeCode, ExchangeRedemption, TokenExchange};
pub use self::pkce::{CodeChallengeMethod, PkceParams};
pub use self::revocation::{RevocationStats, RevocationStore, SyncReport};
pub use self::rotation::{RefreshRotation, TokenPair};
pub use self::session::{ClientContext, DeviceParser, HeuristicDeviceParser, SessionLedger};

/// Storage handles the engine runs on.
#[derive(Clone)]
pub struct Backends {
    pub cache: Arc<dyn CacheBackend>,
    pub refresh_tokens: Arc<dyn RefreshTokenStore>,
    pub revocations: Arc<dyn RevocationRepository>,
    pub sessions: Arc<dyn SessionStore>,
    pub users: Arc<dyn UserStore>,
    pub applications: Arc<dyn ApplicationStore>,
}

impl Backends {
    /// Use one durable store for every durable seam.
    #[must_use]
    pub fn from_durable<S>(cache: Arc<dyn CacheBackend>, durable: Arc<S>) -> Self
    where
        S: RefreshTokenStore
            + RevocationRepository
            + SessionStore
            + UserStore
            + ApplicationStore
            + 'static,
    {
        Self {
            cache,
            refresh_tokens: durable.clone(),
            revocations: durable.clone(),
            sessions: durable.clone(),
            users: durable.clone(),
            applications: durable,
        }
    }
}

/// Fully wired lifecycle components, cheap to clone.
#[derive(Clone)]
pub struct Engine {
    pub config: LifecycleConfig,
    pub codec: Arc<dyn TokenCodec>,
    pub revocations: Arc<RevocationStore>,
    pub sessions: Arc<SessionLedger>,
    pub rotation: Arc<RefreshRotation>,
    pub exchange: Arc<TokenExchange>,
}

impl Engine {
    #[must_use]
    pub fn new(
        backends: Backends,
        codec: Arc<dyn TokenCodec>,
        audit_sink: Arc<dyn AuditSink>,
        config: LifecycleConfig,
    ) -> Self {
        let config = config.normalize();
        let audit = AuditLogger::new(audit_sink, config.audit_timeout());

        let revocations = Arc::new(RevocationStore::new(
            backends.cache.clone(),
            backends.revocations,
            codec.clone(),
        ));
        let sessions = Arc::new(SessionLedger::new(
            backends.sessions,
            Arc::new(HeuristicDeviceParser),
            config.session_retention(),
        ));
        let rotation = Arc::new(RefreshRotation::new(
            codec.clone(),
            revocations.clone(),
            sessions.clone(),
            backends.refresh_tokens,
            backends.users.clone(),
            audit.clone(),
        ));
        let exchange = Arc::new(TokenExchange::new(
            backends.cache,
            codec.clone(),
            revocations.clone(),
            rotation.clone(),
            backends.applications,
            backends.users,
            audit,
            config,
        ));

        Self {
            config,
            codec,
            revocations,
            sessions,
            rotation,
            exchange,
        }
    }
}
