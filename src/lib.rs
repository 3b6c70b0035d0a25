//! # Tokengate (Token & Session Lifecycle Engine)
//!
//! `tokengate` decides whether bearer tokens issued by a multi-tenant identity
//! gateway are currently valid, rotates refresh tokens on use, keeps a fast cache
//! and a durable store consistent for revocation decisions, tracks a session per
//! issued credential, and exchanges a token minted for one application for a token
//! scoped to another.
//!
//! ## Storage Model
//!
//! Revocation decisions read from two independently failing backends:
//!
//! - **Cache:** keyed entries with native TTL expiry. Consulted first on every check.
//! - **Durable:** Postgres rows with an explicit `expires_at`, purged by a janitor.
//!
//! A hash present in *either* copy is revoked. Writes go to both and only fail when
//! both fail. The cache is warmed from the durable copy at startup.
//!
//! ## Secrets
//!
//! Raw refresh tokens, access tokens and exchange codes are never persisted or
//! logged. Only SHA-256 hashes reach storage, and every comparison of secret
//! material is constant-time.

pub mod api;
pub mod cli;
pub mod lifecycle;
pub mod store;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            // Acceptable in non-git build environments
            return;
        }
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
    }

    #[test]
    fn test_app_user_agent_format() {
        assert!(APP_USER_AGENT.starts_with(env!("CARGO_PKG_NAME")));
        assert!(APP_USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }
}
