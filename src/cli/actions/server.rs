use crate::{api, lifecycle::LifecycleConfig};
use anyhow::Result;
use secrecy::SecretString;
use std::time::Duration;
use tracing::info;
use url::Url;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: String,
    pub token_secret: SecretString,
    pub token_issuer: String,
    pub access_token_ttl_seconds: u64,
    pub refresh_token_ttl_seconds: u64,
    pub exchange_rate_limit: u64,
    pub blacklist_cleanup_interval_seconds: u64,
    pub cache_max_capacity: u64,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the database is unreachable or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    log_startup_args(&args);

    let config = LifecycleConfig::new().with_exchange_rate_limit(args.exchange_rate_limit);
    let settings = api::ServerSettings {
        port: args.port,
        dsn: args.dsn,
        token_secret: args.token_secret,
        token_issuer: args.token_issuer,
        access_token_ttl: Duration::from_secs(args.access_token_ttl_seconds),
        refresh_token_ttl: Duration::from_secs(args.refresh_token_ttl_seconds),
        cleanup_interval: Duration::from_secs(args.blacklist_cleanup_interval_seconds),
        cache_max_capacity: args.cache_max_capacity,
        lifecycle: config,
    };

    api::new(settings).await
}

fn log_startup_args(args: &Args) {
    let entries = [
        ("listen", format!("tcp:{}", args.port)),
        ("dsn", redact_dsn(&args.dsn)),
        ("token_issuer", args.token_issuer.clone()),
        ("access_token_ttl", format!("{}s", args.access_token_ttl_seconds)),
        ("refresh_token_ttl", format!("{}s", args.refresh_token_ttl_seconds)),
        ("exchange_rate_limit", args.exchange_rate_limit.to_string()),
        (
            "blacklist_cleanup_interval",
            format!("{}s", args.blacklist_cleanup_interval_seconds),
        ),
        ("cache_max_capacity", args.cache_max_capacity.to_string()),
    ];
    let max_key_len = entries.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    let mut message = format!(
        "tokengate {} - {}\n\nStartup configuration:",
        env!("CARGO_PKG_VERSION"),
        short_commit(crate::GIT_COMMIT_HASH)
    );
    for (key, value) in &entries {
        let padding = " ".repeat(max_key_len.saturating_sub(key.len()));
        let _ =
            std::fmt::Write::write_fmt(&mut message, format_args!("\n  {key}:{padding} {value}"));
    }
    info!("{message}");
}

fn redact_dsn(dsn: &str) -> String {
    match Url::parse(dsn) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("REDACTED"));
            }
            parsed.to_string()
        }
        Err(_) => "invalid-dsn".to_string(),
    }
}

fn short_commit(hash: &str) -> &str {
    let trimmed = hash.trim();
    trimmed.get(..7).unwrap_or(trimmed)
}
