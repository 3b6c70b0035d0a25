use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;

use crate::store::memory::DEFAULT_CACHE_MAX_CAPACITY;

pub const ARG_TOKEN_SECRET: &str = "token-secret";
pub const ARG_TOKEN_ISSUER: &str = "token-issuer";
pub const ARG_ACCESS_TOKEN_TTL: &str = "access-token-ttl";
pub const ARG_REFRESH_TOKEN_TTL: &str = "refresh-token-ttl";
pub const ARG_EXCHANGE_RATE_LIMIT: &str = "exchange-rate-limit";
pub const ARG_BLACKLIST_CLEANUP_INTERVAL: &str = "blacklist-cleanup-interval";
pub const ARG_CACHE_MAX_CAPACITY: &str = "cache-max-capacity";

#[derive(Debug)]
pub struct Options {
    pub secret: SecretString,
    pub issuer: String,
    pub access_token_ttl_seconds: u64,
    pub refresh_token_ttl_seconds: u64,
    pub exchange_rate_limit: u64,
    pub blacklist_cleanup_interval_seconds: u64,
    pub cache_max_capacity: u64,
}

impl Options {
    /// Parse token arguments from matches.
    ///
    /// # Errors
    /// Returns an error if the signing secret is missing or blank.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let secret = matches
            .get_one::<String>(ARG_TOKEN_SECRET)
            .filter(|v| !v.trim().is_empty())
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("missing required argument: --{ARG_TOKEN_SECRET}"))?;

        let read_u64 = |id: &str, default: u64| matches.get_one::<u64>(id).copied().unwrap_or(default);

        Ok(Self {
            secret: SecretString::from(secret),
            issuer: matches
                .get_one::<String>(ARG_TOKEN_ISSUER)
                .cloned()
                .unwrap_or_else(|| "tokengate".to_string()),
            access_token_ttl_seconds: read_u64(ARG_ACCESS_TOKEN_TTL, 900),
            refresh_token_ttl_seconds: read_u64(ARG_REFRESH_TOKEN_TTL, 604_800),
            exchange_rate_limit: read_u64(ARG_EXCHANGE_RATE_LIMIT, 10),
            blacklist_cleanup_interval_seconds: read_u64(ARG_BLACKLIST_CLEANUP_INTERVAL, 3600),
            cache_max_capacity: read_u64(ARG_CACHE_MAX_CAPACITY, DEFAULT_CACHE_MAX_CAPACITY),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_TOKEN_SECRET)
                .long(ARG_TOKEN_SECRET)
                .help("HMAC secret used to sign access and refresh tokens")
                .env("TOKENGATE_TOKEN_SECRET")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new(ARG_TOKEN_ISSUER)
                .long(ARG_TOKEN_ISSUER)
                .help("Issuer claim written to and required in every token")
                .env("TOKENGATE_TOKEN_ISSUER")
                .default_value("tokengate"),
        )
        .arg(
            Arg::new(ARG_ACCESS_TOKEN_TTL)
                .long(ARG_ACCESS_TOKEN_TTL)
                .help("Access token lifetime in seconds")
                .env("TOKENGATE_ACCESS_TOKEN_TTL")
                .default_value("900")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_REFRESH_TOKEN_TTL)
                .long(ARG_REFRESH_TOKEN_TTL)
                .help("Refresh token lifetime in seconds")
                .env("TOKENGATE_REFRESH_TOKEN_TTL")
                .default_value("604800")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_EXCHANGE_RATE_LIMIT)
                .long(ARG_EXCHANGE_RATE_LIMIT)
                .help("Exchange codes a user may create per 60 second window")
                .env("TOKENGATE_EXCHANGE_RATE_LIMIT")
                .default_value("10")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_BLACKLIST_CLEANUP_INTERVAL)
                .long(ARG_BLACKLIST_CLEANUP_INTERVAL)
                .help("Seconds between purges of expired blacklist rows and old sessions")
                .env("TOKENGATE_BLACKLIST_CLEANUP_INTERVAL")
                .default_value("3600")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_CACHE_MAX_CAPACITY)
                .long(ARG_CACHE_MAX_CAPACITY)
                .help("Most keys held by the in-process cache; keep above the live blacklist size")
                .env("TOKENGATE_CACHE_MAX_CAPACITY")
                .default_value("1000000")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
}
