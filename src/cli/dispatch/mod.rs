//! Map validated CLI arguments to an [`Action`].

use crate::cli::actions::{server::Args, Action};
use crate::cli::commands::tokens;
use anyhow::{Context, Result};

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>("port").copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>("dsn")
        .cloned()
        .context("missing required argument: --dsn")?;

    let token_opts = tokens::Options::parse(matches)?;

    Ok(Action::Server(Args {
        port,
        dsn,
        token_secret: token_opts.secret,
        token_issuer: token_opts.issuer,
        access_token_ttl_seconds: token_opts.access_token_ttl_seconds,
        refresh_token_ttl_seconds: token_opts.refresh_token_ttl_seconds,
        exchange_rate_limit: token_opts.exchange_rate_limit,
        blacklist_cleanup_interval_seconds: token_opts.blacklist_cleanup_interval_seconds,
        cache_max_capacity: token_opts.cache_max_capacity,
    }))
}
