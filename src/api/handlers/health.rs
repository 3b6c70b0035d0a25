use crate::lifecycle::Engine;
use crate::GIT_COMMIT_HASH;
use axum::{
    extract::Extension,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Connection, PgPool};
use tracing::{debug, error, info_span, Instrument};
use utoipa::ToSchema;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct Health {
    commit: String,
    name: String,
    version: String,
    database: String,
    revocation: RevocationHealth,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct RevocationHealth {
    last_sync_at: Option<DateTime<Utc>>,
    total_synced: u64,
    sync_errors: u64,
    cache_errors: u64,
    durable_errors: u64,
}

async fn ping(pool: &PgPool) -> bool {
    let acquire_span = info_span!(
        "db.acquire",
        db.system = "postgresql",
        db.operation = "ACQUIRE"
    );
    match pool.acquire().instrument(acquire_span).await {
        Ok(mut conn) => {
            let ping_span = info_span!("db.ping", db.system = "postgresql", db.operation = "PING");
            match conn.ping().instrument(ping_span).await {
                Ok(()) => true,
                Err(err) => {
                    error!("Failed to ping database: {err}");
                    false
                }
            }
        }
        Err(err) => {
            error!("Failed to acquire database connection: {err}");
            false
        }
    }
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Durable store reachable", body = Health),
        (status = 503, description = "Durable store unreachable", body = Health)
    ),
    tag = "health"
)]
pub async fn health(
    engine: Extension<Engine>,
    pool: Option<Extension<PgPool>>,
) -> impl IntoResponse {
    let database = match &pool {
        Some(Extension(pool)) => Some(ping(pool).await),
        None => None,
    };
    let stats = engine.revocations.stats().await;

    let health = Health {
        commit: GIT_COMMIT_HASH.to_string(),
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database: match database {
            Some(true) => "ok",
            Some(false) => "error",
            None => "memory",
        }
        .to_string(),
        revocation: RevocationHealth {
            last_sync_at: stats.last_sync_at,
            total_synced: stats.total_synced,
            sync_errors: stats.sync_errors,
            cache_errors: stats.cache_errors,
            durable_errors: stats.durable_errors,
        },
    };

    let short_hash = health.commit.get(..7).unwrap_or_default();
    let mut headers = HeaderMap::new();
    match format!("{}:{}:{}", health.name, health.version, short_hash).parse::<HeaderValue>() {
        Ok(value) => {
            headers.insert("X-App", value);
        }
        Err(err) => error!("Failed to parse X-App header: {err}"),
    }

    let status = if database == Some(false) {
        debug!("Database connection is unhealthy");
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (status, headers, Json(health))
}
