use crate::lifecycle::{
    audit::TracingAuditSink, Backends, Engine, JwtCodec, LifecycleConfig, TokenCodec,
};
use crate::store::{MemoryCache, PgStore};
use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::MatchedPath,
    http::{HeaderName, HeaderValue, Request},
    Extension, Router,
};
use secrecy::SecretString;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::{sync::Arc, time::Duration};
use tokio::{net::TcpListener, task::JoinHandle};
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{error, info, info_span, Span};
use ulid::Ulid;
use utoipa_axum::router::OpenApiRouter;

pub mod handlers;
mod openapi;

pub use openapi::openapi;

/// Everything the server needs, resolved from the command line.
#[derive(Debug)]
pub struct ServerSettings {
    pub port: u16,
    pub dsn: String,
    pub token_secret: SecretString,
    pub token_issuer: String,
    pub access_token_ttl: Duration,
    pub refresh_token_ttl: Duration,
    pub cleanup_interval: Duration,
    pub cache_max_capacity: u64,
    pub lifecycle: LifecycleConfig,
}

/// Router with every documented route registered.
#[must_use]
pub fn router() -> OpenApiRouter {
    openapi::api_router()
}

/// Serve-ready application: documented routes, `/openapi.json`, request ids and
/// the engine (plus the pool, when there is one) as extensions.
#[must_use]
pub fn app(engine: Engine, pool: Option<PgPool>) -> Router {
    let (router, openapi) = router().split_for_parts();
    let openapi = Arc::new(openapi);
    let router = router.route(
        "/openapi.json",
        axum::routing::get(move || {
            let openapi = Arc::clone(&openapi);
            async move { axum::Json(openapi.as_ref().clone()) }
        }),
    );

    let router = match pool {
        Some(pool) => router.layer(Extension(pool)),
        None => router,
    };

    router.layer(
        ServiceBuilder::new()
            .layer(SetRequestHeaderLayer::if_not_present(
                HeaderName::from_static("x-request-id"),
                |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
            ))
            .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                "x-request-id",
            )))
            .layer(TraceLayer::new_for_http().make_span_with(make_span))
            .layer(Extension(engine)),
    )
}

/// Periodically purge expired blacklist rows and old sessions.
pub fn spawn_janitor(engine: Engine, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match engine.revocations.purge_expired().await {
                Ok(purged) => info!(purged, "purged expired blacklist entries"),
                Err(err) => error!("blacklist cleanup failed: {err}"),
            }
            match engine.sessions.cleanup_expired_sessions().await {
                Ok(deleted) => info!(deleted, "deleted expired sessions"),
                Err(err) => error!("session cleanup failed: {err}"),
            }
        }
    })
}

/// Start the server
/// # Errors
/// Return error if the database is unreachable or the listener cannot bind
pub async fn new(settings: ServerSettings) -> Result<()> {
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(&settings.dsn)
        .await
        .context("Failed to connect to database")?;

    let codec: Arc<dyn TokenCodec> = Arc::new(JwtCodec::new(
        &settings.token_secret,
        &settings.token_issuer,
        settings.access_token_ttl,
        settings.refresh_token_ttl,
    ));
    let backends = Backends::from_durable(
        Arc::new(MemoryCache::with_max_capacity(settings.cache_max_capacity)),
        Arc::new(PgStore::new(pool.clone())),
    );
    let engine = Engine::new(
        backends,
        codec,
        Arc::new(TracingAuditSink),
        settings.lifecycle,
    );

    // Warm the cache before taking traffic.
    match engine.revocations.sync_from_durable().await {
        Ok(report) => info!(
            total = report.total_entries,
            synced = report.synced,
            errors = report.errors,
            "blacklist cache warmed"
        ),
        Err(err) => error!("blacklist cache warm-up failed: {err}"),
    }

    let janitor = spawn_janitor(engine.clone(), settings.cleanup_interval);

    let app = app(engine, Some(pool));

    let listener = TcpListener::bind(format!("::0:{}", settings.port)).await?;

    info!("Listening on [::]:{}", settings.port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!("failed to listen for shutdown signal: {err}");
            }
            info!("Gracefully shutdown");
        })
        .await?;

    janitor.abort();

    Ok(())
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}
