//! HTTP surface over the in-memory backends.

use anyhow::Result;
use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use secrecy::SecretString;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokengate::api;
use tokengate::lifecycle::audit::MemoryAuditSink;
use tokengate::lifecycle::{Backends, ClientContext, Engine, JwtCodec, LifecycleConfig};
use tokengate::store::{Application, MemoryCache, MemoryStore, User};
use tower::ServiceExt;
use uuid::Uuid;

struct Fixture {
    app: Router,
    engine: Engine,
    user: User,
    target_app: Uuid,
}

async fn fixture() -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let engine = Engine::new(
        Backends::from_durable(Arc::new(MemoryCache::new()), store.clone()),
        Arc::new(JwtCodec::new(
            &SecretString::from("http-secret".to_string()),
            "tokengate",
            Duration::from_secs(900),
            Duration::from_secs(604_800),
        )),
        Arc::new(MemoryAuditSink::new()),
        LifecycleConfig::default(),
    );
    let user = User {
        id: Uuid::new_v4(),
        email: "erin@example.com".to_string(),
        username: None,
        roles: vec!["user".to_string()],
    };
    store.insert_user(user.clone()).await;
    let target_app = Uuid::new_v4();
    store
        .insert_application(Application {
            id: target_app,
            name: "reports".to_string(),
            homepage_url: None,
            is_active: true,
        })
        .await;

    Fixture {
        app: api::app(engine.clone(), None),
        engine,
        user,
        target_app,
    }
}

async fn send(app: &Router, request: Request<Body>) -> Result<(StatusCode, Value)> {
    let response = app.clone().oneshot(request).await?;
    let status = response.status();
    let bytes = to_bytes(response.into_body(), 1024 * 1024).await?;
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)?
    };
    Ok((status, body))
}

fn post_json(uri: &str, body: &Value) -> Result<Request<Body>> {
    Ok(Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(body)?))?)
}

#[tokio::test]
async fn refresh_rotates_and_rejects_reuse() -> Result<()> {
    let f = fixture().await;
    let pair = f
        .engine
        .rotation
        .issue_tokens(&f.user, None, &ClientContext::new("127.0.0.1", "test"))
        .await?;

    let request = post_json(
        "/v1/auth/refresh",
        &json!({ "refresh_token": pair.refresh_token }),
    )?;
    let (status, body) = send(&f.app, request).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["token_type"], "Bearer");
    assert_eq!(body["expires_in"], 900);
    assert_eq!(body["user"]["email"], "erin@example.com");

    let request = post_json(
        "/v1/auth/refresh",
        &json!({ "refresh_token": pair.refresh_token }),
    )?;
    let (status, body) = send(&f.app, request).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "token_revoked");
    Ok(())
}

#[tokio::test]
async fn logout_requires_bearer_token() -> Result<()> {
    let f = fixture().await;
    let (status, body) = send(
        &f.app,
        Request::post("/v1/auth/logout").body(Body::empty())?,
    )
    .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");

    let pair = f
        .engine
        .rotation
        .issue_tokens(&f.user, None, &ClientContext::new("127.0.0.1", "test"))
        .await?;
    let request = Request::post("/v1/auth/logout")
        .header(header::AUTHORIZATION, format!("Bearer {}", pair.access_token))
        .body(Body::empty())?;
    let (status, _) = send(&f.app, request).await?;
    assert_eq!(status, StatusCode::NO_CONTENT);
    Ok(())
}

#[tokio::test]
async fn exchange_round_trip_and_app_mismatch() -> Result<()> {
    let f = fixture().await;
    let pair = f
        .engine
        .rotation
        .issue_tokens(&f.user, None, &ClientContext::new("127.0.0.1", "test"))
        .await?;

    let create = |target: Uuid| -> Result<Request<Body>> {
        Ok(Request::post("/v1/token/exchange")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::AUTHORIZATION, format!("Bearer {}", pair.access_token))
            .body(Body::from(serde_json::to_vec(
                &json!({ "target_app_id": target }),
            )?))?)
    };

    let (status, body) = send(&f.app, create(Uuid::new_v4())?).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");

    let (status, body) = send(&f.app, create(f.target_app)?).await?;
    assert_eq!(status, StatusCode::OK);
    let code = body["exchange_code"].as_str().unwrap_or_default().to_string();
    assert_eq!(code.len(), 43);

    let redeem = |app_id: Uuid| -> Result<Request<Body>> {
        Ok(Request::post("/v1/token/exchange/redeem")
            .header(header::CONTENT_TYPE, "application/json")
            .header("x-application-id", app_id.to_string())
            .body(Body::from(serde_json::to_vec(
                &json!({ "exchange_code": code }),
            )?))?)
    };

    let (status, body) = send(&f.app, redeem(Uuid::new_v4())?).await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "forbidden");

    // The mismatched attempt consumed the code.
    let (status, body) = send(&f.app, redeem(f.target_app)?).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_or_expired_code");
    Ok(())
}

#[tokio::test]
async fn exchange_redeem_returns_scoped_tokens() -> Result<()> {
    let f = fixture().await;
    let pair = f
        .engine
        .rotation
        .issue_tokens(&f.user, None, &ClientContext::new("127.0.0.1", "test"))
        .await?;
    let issued = f
        .engine
        .exchange
        .create_exchange(
            &pair.access_token,
            f.target_app,
            None,
            &ClientContext::new("127.0.0.1", "test"),
        )
        .await?;

    let request = Request::post("/v1/token/exchange/redeem")
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-application-id", f.target_app.to_string())
        .body(Body::from(serde_json::to_vec(
            &json!({ "exchange_code": issued.code }),
        )?))?;
    let (status, body) = send(&f.app, request).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["application_id"], f.target_app.to_string());
    assert_eq!(body["user"]["id"], f.user.id.to_string());
    assert!(body["access_token"].as_str().is_some_and(|t| !t.is_empty()));
    Ok(())
}

#[tokio::test]
async fn pkce_challenge_and_verify() -> Result<()> {
    let f = fixture().await;
    let (status, body) = send(&f.app, post_json("/v1/pkce/challenge", &json!({}))?).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["code_challenge_method"], "S256");

    let verify = json!({
        "code_verifier": body["code_verifier"],
        "code_challenge": body["code_challenge"],
        "code_challenge_method": "S256",
    });
    let (status, result) = send(&f.app, post_json("/v1/pkce/verify", &verify)?).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["valid"], true);

    let wrong_method = json!({
        "code_verifier": body["code_verifier"],
        "code_challenge": body["code_challenge"],
        "code_challenge_method": "S512",
    });
    let (status, result) = send(&f.app, post_json("/v1/pkce/verify", &wrong_method)?).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(result["error"], "invalid_code_challenge_method");
    Ok(())
}

#[tokio::test]
async fn health_and_openapi_are_served() -> Result<()> {
    let f = fixture().await;
    let response = f
        .app
        .clone()
        .oneshot(Request::get("/health").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let bytes = to_bytes(response.into_body(), 1024 * 1024).await?;
    let body: Value = serde_json::from_slice(&bytes)?;
    assert_eq!(body["database"], "memory");

    let (status, spec) = send(
        &f.app,
        Request::get("/openapi.json").body(Body::empty())?,
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert!(spec["paths"]["/v1/token/exchange/redeem"].is_object());
    Ok(())
}
