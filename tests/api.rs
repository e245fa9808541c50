use std::sync::Arc;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::{Duration, Utc};
use gbp_sync::db::{self, Session};
use gbp_sync::gbp::{AccessToken, ListingSource, SourceError};
use gbp_sync::handlers::{router, AppState};
use gbp_sync::model::{ExternalListing, ListingStatus, NewListing};
use gbp_sync::reconcile::ReconcileOptions;
use gbp_sync::sync::SyncLocks;
use serde_json::{json, Map, Value};
use tower::ServiceExt;

const ORG: &str = "org-1";
const TOKEN: &str = "session-token";

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    db::create_organization(&pool, ORG, "Acme Group").await.unwrap();
    db::insert_session(
        &pool,
        &Session {
            token: TOKEN.into(),
            user_id: "user-1".into(),
            organization_id: ORG.into(),
            expires_at: Utc::now() + Duration::hours(1),
        },
    )
    .await
    .unwrap();
    pool
}

struct StaticSource {
    listings: Vec<ExternalListing>,
}

#[async_trait]
impl ListingSource for StaticSource {
    async fn authenticate(&self, refresh_token: &str) -> Result<AccessToken, SourceError> {
        if refresh_token == "revoked" {
            return Err(SourceError::Auth("invalid_grant".into()));
        }
        Ok(AccessToken::new("access"))
    }

    async fn fetch_listings(
        &self,
        _token: &AccessToken,
    ) -> Result<Vec<ExternalListing>, SourceError> {
        Ok(self.listings.clone())
    }
}

fn app(pool: &sqlx::SqlitePool, listings: Vec<ExternalListing>) -> Router {
    router(AppState {
        pool: pool.clone(),
        source: Arc::new(StaticSource { listings }),
        locks: SyncLocks::new(),
        options: ReconcileOptions::default(),
    })
}

fn request(method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

async fn seed_listing(pool: &sqlx::SqlitePool, organization_id: &str, external_id: &str) -> String {
    let mut attributes = Map::new();
    attributes.insert("category".into(), json!("cafe"));
    db::insert_listing(
        pool,
        organization_id,
        &NewListing {
            external_id: Some(external_id.into()),
            display_name: "Acme Cafe".into(),
            status: ListingStatus::Active,
            is_verified: false,
            last_synced_at: None,
            attributes,
        },
    )
    .await
    .unwrap()
    .id
}

#[tokio::test]
async fn health_needs_no_session() {
    let pool = setup_pool().await;
    let app = app(&pool, Vec::new());
    let resp = app
        .clone()
        .oneshot(request("GET", "/health", None, None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn api_rejects_missing_or_expired_sessions() {
    let pool = setup_pool().await;
    db::insert_session(
        &pool,
        &Session {
            token: "stale".into(),
            user_id: "user-1".into(),
            organization_id: ORG.into(),
            expires_at: Utc::now() - Duration::minutes(5),
        },
    )
    .await
    .unwrap();
    let app = app(&pool, Vec::new());

    for token in [None, Some("stale"), Some("nope")] {
        let (status, body) = send(&app, request("POST", "/api/listings/sync", token, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Unauthorized");
    }
}

#[tokio::test]
async fn sync_without_connection_is_bad_gateway() {
    let pool = setup_pool().await;
    let app = app(&pool, vec![ExternalListing::new("loc/1", "Acme Cafe")]);

    let (status, body) = send(&app, request("POST", "/api/listings/sync", Some(TOKEN), None)).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"], "Failed to connect to Google Business Profile");
    assert!(db::list_listings(&pool, ORG).await.unwrap().is_empty());
}

#[tokio::test]
async fn sync_with_revoked_token_is_bad_gateway() {
    let pool = setup_pool().await;
    db::set_gbp_refresh_token(&pool, ORG, Some("revoked"))
        .await
        .unwrap();
    let app = app(&pool, vec![ExternalListing::new("loc/1", "Acme Cafe")]);

    let (status, body) = send(&app, request("POST", "/api/listings/sync", Some(TOKEN), None)).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(body["details"].as_str().unwrap().contains("invalid_grant"));
    assert!(db::list_listings(&pool, ORG).await.unwrap().is_empty());
}

#[tokio::test]
async fn sync_returns_report_and_logs_run() {
    let pool = setup_pool().await;
    db::set_gbp_refresh_token(&pool, ORG, Some("refresh"))
        .await
        .unwrap();
    let app = app(
        &pool,
        vec![
            ExternalListing::new("loc/1", "Acme Cafe"),
            ExternalListing::new("loc/2", "Harbor Books"),
        ],
    );

    let (status, body) = send(&app, request("POST", "/api/listings/sync", Some(TOKEN), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["totalLocations"], 2);
    assert_eq!(body["syncedCount"], 2);
    assert_eq!(body["newCount"], 2);
    assert_eq!(body["existingCount"], 0);
    assert_eq!(body["businessProfiles"].as_array().unwrap().len(), 2);

    let (status, body) = send(&app, request("GET", "/api/listings", Some(TOKEN), None)).await;
    assert_eq!(status, StatusCode::OK);
    let listings = body.as_array().unwrap();
    assert_eq!(listings.len(), 2);
    assert_eq!(listings[0]["status"], "ACTIVE");
    assert_eq!(listings[0]["isVerified"], true);

    let (status, body) =
        send(&app, request("GET", "/api/listings/sync-runs", Some(TOKEN), None)).await;
    assert_eq!(status, StatusCode::OK);
    let runs = body.as_array().unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0]["outcome"], "SUCCEEDED");
    assert_eq!(runs[0]["newCount"], 2);
}

#[tokio::test]
async fn bearer_scheme_is_case_insensitive() {
    let pool = setup_pool().await;
    let app = app(&pool, Vec::new());

    for header in [format!("bearer {TOKEN}"), format!("BEARER  {TOKEN}")] {
        let req = Request::builder()
            .method("GET")
            .uri("/api/listings")
            .header("authorization", header)
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.as_array().unwrap().is_empty());
    }

    let req = Request::builder()
        .method("GET")
        .uri("/api/listings")
        .header("authorization", format!("Basic {TOKEN}"))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn malformed_bodies_get_json_errors() {
    let pool = setup_pool().await;
    let id = seed_listing(&pool, ORG, "loc/1").await;
    let app = app(&pool, Vec::new());

    let (status, body) = send(
        &app,
        request(
            "PATCH",
            &format!("/api/listings/{id}/status"),
            Some(TOKEN),
            Some(json!({ "status": "active" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "Invalid request body");
    assert!(body["details"].is_string());

    let req = Request::builder()
        .method("PATCH")
        .uri(format!("/api/listings/{id}/analytics"))
        .header("authorization", format!("Bearer {TOKEN}"))
        .body(Body::from(r#"{"selected":true}"#))
        .unwrap();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert_eq!(body["error"], "Invalid request body");

    let stored = db::find_listing(&pool, ORG, &id).await.unwrap().unwrap();
    assert_eq!(stored.status, ListingStatus::Active);
    assert!(!stored.is_selected_for_analytics());
}

#[tokio::test]
async fn status_toggle_updates_listing() {
    let pool = setup_pool().await;
    let id = seed_listing(&pool, ORG, "loc/1").await;
    let app = app(&pool, Vec::new());

    let (status, body) = send(
        &app,
        request(
            "PATCH",
            &format!("/api/listings/{id}/status"),
            Some(TOKEN),
            Some(json!({ "status": "SUSPENDED" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "SUSPENDED");
    assert_eq!(body["attributes"]["category"], "cafe");
}

#[tokio::test]
async fn analytics_toggle_keeps_other_attributes() {
    let pool = setup_pool().await;
    let id = seed_listing(&pool, ORG, "loc/1").await;
    let app = app(&pool, Vec::new());

    let (status, body) = send(
        &app,
        request(
            "PATCH",
            &format!("/api/listings/{id}/analytics"),
            Some(TOKEN),
            Some(json!({ "selected": true })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["attributes"]["selectedForAnalytics"], true);
    assert_eq!(body["attributes"]["category"], "cafe");

    let stored = db::find_listing(&pool, ORG, &id).await.unwrap().unwrap();
    assert!(stored.is_selected_for_analytics());
    assert_eq!(stored.attributes.len(), 2);
}

#[tokio::test]
async fn other_organizations_listings_are_not_found() {
    let pool = setup_pool().await;
    db::create_organization(&pool, "org-2", "Other").await.unwrap();
    let foreign = seed_listing(&pool, "org-2", "loc/9").await;
    let app = app(&pool, Vec::new());

    let (status, _) = send(
        &app,
        request(
            "PATCH",
            &format!("/api/listings/{foreign}/status"),
            Some(TOKEN),
            Some(json!({ "status": "SUSPENDED" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &app,
        request(
            "PATCH",
            &format!("/api/listings/{foreign}/analytics"),
            Some(TOKEN),
            Some(json!({ "selected": true })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, body) = send(&app, request("GET", "/api/listings", Some(TOKEN), None)).await;
    assert!(body.as_array().unwrap().is_empty());

    let untouched = db::find_listing(&pool, "org-2", &foreign)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(untouched.status, ListingStatus::Active);
    assert!(!untouched.is_selected_for_analytics());
}
