//! HTTP-level tests for the sync and inspection surface.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use tower::util::ServiceExt;
use usher_core::audit::SqliteAuditLog;
use usher_core::config::OperatorCredential;
use usher_core::guest::Guest;
use usher_core::ratelimit::{RateLimitConfig, RateLimiter};
use usher_daemon::http::{router, AppState, StaticTokenChecker};
use usher_daemon::registry::SqliteGuestRegistry;
use usher_daemon::service::ReconciliationService;

fn state(max_requests: u32) -> AppState {
    let registry = Arc::new(SqliteGuestRegistry::in_memory().unwrap());
    registry
        .upsert_guest(&Guest::new("g-1", "ada@example.com", "Ada"))
        .unwrap();
    let audit = Arc::new(SqliteAuditLog::in_memory().unwrap());
    AppState {
        service: Arc::new(ReconciliationService::new(
            Arc::clone(&registry),
            Arc::clone(&audit),
        )),
        registry,
        audit,
        limiter: Arc::new(RateLimiter::new(RateLimitConfig {
            max_requests,
            window_secs: 60,
            ..RateLimitConfig::default()
        })),
        checker: Arc::new(StaticTokenChecker::new(&[OperatorCredential {
            token: "station-1-token".to_string(),
            operator_id: "front-desk-1".to_string(),
        }])),
    }
}

fn sync_request(token: Option<&str>, body: &serde_json::Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/checkins:sync")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn sync_applies_batch_and_reports_outcomes() {
    let app = router(state(60));
    let body = serde_json::json!({
        "checks": [
            {
                "guest_email": "ada@example.com",
                "checked_in_at": "2025-06-14T10:00:00Z",
                "source": "online",
                "metadata": { "desk": "north" }
            },
            {
                "guest_email": "ghost@example.com",
                "checked_in_at": "2025-06-14T10:01:00Z",
                "source": "offline"
            }
        ]
    });

    let response = app
        .oneshot(sync_request(Some("station-1-token"), &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    assert_eq!(json["successCount"], 1);
    assert_eq!(json["failed"][0]["guest_email"], "ghost@example.com");
    assert_eq!(json["failed"][0]["reason"], "guest not found");
}

#[tokio::test]
async fn sync_requires_a_known_credential() {
    let app = router(state(60));
    let body = serde_json::json!({ "checks": [] });

    let response = app
        .clone()
        .oneshot(sync_request(None, &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(sync_request(Some("wrong-token"), &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn sync_rate_limits_per_caller() {
    let app = router(state(2));
    let body = serde_json::json!({ "checks": [] });

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(sync_request(Some("station-1-token"), &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app
        .oneshot(sync_request(Some("station-1-token"), &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn guests_read_back_reflects_reconciled_state() {
    let app = router(state(60));
    let body = serde_json::json!({
        "checks": [{
            "guest_email": "ada@example.com",
            "checked_in_at": "2025-06-14T09:58:00Z",
            "source": "offline"
        }]
    });
    let response = app
        .clone()
        .oneshot(sync_request(Some("station-1-token"), &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/guests")
                .header(header::AUTHORIZATION, "Bearer station-1-token")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    assert_eq!(json[0]["email"], "ada@example.com");
    assert_eq!(json[0]["status"], "confirmed");
    assert_eq!(json[0]["checked_in_at"], "2025-06-14T09:58:00Z");
}

#[tokio::test]
async fn conflict_inspection_exposes_both_sides() {
    let app = router(state(60));

    // First 10:00 online, then 09:58 offline: one older_offline conflict.
    for (at, source) in [
        ("2025-06-14T10:00:00Z", "online"),
        ("2025-06-14T09:58:00Z", "offline"),
    ] {
        let body = serde_json::json!({
            "checks": [{
                "guest_email": "ada@example.com",
                "checked_in_at": at,
                "source": source
            }]
        });
        let response = app
            .clone()
            .oneshot(sync_request(Some("station-1-token"), &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app
        .oneshot(
            Request::builder()
                .uri("/audit/conflicts?cursor=0&limit=10")
                .header(header::AUTHORIZATION, "Bearer station-1-token")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    let records = json["records"].as_array().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["guest_email"], "ada@example.com");
    assert_eq!(records[0]["reason"], "older_offline");
    assert_eq!(records[0]["resolution"], "replaced=existing");
    assert_eq!(records[0]["event_at"], "2025-06-14T09:58:00Z");
    assert_eq!(records[0]["existing_at"], "2025-06-14T10:00:00Z");
    assert!(json.get("next_cursor").is_none());
}
