//! API integration tests

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::util::ServiceExt;
use uuid::Uuid;

use vault_token::{SurvivalToken, TokenCodec};
use vaultsrv::api::{create_router, AppState};
use vaultsrv::config::FastLaneConfig;
use vaultsrv::domain::SystemClock;
use vaultsrv::engine::EscalationEngine;
use vaultsrv::notify::{ChannelKind, NotificationGateway};
use vaultsrv::policy::{EscalationPolicy, PhaseSpec};
use vaultsrv::storage;
use vaultsrv::test_support::RecordingChannel;

const SECRET: &str = "api-test-secret";

async fn test_app() -> axum::Router {
    test_app_with_channels().await.0
}

async fn test_app_with_channels() -> (axum::Router, Arc<RecordingChannel>) {
    let pool = storage::connect_in_memory().await.unwrap();
    storage::init_schema(&pool).await.unwrap();

    let policy = EscalationPolicy::new(
        vec![
            PhaseSpec {
                delay_hours: 1.0,
                template: "reminder_1".to_string(),
            },
            PhaseSpec {
                delay_hours: 1.0,
                template: "reminder_2".to_string(),
            },
        ],
        "disclosure",
        "sealed",
    )
    .unwrap();

    let sms = Arc::new(RecordingChannel::new(ChannelKind::Sms));
    let gateway = NotificationGateway::new(
        Some(Arc::new(RecordingChannel::new(ChannelKind::Email))),
        Some(sms.clone()),
    );

    let engine = Arc::new(EscalationEngine::new(
        pool,
        policy,
        gateway,
        TokenCodec::new(SECRET),
        Arc::new(SystemClock),
        FastLaneConfig::default(),
    ));

    (create_router(AppState { engine }), sms)
}

/// Helper to make JSON requests
async fn json_request(
    app: &axum::Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let request = if let Some(json) = body {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_string(&json).unwrap()))
            .unwrap()
    } else {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::empty())
            .unwrap()
    };

    let response = app.clone().oneshot(request).await.unwrap();

    let status = response.status();
    let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();

    let body: Value = if body_bytes.is_empty() {
        json!({})
    } else {
        serde_json::from_slice(&body_bytes).unwrap()
    };

    (status, body)
}

async fn create_message(app: &axum::Router) -> String {
    let (status, body) = json_request(
        app,
        "POST",
        "/api/v1/messages",
        Some(json!({
            "owner_id": "owner-1",
            "content": "sealed words",
            "owner_email": "owner@example.com",
            "owner_phone": "+15550001",
            "recipient_email": "reader@example.com"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_health_check() {
    let app = test_app().await;

    let (status, body) = json_request(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service"], "vaultsrv");
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_status_counts_phases() {
    let app = test_app().await;
    create_message(&app).await;
    create_message(&app).await;

    let (status, body) = json_request(&app, "GET", "/api/v1/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ladder_stages"], 2);
    assert_eq!(body["messages_by_phase"]["idle"], 2);
}

#[tokio::test]
async fn test_create_and_get_withholds_content() {
    let app = test_app().await;
    let id = create_message(&app).await;

    let (status, body) = json_request(&app, "GET", &format!("/api/v1/messages/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["phase"], "idle");
    assert_eq!(body["owner_id"], "owner-1");
    // Sealed until disclosed
    assert!(body.get("content").is_none());
}

#[tokio::test]
async fn test_create_rejects_empty_content() {
    let app = test_app().await;
    let (status, _) = json_request(
        &app,
        "POST",
        "/api/v1/messages",
        Some(json!({ "owner_id": "owner-1", "content": "" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_start_then_duplicate_start() {
    let app = test_app().await;
    let id = create_message(&app).await;
    let uri = format!("/api/v1/messages/{}/escalation/start", id);

    let (status, body) = json_request(&app, "POST", &uri, Some(json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["phase"], "phase_1");
    assert_eq!(body["advance_count"], 1);
    assert!(body["summary"].as_str().unwrap().contains("stage 1 of 2"));

    let (status, body) = json_request(&app, "POST", &uri, Some(json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("phase_1"));
}

#[tokio::test]
async fn test_start_unknown_and_malformed_ids() {
    let app = test_app().await;

    let uri = format!("/api/v1/messages/{}/escalation/start", Uuid::new_v4());
    let (status, _) = json_request(&app, "POST", &uri, Some(json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = json_request(
        &app,
        "POST",
        "/api/v1/messages/not-a-uuid/escalation/start",
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_sweep_route_reports_counts() {
    let app = test_app().await;
    create_message(&app).await;

    let (status, body) = json_request(&app, "POST", "/api/v1/sweep", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["advanced"], 0);
    assert_eq!(body["disclosed"], 0);
    assert!(body["failures"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_confirm_presence_via_link() {
    let app = test_app().await;
    let id = create_message(&app).await;
    let uri = format!("/api/v1/messages/{}/escalation/start", id);
    json_request(&app, "POST", &uri, Some(json!({}))).await;

    let token = TokenCodec::new(SECRET).encode(&SurvivalToken::new(
        Uuid::parse_str(&id).unwrap(),
        "owner-1",
        chrono::Utc::now(),
    ));
    let (status, body) = json_request(
        &app,
        "GET",
        &format!("/api/v1/presence/confirm?token={}", token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "confirmed");

    // Second click on the same link degrades gracefully
    let (status, body) = json_request(
        &app,
        "GET",
        &format!("/api/v1/presence/confirm?token={}", token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "already-resolved");
}

#[tokio::test]
async fn test_confirm_presence_rejects_bad_token() {
    let app = test_app().await;
    let (status, _) =
        json_request(&app, "GET", "/api/v1/presence/confirm?token=garbage", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_fast_unlock_requires_valid_code() {
    let app = test_app().await;
    let id = create_message(&app).await;

    let (status, _) = json_request(
        &app,
        "POST",
        &format!("/api/v1/messages/{}/fast-unlock", id),
        Some(json!({ "phone": "+15550001", "code": "000000" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_fast_lane_roundtrip_over_http() {
    let (app, sms) = test_app_with_channels().await;
    let id = create_message(&app).await;

    // Wrong phone cannot request a code
    let (status, _) = json_request(
        &app,
        "POST",
        &format!("/api/v1/messages/{}/fast-lane", id),
        Some(json!({ "phone": "+19990000" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Issue a code to the owner's registered phone
    let (status, _) = json_request(
        &app,
        "POST",
        &format!("/api/v1/messages/{}/fast-lane", id),
        Some(json!({ "phone": "+15550001" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let code = sms
        .sent()
        .iter()
        .find(|s| s.recipient == "+15550001")
        .expect("code SMS")
        .params["code"]
        .as_str()
        .unwrap()
        .to_string();

    // Redeem it: immediate disclosure with the sealed content
    let (status, body) = json_request(
        &app,
        "POST",
        &format!("/api/v1/messages/{}/fast-unlock", id),
        Some(json!({ "phone": "+15550001", "code": code })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "unlocked");
    assert_eq!(body["content"], "sealed words");

    // And the message now serves its content
    let (status, body) = json_request(&app, "GET", &format!("/api/v1/messages/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["phase"], "disclosed");
    assert_eq!(body["content"], "sealed words");
}
