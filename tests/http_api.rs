mod common;

use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use chrono::Utc;
use hmac::{Hmac, Mac};
use httpmock::prelude::*;
use serde_json::{json, Value};
use sha2::Sha256;
use tower::ServiceExt;

use common::{MemoryBalances, MemoryJobs, MemoryListings};
use listing_jobs_server::{
    auth::AuthService,
    build_router,
    config::Config,
    gateway::WebhookGateway,
    jobs::{Job, JobKind, JobStatus},
    ledger::{Balance, CreditLedger},
    orchestrator::{Costs, JobOrchestrator},
    state::AppState,
    store::RestStore,
};

const CALLBACK_SECRET: &str = "callback-secret";
const MAINTENANCE_TOKEN: &str = "maintenance-token";

fn test_config(rest_url: String) -> Config {
    Config {
        port: 0,
        trust_proxy: false,
        tls_key_path: None,
        tls_cert_path: None,
        database_rest_url: rest_url,
        service_role_key: "test-service-key".to_string(),
        auth_issuer: None,
        video_webhook_url: Some("http://127.0.0.1:9/video".to_string()),
        prefill_webhook_url: Some("http://127.0.0.1:9/prefill".to_string()),
        webhook_auth_token: None,
        webhook_callback_secret: Some(CALLBACK_SECRET.to_string()),
        webhook_timeout: Duration::from_secs(5),
        video_generation_cost: 5,
        prefill_cost: 1,
        storage_endpoint: None,
        storage_bucket: "listing-uploads".to_string(),
        storage_region: "us-east-1".to_string(),
        storage_access_key: None,
        storage_secret_key: None,
        maintenance_token: Some(MAINTENANCE_TOKEN.to_string()),
        reconcile_delete_concurrency: 4,
    }
}

struct App {
    state: AppState,
    jobs: Arc<MemoryJobs>,
}

fn app(db: &MockServer) -> App {
    let config = test_config(db.base_url());
    let store = RestStore::new(config.database_rest_url.clone(), &config.service_role_key)
        .expect("store construction");
    let auth = AuthService::new(None).expect("auth construction");

    let balances = MemoryBalances::with_balance(
        "user-1",
        Balance {
            free_remaining: 10,
            paid_balance: 0,
        },
    );
    let jobs = Arc::new(MemoryJobs::default());
    let gateway =
        WebhookGateway::new(None, config.webhook_timeout).expect("gateway construction");
    let orchestrator = JobOrchestrator::new(
        CreditLedger::new(balances),
        jobs.clone(),
        Arc::new(MemoryListings::default()),
        gateway,
        config.video_webhook_url.clone(),
        config.prefill_webhook_url.clone(),
        Costs {
            video_generation: config.video_generation_cost,
            prefill: config.prefill_cost,
        },
    );

    let state = AppState::new(config, store, auth, orchestrator, None);
    App { state, jobs }
}

fn sign_callback(body: &str) -> String {
    let timestamp = Utc::now().timestamp();
    let mut mac = Hmac::<Sha256>::new_from_slice(CALLBACK_SECRET.as_bytes()).unwrap();
    mac.update(format!("{timestamp}.{body}").as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());
    format!("t={timestamp},v1={signature}")
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_reports_store_reachability() {
    let db = MockServer::start_async().await;
    db.mock_async(|when, then| {
        when.method(GET).path("/profiles");
        then.status(200).json_body(json!([]));
    })
    .await;

    let app = app(&db);
    let response = build_router(app.state)
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn health_fails_when_the_store_is_down() {
    let db = MockServer::start_async().await;
    db.mock_async(|when, then| {
        when.method(GET).path("/profiles");
        then.status(500).body("db exploded");
    })
    .await;

    let app = app(&db);
    let response = build_router(app.state)
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn job_routes_require_a_bearer_token() {
    let db = MockServer::start_async().await;
    let app = app(&db);
    let router = build_router(app.state);

    for uri in ["/jobs/video-generation", "/jobs/ai-prefill"] {
        let response = router
            .clone()
            .oneshot(
                Request::post(uri)
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{uri}");
    }

    let response = router
        .oneshot(
            Request::get(format!("/jobs/{}", uuid::Uuid::new_v4()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn garbage_bearer_token_is_rejected() {
    let db = MockServer::start_async().await;
    let app = app(&db);

    let response = build_router(app.state)
        .oneshot(
            Request::post("/jobs/ai-prefill")
                .header("authorization", "Bearer not-a-jwt")
                .header("content-type", "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn callback_requires_a_valid_signature() {
    let db = MockServer::start_async().await;
    let app = app(&db);
    let router = build_router(app.state);

    let body = json!({ "jobId": uuid::Uuid::new_v4(), "status": "completed" }).to_string();

    let missing = router
        .clone()
        .oneshot(
            Request::post("/jobs/callback")
                .header("content-type", "application/json")
                .body(Body::from(body.clone()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

    let forged = router
        .oneshot(
            Request::post("/jobs/callback")
                .header("content-type", "application/json")
                .header("x-signature", "t=0,v1=deadbeef")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(forged.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn signed_callback_for_unknown_job_is_a_bad_request() {
    let db = MockServer::start_async().await;
    let app = app(&db);

    let body = json!({ "jobId": uuid::Uuid::new_v4(), "status": "completed" }).to_string();
    let response = build_router(app.state)
        .oneshot(
            Request::post("/jobs/callback")
                .header("content-type", "application/json")
                .header("x-signature", sign_callback(&body))
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn signed_callback_completes_a_processing_job() {
    let db = MockServer::start_async().await;
    let app = app(&db);

    let mut job = Job::new("user-1", JobKind::VideoGeneration, 5);
    job.status = JobStatus::Processing;
    let job_id = job.id;
    app.jobs.seed(job);

    let body = json!({
        "jobId": job_id,
        "status": "completed",
        "resultPayload": { "videoUrl": "https://cdn.example.com/v.mp4" },
    })
    .to_string();
    let response = build_router(app.state)
        .oneshot(
            Request::post("/jobs/callback")
                .header("content-type", "application/json")
                .header("x-signature", sign_callback(&body))
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({ "received": true }));
    assert_eq!(app.jobs.job(job_id).unwrap().status, JobStatus::Completed);
}

#[tokio::test]
async fn maintenance_requires_the_service_credential() {
    let db = MockServer::start_async().await;
    let app = app(&db);
    let router = build_router(app.state);

    let missing = router
        .clone()
        .oneshot(
            Request::get("/maintenance/storage")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

    let wrong = router
        .oneshot(
            Request::get("/maintenance/storage")
                .header("authorization", "Bearer wrong-token")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn maintenance_reports_unconfigured_storage() {
    let db = MockServer::start_async().await;
    let app = app(&db);

    let response = build_router(app.state)
        .oneshot(
            Request::get("/maintenance/storage")
                .header("authorization", format!("Bearer {MAINTENANCE_TOKEN}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}
