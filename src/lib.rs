pub mod auth;
pub mod config;
pub mod gateway;
pub mod handlers;
pub mod jobs;
pub mod ledger;
pub mod listings;
pub mod middleware;
pub mod orchestrator;
pub mod rate_limit;
pub mod reconcile;
pub mod sigv4;
pub mod state;
pub mod storage;
pub mod store;

use axum::{
    extract::DefaultBodyLimit,
    http::Method,
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    let job_private_router = Router::new()
        .route(
            "/video-generation",
            post(handlers::start_video_generation),
        )
        .route("/ai-prefill", post(handlers::start_prefill))
        .route("/{id}", get(handlers::get_job))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::require_auth,
        ));

    let jobs_router = Router::new()
        .route("/callback", post(handlers::job_callback))
        .merge(job_private_router)
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::job_rate_limit,
        ));

    let maintenance_router = Router::new()
        .route(
            "/storage",
            get(handlers::storage_scan_preview).post(handlers::storage_scan),
        )
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::require_maintenance_credential,
        ));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/jobs", jobs_router)
        .nest("/maintenance", maintenance_router)
        .with_state(state)
        .layer(DefaultBodyLimit::max(2 * 1024 * 1024))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
