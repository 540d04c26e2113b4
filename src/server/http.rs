//! HTTP/1 application router.
//!
//! # Responsibilities
//! - Mount application routes under `/api/{version}`
//! - Answer `GET /healthz`
//! - Wire up middleware (request ID, tracing, timeout)
//! - Turn a panicking handler into a 500 instead of a dropped connection

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::{
    catch_panic::CatchPanicLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::config::{HttpConfig, ServiceConfig};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: String,
    pub version: String,
}

/// Build the router served to HTTP/1 connections.
///
/// `routes` is the application's own router; it is nested under
/// `/api/{api_version}`.
#[allow(deprecated)]
pub fn build_router(http: &HttpConfig, service: &ServiceConfig, routes: Router) -> Router {
    let health = Arc::new(HealthResponse {
        status: "ok",
        service: service.name.clone(),
        version: service.version.clone(),
    });

    Router::new()
        .route("/healthz", get(healthz))
        .with_state(health)
        .nest(&api_prefix(&http.api_version), routes)
        .layer(CatchPanicLayer::new())
        .layer(TimeoutLayer::new(Duration::from_secs(http.request_timeout_secs)))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

pub fn api_prefix(api_version: &str) -> String {
    format!("/api/{}", api_version.trim_matches('/'))
}

async fn healthz(State(health): State<Arc<HealthResponse>>) -> Json<HealthResponse> {
    Json(health.as_ref().clone())
}
