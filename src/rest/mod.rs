// rest/mod.rs — Public JSON/HTTP API.
//
// Axum server on the configured port (loopback by default). Every response
// uses the same envelope:
//   success: {"success": true,  "data": …}
//   failure: {"success": false, "error": …, "error_code": …}
//
// Endpoints:
//   POST /api/v1/instances                       create a signup request
//   GET  /api/v1/requests/{request_id}           request status summary
//   GET  /api/v1/instances/{subdomain}           instance info
//   GET  /api/v1/instances/{subdomain}/logs      recent logs + summary
//   POST /api/v1/instances/{subdomain}/actions   start|stop|restart|backup|terminate
//   POST /api/v1/subdomains/validate             subdomain format + availability
//   GET  /api/v1/plans                           active plans
//   GET  /api/v1/health                          daemon health report

pub mod routes;

use anyhow::Result;
use axum::{
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::AppContext;

pub async fn serve(ctx: Arc<AppContext>) -> Result<()> {
    let bind = format!("{}:{}", ctx.config.bind_address, ctx.config.port);
    let addr: SocketAddr = bind.parse()?;

    let router = build_router(ctx);

    info!("REST API listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/api/v1/health", get(routes::health::health))
        .route("/api/v1/plans", get(routes::plans::list_plans))
        .route(
            "/api/v1/instances",
            post(routes::requests::create_instance),
        )
        .route(
            "/api/v1/requests/{request_id}",
            get(routes::requests::request_status),
        )
        .route(
            "/api/v1/instances/{subdomain}",
            get(routes::instances::instance_info),
        )
        .route(
            "/api/v1/instances/{subdomain}/logs",
            get(routes::instances::instance_logs),
        )
        .route(
            "/api/v1/instances/{subdomain}/actions",
            post(routes::instances::manage_instance),
        )
        .route(
            "/api/v1/subdomains/validate",
            post(routes::requests::validate_subdomain),
        )
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

// ─── Envelope helpers ─────────────────────────────────────────────────────────

pub(crate) type ApiFailure = (StatusCode, Json<Value>);

pub(crate) fn ok(data: Value) -> Json<Value> {
    Json(json!({ "success": true, "data": data }))
}

pub(crate) fn fail(status: StatusCode, error_code: &str, message: &str) -> ApiFailure {
    (
        status,
        Json(json!({
            "success": false,
            "error": message,
            "error_code": error_code,
        })),
    )
}

pub(crate) fn fail_from(err: &crate::error::Error) -> ApiFailure {
    if let crate::error::Error::Operational(inner) = err {
        tracing::error!(err = %inner, "API request hit an operational failure");
    }
    fail(err.status(), err.error_code(), &err.public_message())
}
