// rest/routes/health.rs — Daemon health report.

use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::rest::ok;
use crate::storage::now_rfc3339;
use crate::AppContext;

pub async fn health(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    let report = crate::health::run_report(ctx.storage.pool(), &ctx.config.data_dir).await;
    ok(json!({
        "status": report.status,
        "checks": report.checks,
        "timestamp": now_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": ctx.started_at.elapsed().as_secs(),
    }))
}
