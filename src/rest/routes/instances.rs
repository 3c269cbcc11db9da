// rest/routes/instances.rs — Instance info, logs, and lifecycle actions.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::{Error, ResourceKind};
use crate::instance::instance_url;
use crate::logstore::{LogLevel, LogQuery};
use crate::rest::{fail, fail_from, ok, ApiFailure};
use crate::storage::InstanceRow;
use crate::AppContext;

async fn find_instance(ctx: &AppContext, subdomain: &str) -> Result<InstanceRow, ApiFailure> {
    ctx.storage
        .get_instance_by_subdomain(subdomain)
        .await
        .map_err(|e| fail_from(&Error::Operational(e)))?
        .ok_or_else(|| fail_from(&Error::not_found(ResourceKind::Instance, subdomain)))
}

/// `GET /api/v1/instances/{subdomain}` — instance record incl. usage stats.
pub async fn instance_info(
    State(ctx): State<Arc<AppContext>>,
    Path(subdomain): Path<String>,
) -> Result<Json<Value>, ApiFailure> {
    let inst = find_instance(&ctx, &subdomain).await?;
    let plan_name = ctx
        .storage
        .get_plan(&inst.plan_code)
        .await
        .map_err(|e| fail_from(&Error::Operational(e)))?
        .map(|p| p.name);

    Ok(ok(json!({
        "name": inst.name,
        "subdomain": inst.subdomain,
        "url": instance_url(&inst.subdomain, inst.ssl_enabled, &ctx.config.base_domain),
        "state": inst.state,
        "plan_code": inst.plan_code,
        "plan_name": plan_name,
        "company_name": inst.company_name,
        "provisioned_at": inst.provisioned_at,
        "last_activity": inst.last_activity,
        "cpu_usage": inst.cpu_usage,
        "memory_usage": inst.memory_usage,
        "storage_usage": inst.storage_usage,
    })))
}

#[derive(Deserialize)]
pub struct LogsParams {
    pub hours: Option<i64>,
    /// Comma-separated level names, e.g. `error,critical`.
    pub levels: Option<String>,
    pub limit: Option<i64>,
}

/// `GET /api/v1/instances/{subdomain}/logs` — recent entries plus summary.
pub async fn instance_logs(
    State(ctx): State<Arc<AppContext>>,
    Path(subdomain): Path<String>,
    Query(params): Query<LogsParams>,
) -> Result<Json<Value>, ApiFailure> {
    let inst = find_instance(&ctx, &subdomain).await?;

    let levels: Option<Vec<LogLevel>> = params.levels.as_deref().map(|csv| {
        csv.split(',')
            .filter_map(|s| LogLevel::parse(s.trim()))
            .collect()
    });
    let query = LogQuery {
        hours: params.hours.unwrap_or(24).max(1),
        levels: levels.filter(|l| !l.is_empty()),
        limit: params.limit.unwrap_or(50).clamp(1, 1000),
    };

    let entries = ctx
        .logs
        .query(&inst.id, &query)
        .await
        .map_err(|e| fail_from(&Error::Operational(e)))?;
    let summary = ctx
        .logs
        .summary(&inst.id, query.hours)
        .await
        .map_err(|e| fail_from(&Error::Operational(e)))?;

    let logs: Vec<Value> = entries
        .iter()
        .map(|l| {
            json!({
                "timestamp": l.timestamp,
                "level": l.level,
                "message": l.message,
                "operation": l.operation,
                "component": l.component,
            })
        })
        .collect();

    Ok(ok(json!({
        "logs": logs,
        "total_count": entries.len(),
        "summary": summary,
    })))
}

#[derive(Deserialize)]
pub struct ManageRequest {
    pub action: Option<String>,
}

/// `POST /api/v1/instances/{subdomain}/actions` — lifecycle actions.
pub async fn manage_instance(
    State(ctx): State<Arc<AppContext>>,
    Path(subdomain): Path<String>,
    Json(body): Json<ManageRequest>,
) -> Result<Json<Value>, ApiFailure> {
    let inst = find_instance(&ctx, &subdomain).await?;

    let Some(action) = body.action.filter(|a| !a.is_empty()) else {
        return Err(fail(
            StatusCode::BAD_REQUEST,
            "MISSING_ACTION",
            "Action is required",
        ));
    };

    let (updated, message) = match action.as_str() {
        "start" => (
            ctx.provisioner.start(&inst).await,
            "Instance started successfully",
        ),
        "stop" => (
            ctx.provisioner.stop(&inst).await,
            "Instance stopped successfully",
        ),
        "restart" => (
            ctx.provisioner.restart(&inst).await,
            "Instance restarted successfully",
        ),
        "backup" => (
            ctx.provisioner.backup(&inst).await,
            "Backup created successfully",
        ),
        "terminate" => (
            ctx.provisioner.terminate(&inst).await,
            "Instance terminated successfully",
        ),
        other => {
            return Err(fail(
                StatusCode::BAD_REQUEST,
                "UNKNOWN_ACTION",
                &format!("Unknown action: {other}"),
            ))
        }
    };

    let updated = updated.map_err(|e| fail_from(&e))?;
    Ok(ok(json!({
        "subdomain": updated.subdomain,
        "state": updated.state,
        "message": message,
    })))
}
