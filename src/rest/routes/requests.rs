// rest/routes/requests.rs — Signup intake, request status, and subdomain
// validation.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::{Error, ResourceKind};
use crate::request::{self, validate, SignupPayload};
use crate::rest::{fail, fail_from, ok, ApiFailure};
use crate::AppContext;

/// `POST /api/v1/instances` — create an instance request from a signup
/// payload. The request is validated and processed inline; the instance
/// itself is provisioned by the background sweep.
pub async fn create_instance(
    State(ctx): State<Arc<AppContext>>,
    Json(payload): Json<SignupPayload>,
) -> Result<Json<Value>, ApiFailure> {
    let missing = request::missing_fields(&payload);
    if !missing.is_empty() {
        return Err(fail(
            StatusCode::BAD_REQUEST,
            "MISSING_FIELDS",
            &format!("Missing required fields: {}", missing.join(", ")),
        ));
    }

    let row = request::create_from_signup(&ctx.storage, &ctx.config, &payload)
        .await
        .map_err(|e| fail_from(&e))?;

    Ok(ok(json!({
        "request_id": row.request_id,
        "state": row.state,
        "subdomain": row.subdomain,
        "estimated_minutes": request::ESTIMATED_PROCESSING_MINUTES,
    })))
}

/// `GET /api/v1/requests/{request_id}` — status summary for one request.
pub async fn request_status(
    State(ctx): State<Arc<AppContext>>,
    Path(request_id): Path<String>,
) -> Result<Json<Value>, ApiFailure> {
    let row = ctx
        .storage
        .get_request_by_request_id(&request_id)
        .await
        .map_err(|e| fail_from(&Error::Operational(e)))?
        .ok_or_else(|| fail_from(&Error::not_found(ResourceKind::Request, &request_id)))?;

    let summary = request::summary(&ctx.storage, &ctx.config, &row)
        .await
        .map_err(|e| fail_from(&e))?;
    let data = serde_json::to_value(summary)
        .map_err(|e| fail_from(&Error::Operational(e.into())))?;
    Ok(ok(data))
}

#[derive(Deserialize)]
pub struct ValidateSubdomainRequest {
    pub subdomain: Option<String>,
}

/// `POST /api/v1/subdomains/validate` — format, length, and availability.
pub async fn validate_subdomain(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<ValidateSubdomainRequest>,
) -> Result<Json<Value>, ApiFailure> {
    let Some(subdomain) = body.subdomain.filter(|s| !s.is_empty()) else {
        return Err(fail(
            StatusCode::BAD_REQUEST,
            "MISSING_SUBDOMAIN",
            "Subdomain is required",
        ));
    };

    if let Some(issue) = validate::check_subdomain(&subdomain) {
        return Err(fail(
            StatusCode::UNPROCESSABLE_ENTITY,
            issue.error_code(),
            issue.message(),
        ));
    }

    let in_use = ctx
        .storage
        .subdomain_in_use(&subdomain)
        .await
        .map_err(|e| fail_from(&Error::Operational(e)))?;
    let available = !in_use;

    Ok(ok(json!({
        "subdomain": subdomain,
        "available": available,
        "message": if available {
            "Subdomain is available"
        } else {
            "Subdomain is already taken"
        },
    })))
}
