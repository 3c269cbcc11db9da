// rest/routes/plans.rs — Plan listing.

use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::rest::{fail_from, ok, ApiFailure};
use crate::AppContext;

pub async fn list_plans(State(ctx): State<Arc<AppContext>>) -> Result<Json<Value>, ApiFailure> {
    let plans = ctx
        .storage
        .list_active_plans()
        .await
        .map_err(|e| fail_from(&crate::error::Error::Operational(e)))?;

    let list: Vec<Value> = plans
        .iter()
        .map(|p| {
            json!({
                "code": p.code,
                "name": p.name,
                "description": p.description,
                "plan_type": p.plan_type,
                "price": p.monthly_price,
                "currency": p.currency,
                "max_users": p.max_users,
                "storage_limit_gb": p.storage_limit_gb,
                "features": p.modules(),
            })
        })
        .collect();

    Ok(ok(json!(list)))
}
