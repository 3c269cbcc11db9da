//! Periodic background sweeps.
//!
//! Each sweep iterates its matching records serially with per-record error
//! isolation: a failing record is logged and skipped, never retried within
//! the same run, and never aborts the rest of the sweep. There is no
//! cancellation once a record's work has begun.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::instance::InstanceState;
use crate::request::{self, RequestState};
use crate::storage::{days_ago_rfc3339, now_rfc3339};
use crate::AppContext;

/// Spawn every sweep on its configured interval. The handles run for the
/// daemon's lifetime.
pub fn spawn_all(ctx: Arc<AppContext>) -> Vec<JoinHandle<()>> {
    let jobs = ctx.config.jobs.clone();
    vec![
        spawn_loop(ctx.clone(), "request_sweep", jobs.request_sweep_secs, |c| {
            Box::pin(async move { request_sweep(&c).await })
        }),
        spawn_loop(
            ctx.clone(),
            "provision_sweep",
            jobs.provision_sweep_secs,
            |c| Box::pin(async move { provision_sweep(&c).await }),
        ),
        spawn_loop(ctx.clone(), "backup_sweep", jobs.backup_sweep_secs, |c| {
            Box::pin(async move { backup_sweep(&c).await })
        }),
        spawn_loop(ctx.clone(), "monitor_sweep", jobs.monitor_sweep_secs, |c| {
            Box::pin(async move { monitor_sweep(&c).await })
        }),
        spawn_loop(ctx, "cleanup_sweep", jobs.cleanup_sweep_secs, |c| {
            Box::pin(async move { cleanup_sweep(&c).await })
        }),
    ]
}

type SweepFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

fn spawn_loop(
    ctx: Arc<AppContext>,
    name: &'static str,
    interval_secs: u64,
    sweep: impl Fn(Arc<AppContext>) -> SweepFuture + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            debug!(sweep = name, "sweep tick");
            sweep(ctx.clone()).await;
        }
    })
}

/// Validate every submitted request, then process every validated one.
pub async fn request_sweep(ctx: &AppContext) {
    match ctx
        .storage
        .list_requests_by_state(RequestState::Submitted.as_str())
        .await
    {
        Ok(rows) => {
            for row in rows {
                if let Err(e) = request::validate(&ctx.storage, &row).await {
                    warn!(request_id = %row.request_id, err = %e, "request validation failed");
                }
            }
        }
        Err(e) => warn!(err = %e, "request sweep: listing submitted requests failed"),
    }

    match ctx
        .storage
        .list_requests_by_state(RequestState::Validated.as_str())
        .await
    {
        Ok(rows) => {
            for row in rows {
                if let Err(e) = request::process(&ctx.storage, &ctx.config, &row).await {
                    warn!(request_id = %row.request_id, err = %e, "request processing failed");
                }
            }
        }
        Err(e) => warn!(err = %e, "request sweep: listing validated requests failed"),
    }
}

/// Run the executor for every instance waiting in `provisioning`.
pub async fn provision_sweep(ctx: &AppContext) {
    let rows = match ctx
        .storage
        .list_instances_by_state(InstanceState::Provisioning.as_str())
        .await
    {
        Ok(rows) => rows,
        Err(e) => {
            warn!(err = %e, "provision sweep: listing instances failed");
            return;
        }
    };
    for row in rows {
        if let Err(e) = ctx.provisioner.run(&row).await {
            error!(instance_id = %row.id, subdomain = %row.subdomain, err = %e,
                   "provisioning run failed");
        }
    }
}

/// Back up exactly the due set: active, backups enabled, next_backup <= now.
pub async fn backup_sweep(ctx: &AppContext) {
    let rows = match ctx.storage.instances_due_backup(&now_rfc3339()).await {
        Ok(rows) => rows,
        Err(e) => {
            warn!(err = %e, "backup sweep: listing due instances failed");
            return;
        }
    };
    for row in rows {
        if let Err(e) = ctx.provisioner.backup(&row).await {
            error!(instance_id = %row.id, subdomain = %row.subdomain, err = %e,
                   "scheduled backup failed");
        }
    }
}

/// Refresh container resource usage for every active instance.
pub async fn monitor_sweep(ctx: &AppContext) {
    let rows = match ctx
        .storage
        .list_instances_by_state(InstanceState::Active.as_str())
        .await
    {
        Ok(rows) => rows,
        Err(e) => {
            warn!(err = %e, "monitor sweep: listing active instances failed");
            return;
        }
    };
    for row in rows {
        if let Err(e) = ctx.provisioner.refresh_usage(&row).await {
            warn!(instance_id = %row.id, err = %e, "resource monitoring failed");
        }
    }
}

/// Archive old terminal requests and delete old debug/info log entries.
/// Retention windows come from the hot config when the watcher is running.
pub async fn cleanup_sweep(ctx: &AppContext) {
    let (log_days, request_days) = match &ctx.hot {
        Some(hot) => {
            let guard = hot.read().await;
            (guard.log_retention_days, guard.request_retention_days)
        }
        None => (
            ctx.config.log_retention_days,
            ctx.config.request_retention_days,
        ),
    };

    if log_days > 0 {
        match ctx.logs.cleanup_before(&days_ago_rfc3339(log_days as i64)).await {
            Ok(count) if count > 0 => info!(count, "cleaned up old log entries"),
            Ok(_) => {}
            Err(e) => warn!(err = %e, "log cleanup failed"),
        }
    }

    if request_days > 0 {
        match ctx
            .storage
            .archive_requests_before(&days_ago_rfc3339(request_days as i64))
            .await
        {
            Ok(count) if count > 0 => info!(count, "archived old requests"),
            Ok(_) => {}
            Err(e) => warn!(err = %e, "request archiving failed"),
        }
    }
}
