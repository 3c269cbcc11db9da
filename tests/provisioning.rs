//! Executor semantics: the step sequence, failure behavior (no cleanup of
//! completed side effects), backups, and lifecycle actions — all against
//! the recording fakes.

mod common;

use common::{make_ctx, signup};
use provisiond::error::Error;
use provisiond::jobs;
use provisiond::logstore::LogQuery;
use provisiond::request;
use provisiond::storage::{days_ago_rfc3339, now_rfc3339, InstanceRow};
use provisiond::AppContext;
use std::sync::Arc;
use tempfile::TempDir;

/// Signup + provision sweep; returns the instance in whatever state the
/// executor left it.
async fn provision_one(ctx: &Arc<AppContext>, subdomain: &str) -> InstanceRow {
    let row = request::create_from_signup(&ctx.storage, &ctx.config, &signup(subdomain))
        .await
        .unwrap();
    jobs::provision_sweep(ctx).await;
    ctx.storage
        .get_instance(row.instance_id.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn successful_run_activates_and_schedules_first_backup() {
    let dir = TempDir::new().unwrap();
    let (ctx, state) = make_ctx(&dir).await;

    let instance = provision_one(&ctx, "acme").await;
    assert_eq!(instance.state, "active");
    assert!(instance.provisioned_at.is_some());
    assert!(instance.next_backup.is_some());
    assert_eq!(instance.container_id.as_deref(), Some("cid-odoo_acme"));

    // Steps ran in order against the collaborators.
    let calls = state.calls();
    let index_of = |needle: &str| {
        calls
            .iter()
            .position(|c| c.contains(needle))
            .unwrap_or_else(|| panic!("missing call: {needle}"))
    };
    assert!(index_of("check_connection") < index_of("create_database acme"));
    assert!(index_of("create_database acme") < index_of("deploy odoo_acme"));
    assert!(index_of("deploy odoo_acme") < index_of("wait_ready"));
    assert!(index_of("wait_ready") < index_of("install_modules crm,sale"));
    assert!(index_of("install_modules crm,sale") < index_of("configure_admin"));
    assert!(index_of("configure_admin") < index_of("set_company_name Acme Corp"));

    // Customer bookkeeping followed activation.
    let customer = ctx
        .storage
        .find_customer_by_email("owner@acme.example.com")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(customer.instance_count, 1);

    let logs = ctx
        .logs
        .query(&instance.id, &LogQuery::default())
        .await
        .unwrap();
    assert!(logs
        .iter()
        .any(|l| l.message == "Provisioning completed successfully"));
}

#[tokio::test]
async fn failure_at_module_install_leaves_database_and_container_in_place() {
    let dir = TempDir::new().unwrap();
    let (ctx, state) = make_ctx(&dir).await;
    state.fail_at("install_modules");

    let instance = provision_one(&ctx, "acme").await;
    assert_eq!(instance.state, "error");
    // The database and container were created and are NOT cleaned up.
    assert_eq!(state.calls_containing("create_database acme").len(), 1);
    assert_eq!(state.calls_containing("deploy odoo_acme").len(), 1);
    assert!(state.calls_containing("drop_database").is_empty());
    assert!(state.calls_containing("remove").is_empty());
    // Later steps never ran.
    assert!(state.calls_containing("configure_admin").is_empty());

    // The failure reason is in the instance log.
    let logs = ctx
        .logs
        .query(&instance.id, &LogQuery::default())
        .await
        .unwrap();
    let error_entry = logs.iter().find(|l| l.level == "error").unwrap();
    assert!(error_entry.message.contains("injected install_modules failure"));
    assert_eq!(error_entry.operation.as_deref(), Some("install_modules"));
}

#[tokio::test]
async fn preexisting_database_is_a_warning_not_a_failure() {
    let dir = TempDir::new().unwrap();
    let (ctx, state) = make_ctx(&dir).await;
    *state.existing_db.lock().unwrap() = true;

    let instance = provision_one(&ctx, "acme").await;
    assert_eq!(instance.state, "active");

    let logs = ctx
        .logs
        .query(&instance.id, &LogQuery::default())
        .await
        .unwrap();
    let warning = logs.iter().find(|l| l.level == "warning").unwrap();
    assert!(warning.message.contains("already exists, using existing database"));
}

#[tokio::test]
async fn backup_sweep_covers_exactly_the_due_set_and_advances_the_clock() {
    let dir = TempDir::new().unwrap();
    let (ctx, state) = make_ctx(&dir).await;

    let instance = provision_one(&ctx, "acme").await;
    assert_eq!(instance.state, "active");

    // Freshly activated: first backup is due in the future, so the sweep
    // must not touch it yet.
    jobs::backup_sweep(&ctx).await;
    assert!(state.calls_containing("dump_database").is_empty());

    // Force the due time into the past.
    let past = days_ago_rfc3339(1);
    ctx.storage
        .mark_instance_active(&instance.id, &now_rfc3339(), Some(&past))
        .await
        .unwrap();
    jobs::backup_sweep(&ctx).await;
    assert_eq!(state.calls_containing("dump_database acme").len(), 1);

    let after = ctx.storage.get_instance(&instance.id).await.unwrap().unwrap();
    assert!(after.last_backup.is_some());
    assert!(after.next_backup.unwrap() > now_rfc3339());
}

#[tokio::test]
async fn failed_backup_keeps_the_instance_due() {
    let dir = TempDir::new().unwrap();
    let (ctx, state) = make_ctx(&dir).await;

    let instance = provision_one(&ctx, "acme").await;
    let past = days_ago_rfc3339(1);
    ctx.storage
        .mark_instance_active(&instance.id, &now_rfc3339(), Some(&past))
        .await
        .unwrap();

    state.fail_at("dump_database");
    jobs::backup_sweep(&ctx).await;

    let after = ctx.storage.get_instance(&instance.id).await.unwrap().unwrap();
    assert!(after.last_backup.is_none());
    assert_eq!(after.next_backup.as_deref(), Some(past.as_str()));

    // Next healthy sweep picks it up again.
    state.clear_failures();
    jobs::backup_sweep(&ctx).await;
    let after = ctx.storage.get_instance(&instance.id).await.unwrap().unwrap();
    assert!(after.last_backup.is_some());
}

#[tokio::test]
async fn lifecycle_actions_move_between_active_suspended_and_terminated() {
    let dir = TempDir::new().unwrap();
    let (ctx, state) = make_ctx(&dir).await;

    let instance = provision_one(&ctx, "acme").await;

    let stopped = ctx.provisioner.stop(&instance).await.unwrap();
    assert_eq!(stopped.state, "suspended");

    // Stopping a suspended instance is a state error.
    let err = ctx.provisioner.stop(&stopped).await.unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));

    let started = ctx.provisioner.start(&stopped).await.unwrap();
    assert_eq!(started.state, "active");

    let restarted = ctx.provisioner.restart(&started).await.unwrap();
    assert_eq!(restarted.state, "active");

    let terminated = ctx.provisioner.terminate(&restarted).await.unwrap();
    assert_eq!(terminated.state, "terminated");
    assert_eq!(state.calls_containing("remove cid-odoo_acme").len(), 1);
    assert_eq!(state.calls_containing("drop_database acme").len(), 1);

    let err = ctx.provisioner.terminate(&terminated).await.unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
}

#[tokio::test]
async fn monitor_sweep_records_container_usage() {
    let dir = TempDir::new().unwrap();
    let (ctx, state) = make_ctx(&dir).await;

    let instance = provision_one(&ctx, "acme").await;
    jobs::monitor_sweep(&ctx).await;

    assert_eq!(state.calls_containing("stats cid-odoo_acme").len(), 1);
    let after = ctx.storage.get_instance(&instance.id).await.unwrap().unwrap();
    assert_eq!(after.cpu_usage, Some(1.5));
    assert_eq!(after.memory_usage, Some(2.5));
    assert!(after.last_activity.is_some());
}
