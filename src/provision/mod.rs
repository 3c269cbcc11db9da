//! Provisioning executor and instance lifecycle actions.
//!
//! The executor runs one synchronous sequence per instance: connectivity
//! check, database creation, container deployment, readiness wait, module
//! installation, admin and company configuration, subdomain recording,
//! activation. Every step writes an instance log entry. A failing step
//! moves the instance to `error` and aborts the rest — side effects already
//! performed (database, container) are left in place for inspection.

pub mod database;
pub mod rpc;
pub mod runtime;

use anyhow::{Context as _, Result as AnyResult};
use chrono::Utc;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::config::ProvisionerConfig;
use crate::error::{Error, Result};
use crate::instance::{self, BackupFrequency, InstanceState};
use crate::logstore::{LogEntry, LogLevel, LogStore};
use crate::storage::{now_rfc3339, InstanceRow, Storage};
use database::{CreateDbOutcome, DatabaseServer};
use rpc::{InstallOutcome, InstanceRpc, RpcTarget};
use runtime::{ContainerRuntime, ContainerSpec};

// ─── Subprocess helper ────────────────────────────────────────────────────────

pub(crate) struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// stdout and stderr joined — failure details can land on either stream.
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

/// Run a subprocess to completion with a hard timeout, capturing output.
pub(crate) async fn run_command(mut cmd: Command, timeout: Duration) -> AnyResult<CommandOutput> {
    let program = cmd.as_std().get_program().to_string_lossy().to_string();
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| anyhow::anyhow!("{program} timed out after {}s", timeout.as_secs()))?
        .with_context(|| format!("failed to run {program}"))?;

    Ok(CommandOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

// ─── Provisioner ──────────────────────────────────────────────────────────────

/// Owns the external collaborators and drives all side-effecting instance
/// operations: the provisioning sequence, start/stop/restart, backups,
/// termination, and resource monitoring.
pub struct Provisioner {
    storage: Arc<Storage>,
    logs: Arc<LogStore>,
    db: Arc<dyn DatabaseServer>,
    runtime: Arc<dyn ContainerRuntime>,
    rpc: Arc<dyn InstanceRpc>,
    config: Arc<ProvisionerConfig>,
}

impl Provisioner {
    pub fn new(
        storage: Arc<Storage>,
        logs: Arc<LogStore>,
        db: Arc<dyn DatabaseServer>,
        runtime: Arc<dyn ContainerRuntime>,
        rpc: Arc<dyn InstanceRpc>,
        config: Arc<ProvisionerConfig>,
    ) -> Self {
        Self {
            storage,
            logs,
            db,
            runtime,
            rpc,
            config,
        }
    }

    fn base_url(&self, instance: &InstanceRow) -> String {
        format!("http://127.0.0.1:{}", instance.port)
    }

    fn container_spec(&self, instance: &InstanceRow) -> ContainerSpec {
        let dbc = &self.config.database;
        ContainerSpec {
            name: format!("{}_{}", self.config.app_image, instance.database_name),
            image: format!("{}:{}", self.config.app_image, instance.app_version),
            host_port: instance.port as u16,
            internal_port: self.config.provisioning.app_internal_port,
            env: vec![
                ("HOST".to_string(), dbc.host.clone()),
                ("USER".to_string(), dbc.user.clone()),
                (
                    "PASSWORD".to_string(),
                    dbc.password.clone().unwrap_or_default(),
                ),
                ("DATABASE".to_string(), instance.database_name.clone()),
            ],
            volume: format!("{}_data_{}", self.config.app_image, instance.database_name),
            volume_mount: self.config.provisioning.app_data_mount.clone(),
            network: self.config.provisioning.container_network.clone(),
            command_args: vec![format!("--db-filter=^{}$", instance.database_name)],
        }
    }

    /// Record a step failure, move the instance to `error`, and build the
    /// error the caller propagates. Completed side effects are not undone.
    async fn fail(&self, instance: &InstanceRow, operation: &str, err: anyhow::Error) -> Error {
        error!(instance_id = %instance.id, operation, err = %err, "provisioning step failed");
        self.logs
            .append(
                &instance.id,
                LogEntry::new(LogLevel::Error, err.to_string())
                    .operation(operation)
                    .component("executor"),
            )
            .await;
        if let Err(e) = self
            .storage
            .set_instance_state(&instance.id, InstanceState::Error.as_str())
            .await
        {
            warn!(instance_id = %instance.id, err = %e, "failed to record error state");
        }
        Error::Operational(err)
    }

    /// The provisioning sequence. Called by the provision sweep for every
    /// instance in `provisioning`.
    pub async fn run(&self, instance: &InstanceRow) -> Result<()> {
        let id = &instance.id;
        let db_name = &instance.database_name;
        info!(instance_id = %id, subdomain = %instance.subdomain, "provisioning instance");
        self.logs.info(id, "Starting provisioning process").await;

        self.logs.info(id, "Checking database server connection").await;
        if let Err(e) = self.db.check_connection().await {
            return Err(self.fail(instance, "check_connection", e).await);
        }

        self.logs
            .info(
                id,
                format!(
                    "Creating database {db_name} on {}:{}",
                    self.config.database.host, self.config.database.port
                ),
            )
            .await;
        match self.db.create_database(db_name).await {
            Ok(CreateDbOutcome::Created) => {
                self.logs
                    .info(id, format!("Database {db_name} created successfully"))
                    .await
            }
            Ok(CreateDbOutcome::AlreadyExists) => {
                self.logs
                    .warning(
                        id,
                        format!("Database {db_name} already exists, using existing database"),
                    )
                    .await
            }
            Err(e) => return Err(self.fail(instance, "create_database", e).await),
        }

        self.logs.info(id, "Starting container deployment").await;
        let spec = self.container_spec(instance);
        let container_id = match self.runtime.deploy(&spec).await {
            Ok(container_id) => container_id,
            Err(e) => return Err(self.fail(instance, "deploy_container", e).await),
        };
        if let Err(e) = self.storage.set_instance_container(id, &container_id).await {
            return Err(self.fail(instance, "deploy_container", e).await);
        }
        self.logs
            .info(id, format!("Container {container_id} deployed successfully"))
            .await;

        let base_url = self.base_url(instance);
        self.logs
            .info(id, format!("Waiting for instance to come up at {base_url}"))
            .await;
        if let Err(e) = self.rpc.wait_ready(&base_url).await {
            return Err(self.fail(instance, "wait_ready", e).await);
        }

        self.logs.info(id, "Installing modules").await;
        let modules = match self.storage.get_plan(&instance.plan_code).await {
            Ok(Some(plan)) => plan.modules(),
            Ok(None) => Vec::new(),
            Err(e) => return Err(self.fail(instance, "install_modules", e).await),
        };
        // A fresh instance answers RPC with its bootstrap credentials until
        // the admin step below replaces them.
        let bootstrap = RpcTarget {
            base_url: base_url.clone(),
            database: db_name.clone(),
            login: "admin".to_string(),
            password: "admin".to_string(),
        };
        match self.rpc.install_modules(&bootstrap, &modules).await {
            Ok(InstallOutcome::Installed(names)) => {
                self.logs
                    .info(id, format!("Installed modules: {}", names.join(", ")))
                    .await
            }
            Ok(InstallOutcome::NoModulesRequested) => {
                self.logs.info(id, "No modules to install for this plan").await
            }
            Ok(InstallOutcome::NoneMatched(names)) => {
                self.logs
                    .warning(
                        id,
                        format!(
                            "No matching modules found on instance for: {}",
                            names.join(", ")
                        ),
                    )
                    .await
            }
            Err(e) => return Err(self.fail(instance, "install_modules", e).await),
        }

        self.logs.info(id, "Setting up admin user").await;
        if let Err(e) = self
            .rpc
            .configure_admin(
                &bootstrap,
                &instance.admin_email,
                &instance.admin_email,
                &instance.admin_password,
            )
            .await
        {
            return Err(self.fail(instance, "configure_admin", e).await);
        }

        self.logs.info(id, "Configuring company").await;
        let configured = RpcTarget {
            base_url: base_url.clone(),
            database: db_name.clone(),
            login: instance.admin_email.clone(),
            password: instance.admin_password.clone(),
        };
        if let Err(e) = self
            .rpc
            .set_company_name(&configured, &instance.company_name)
            .await
        {
            return Err(self.fail(instance, "configure_company", e).await);
        }

        // Reverse-proxy and DNS wiring are external; the step is recorded so
        // the timeline stays complete.
        self.logs
            .info(id, format!("Subdomain {} configured", instance.subdomain))
            .await;

        let now = Utc::now();
        let next_backup = if instance.backup_enabled {
            let frequency = BackupFrequency::parse_or_daily(&instance.backup_frequency);
            Some(instance::next_backup_after(now, frequency))
        } else {
            None
        };
        if let Err(e) = self
            .storage
            .mark_instance_active(id, &now_rfc3339(), next_backup.as_deref())
            .await
        {
            return Err(self.fail(instance, "activate", e).await);
        }

        if let Some(customer_id) = &instance.customer_id {
            if let Err(e) = self.storage.increment_customer_instances(customer_id).await {
                self.logs
                    .warning(id, format!("Customer notification failed: {e}"))
                    .await;
            }
        }

        self.logs.info(id, "Provisioning completed successfully").await;
        info!(instance_id = %id, subdomain = %instance.subdomain, "instance active");
        Ok(())
    }

    // ─── Lifecycle actions ──────────────────────────────────────────────────

    fn state_of(instance: &InstanceRow) -> InstanceState {
        InstanceState::parse(&instance.state).unwrap_or(InstanceState::Draft)
    }

    fn container_of(instance: &InstanceRow) -> Result<&str> {
        instance
            .container_id
            .as_deref()
            .ok_or_else(|| Error::operational("Instance has no container"))
    }

    async fn fresh(&self, id: &str) -> Result<InstanceRow> {
        self.storage
            .get_instance(id)
            .await?
            .ok_or_else(|| Error::operational("instance disappeared mid-action"))
    }

    pub async fn start(&self, instance: &InstanceRow) -> Result<InstanceRow> {
        if !Self::state_of(instance).can_start() {
            return Err(Error::invalid_state(
                "Only suspended or active instances can be started",
            ));
        }
        let container_id = Self::container_of(instance)?;
        if let Err(e) = self.runtime.start(container_id).await {
            self.logs
                .error(&instance.id, format!("Failed to start instance: {e}"))
                .await;
            return Err(Error::Operational(e));
        }
        self.storage
            .set_instance_state(&instance.id, InstanceState::Active.as_str())
            .await?;
        self.logs.info(&instance.id, "Instance started successfully").await;
        self.fresh(&instance.id).await
    }

    pub async fn stop(&self, instance: &InstanceRow) -> Result<InstanceRow> {
        if !Self::state_of(instance).can_stop() {
            return Err(Error::invalid_state("Only active instances can be stopped"));
        }
        let container_id = Self::container_of(instance)?;
        if let Err(e) = self.runtime.stop(container_id).await {
            self.logs
                .error(&instance.id, format!("Failed to stop instance: {e}"))
                .await;
            return Err(Error::Operational(e));
        }
        self.storage
            .set_instance_state(&instance.id, InstanceState::Suspended.as_str())
            .await?;
        self.logs.info(&instance.id, "Instance stopped successfully").await;
        self.fresh(&instance.id).await
    }

    pub async fn restart(&self, instance: &InstanceRow) -> Result<InstanceRow> {
        let stopped = self.stop(instance).await?;
        self.start(&stopped).await
    }

    /// Dump the instance database and stamp the backup times. On failure the
    /// due time is left untouched, so the backup sweep retries next round.
    pub async fn backup(&self, instance: &InstanceRow) -> Result<InstanceRow> {
        if !Self::state_of(instance).can_backup() {
            return Err(Error::invalid_state(
                "Only active instances can be backed up",
            ));
        }
        let dest_dir = self
            .config
            .data_dir
            .join("backups")
            .join(&instance.database_name);
        match self
            .db
            .dump_database(&instance.database_name, &dest_dir)
            .await
        {
            Ok(path) => {
                let now = Utc::now();
                let frequency = BackupFrequency::parse_or_daily(&instance.backup_frequency);
                self.storage
                    .record_instance_backup(
                        &instance.id,
                        &now_rfc3339(),
                        &instance::next_backup_after(now, frequency),
                    )
                    .await?;
                self.logs
                    .append(
                        &instance.id,
                        LogEntry::new(LogLevel::Info, "Backup created successfully")
                            .details(path.display().to_string()),
                    )
                    .await;
                self.fresh(&instance.id).await
            }
            Err(e) => {
                self.logs
                    .error(&instance.id, format!("Failed to create backup: {e}"))
                    .await;
                Err(Error::Operational(e))
            }
        }
    }

    /// Stop and remove the container, drop the database, and mark the
    /// instance terminated. This is the only operation that destroys the
    /// provisioned side effects.
    pub async fn terminate(&self, instance: &InstanceRow) -> Result<InstanceRow> {
        if !Self::state_of(instance).can_terminate() {
            return Err(Error::invalid_state("Instance is already terminated"));
        }

        let result: anyhow::Result<()> = async {
            if let Some(container_id) = instance.container_id.as_deref() {
                self.runtime.stop(container_id).await?;
                self.runtime.remove(container_id).await?;
            }
            self.db.drop_database(&instance.database_name).await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            self.logs
                .error(&instance.id, format!("Failed to terminate instance: {e}"))
                .await;
            return Err(Error::Operational(e));
        }

        self.storage
            .set_instance_state(&instance.id, InstanceState::Terminated.as_str())
            .await?;
        self.logs
            .info(&instance.id, "Instance terminated successfully")
            .await;
        self.fresh(&instance.id).await
    }

    /// Refresh container CPU/memory usage for the monitor sweep.
    pub async fn refresh_usage(&self, instance: &InstanceRow) -> Result<()> {
        let container_id = Self::container_of(instance)?;
        match self.runtime.stats(container_id).await {
            Ok(stats) => {
                self.storage
                    .update_instance_usage(&instance.id, stats.cpu_percent, stats.memory_percent)
                    .await?;
                Ok(())
            }
            Err(e) => {
                self.logs
                    .error(&instance.id, format!("Failed to update resource usage: {e}"))
                    .await;
                Err(Error::Operational(e))
            }
        }
    }
}
