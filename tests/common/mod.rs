//! Shared test fixtures: an AppContext wired to in-memory fakes of the
//! three external collaborators, recording every call they receive.
#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use provisiond::config::{PlanSeed, ProvisionerConfig};
use provisiond::logstore::LogStore;
use provisiond::provision::database::{CreateDbOutcome, DatabaseServer};
use provisiond::provision::rpc::{InstallOutcome, InstanceRpc, RpcTarget};
use provisiond::provision::runtime::{ContainerRuntime, ContainerSpec, ContainerStats};
use provisiond::provision::Provisioner;
use provisiond::request::SignupPayload;
use provisiond::storage::Storage;
use provisiond::AppContext;

/// Shared state behind the fakes: call log plus failure injection.
#[derive(Default)]
pub struct FakeState {
    calls: Mutex<Vec<String>>,
    fail_at: Mutex<Option<String>>,
    /// When true, create_database reports the database as pre-existing.
    pub existing_db: Mutex<bool>,
}

impl FakeState {
    pub fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_containing(&self, needle: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.contains(needle))
            .collect()
    }

    /// Make the named operation fail with a canned error.
    pub fn fail_at(&self, operation: &str) {
        *self.fail_at.lock().unwrap() = Some(operation.to_string());
    }

    pub fn clear_failures(&self) {
        *self.fail_at.lock().unwrap() = None;
    }

    fn check(&self, operation: &str) -> Result<()> {
        if self.fail_at.lock().unwrap().as_deref() == Some(operation) {
            Err(anyhow!("injected {operation} failure"))
        } else {
            Ok(())
        }
    }
}

pub struct FakeDb(pub Arc<FakeState>);

#[async_trait]
impl DatabaseServer for FakeDb {
    async fn check_connection(&self) -> Result<()> {
        self.0.record("check_connection");
        self.0.check("check_connection")
    }

    async fn create_database(&self, name: &str) -> Result<CreateDbOutcome> {
        self.0.record(format!("create_database {name}"));
        self.0.check("create_database")?;
        if *self.0.existing_db.lock().unwrap() {
            Ok(CreateDbOutcome::AlreadyExists)
        } else {
            Ok(CreateDbOutcome::Created)
        }
    }

    async fn drop_database(&self, name: &str) -> Result<()> {
        self.0.record(format!("drop_database {name}"));
        self.0.check("drop_database")
    }

    async fn dump_database(&self, name: &str, dest_dir: &Path) -> Result<PathBuf> {
        self.0.record(format!("dump_database {name}"));
        self.0.check("dump_database")?;
        Ok(dest_dir.join(format!("{name}.dump")))
    }
}

pub struct FakeRuntime(pub Arc<FakeState>);

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn deploy(&self, spec: &ContainerSpec) -> Result<String> {
        self.0.record(format!("deploy {}", spec.name));
        self.0.check("deploy")?;
        Ok(format!("cid-{}", spec.name))
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        self.0.record(format!("start {container_id}"));
        self.0.check("start")
    }

    async fn stop(&self, container_id: &str) -> Result<()> {
        self.0.record(format!("stop {container_id}"));
        self.0.check("stop")
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        self.0.record(format!("remove {container_id}"));
        self.0.check("remove")
    }

    async fn stats(&self, container_id: &str) -> Result<ContainerStats> {
        self.0.record(format!("stats {container_id}"));
        self.0.check("stats")?;
        Ok(ContainerStats {
            cpu_percent: Some(1.5),
            memory_percent: Some(2.5),
        })
    }
}

pub struct FakeRpc(pub Arc<FakeState>);

#[async_trait]
impl InstanceRpc for FakeRpc {
    async fn wait_ready(&self, base_url: &str) -> Result<()> {
        self.0.record(format!("wait_ready {base_url}"));
        self.0.check("wait_ready")
    }

    async fn install_modules(
        &self,
        _target: &RpcTarget,
        modules: &[String],
    ) -> Result<InstallOutcome> {
        self.0.record(format!("install_modules {}", modules.join(",")));
        self.0.check("install_modules")?;
        if modules.is_empty() {
            Ok(InstallOutcome::NoModulesRequested)
        } else {
            Ok(InstallOutcome::Installed(modules.to_vec()))
        }
    }

    async fn configure_admin(
        &self,
        _target: &RpcTarget,
        login: &str,
        _email: &str,
        _password: &str,
    ) -> Result<()> {
        self.0.record(format!("configure_admin {login}"));
        self.0.check("configure_admin")
    }

    async fn set_company_name(&self, _target: &RpcTarget, company: &str) -> Result<()> {
        self.0.record(format!("set_company_name {company}"));
        self.0.check("set_company_name")
    }
}

pub fn basic_plan() -> PlanSeed {
    PlanSeed {
        code: "basic".to_string(),
        name: "Basic".to_string(),
        description: Some("Entry plan".to_string()),
        plan_type: "basic".to_string(),
        monthly_price: 25.0,
        currency: "USD".to_string(),
        max_users: 5,
        storage_limit_gb: 10,
        modules: vec!["crm".to_string(), "sale".to_string()],
        sequence: 10,
    }
}

pub fn signup(subdomain: &str) -> SignupPayload {
    SignupPayload {
        customer_email: Some(format!("owner@{subdomain}.example.com")),
        customer_name: Some("Jamie Doe".to_string()),
        customer_phone: Some("0123456789".to_string()),
        company_name: Some("Acme Corp".to_string()),
        plan_code: Some("basic".to_string()),
        subdomain: Some(subdomain.to_string()),
        ..Default::default()
    }
}

/// AppContext wired to the fakes, with one active plan seeded.
pub async fn make_ctx(dir: &TempDir) -> (Arc<AppContext>, Arc<FakeState>) {
    let config = Arc::new(ProvisionerConfig::new(
        Some(0),
        Some(dir.path().to_path_buf()),
        Some("error".to_string()),
        None,
    ));
    let storage = Arc::new(Storage::new(dir.path()).await.unwrap());
    let logs = Arc::new(LogStore::new(storage.pool()));
    storage.upsert_plan(&basic_plan()).await.unwrap();

    let state = Arc::new(FakeState::default());
    let provisioner = Arc::new(Provisioner::new(
        storage.clone(),
        logs.clone(),
        Arc::new(FakeDb(state.clone())),
        Arc::new(FakeRuntime(state.clone())),
        Arc::new(FakeRpc(state.clone())),
        config.clone(),
    ));

    let ctx = Arc::new(AppContext {
        config,
        storage,
        logs,
        provisioner,
        hot: None,
        started_at: std::time::Instant::now(),
    });
    (ctx, state)
}
