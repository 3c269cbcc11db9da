//! RPC into a freshly deployed instance.
//!
//! Once an instance container answers HTTP, its modules are installed and
//! its admin user and company are configured over the application's
//! JSON-RPC endpoint. The readiness wait is a fixed-interval poll with a
//! hard deadline — there is no backoff and no retry beyond the deadline.

use anyhow::{anyhow, Context as _, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Connection coordinates for one instance.
#[derive(Debug, Clone)]
pub struct RpcTarget {
    /// e.g. `http://127.0.0.1:8070`
    pub base_url: String,
    pub database: String,
    pub login: String,
    pub password: String,
}

/// What happened to a module-install call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed(Vec<String>),
    /// The plan lists no modules; nothing to do.
    NoModulesRequested,
    /// None of the requested names exist on the instance.
    NoneMatched(Vec<String>),
}

#[async_trait]
pub trait InstanceRpc: Send + Sync {
    /// Poll `base_url` until it answers 200, at a fixed interval, up to the
    /// configured deadline.
    async fn wait_ready(&self, base_url: &str) -> Result<()>;

    async fn install_modules(
        &self,
        target: &RpcTarget,
        modules: &[String],
    ) -> Result<InstallOutcome>;

    /// Point the instance's admin account at the customer's login, email,
    /// and password.
    async fn configure_admin(
        &self,
        target: &RpcTarget,
        login: &str,
        email: &str,
        password: &str,
    ) -> Result<()>;

    async fn set_company_name(&self, target: &RpcTarget, company: &str) -> Result<()>;
}

// ─── JSON-RPC implementation ──────────────────────────────────────────────────

pub struct JsonRpcClient {
    http: reqwest::Client,
    poll_interval: Duration,
    ready_timeout: Duration,
}

impl JsonRpcClient {
    pub fn new(poll_interval: Duration, ready_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            poll_interval,
            ready_timeout,
        })
    }

    /// One `call` against the instance's `/jsonrpc` endpoint.
    async fn call(&self, base_url: &str, service: &str, method: &str, args: Value) -> Result<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": "call",
            "params": { "service": service, "method": method, "args": args },
            "id": 1,
        });
        let response: Value = self
            .http
            .post(format!("{base_url}/jsonrpc"))
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if let Some(error) = response.get("error") {
            let message = error
                .pointer("/data/message")
                .or_else(|| error.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("unknown RPC fault");
            return Err(anyhow!("RPC fault from {service}.{method}: {message}"));
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn authenticate(&self, target: &RpcTarget) -> Result<i64> {
        let result = self
            .call(
                &target.base_url,
                "common",
                "authenticate",
                json!([target.database, target.login, target.password, {}]),
            )
            .await?;
        result
            .as_i64()
            .ok_or_else(|| anyhow!("Authentication failed to instance"))
    }

    async fn execute_kw(
        &self,
        target: &RpcTarget,
        uid: i64,
        model: &str,
        method: &str,
        args: Value,
    ) -> Result<Value> {
        self.call(
            &target.base_url,
            "object",
            "execute_kw",
            json!([target.database, uid, target.password, model, method, args]),
        )
        .await
    }
}

#[async_trait]
impl InstanceRpc for JsonRpcClient {
    async fn wait_ready(&self, base_url: &str) -> Result<()> {
        let deadline = Instant::now() + self.ready_timeout;
        loop {
            match self.http.get(base_url).timeout(Duration::from_secs(5)).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(url = base_url, "instance answered readiness probe");
                    return Ok(());
                }
                Ok(response) => {
                    debug!(url = base_url, status = %response.status(), "instance not ready yet")
                }
                Err(e) => debug!(url = base_url, err = %e, "instance not reachable yet"),
            }
            if Instant::now() + self.poll_interval > deadline {
                return Err(anyhow!(
                    "Timed out waiting for instance at {base_url} after {}s",
                    self.ready_timeout.as_secs()
                ));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn install_modules(
        &self,
        target: &RpcTarget,
        modules: &[String],
    ) -> Result<InstallOutcome> {
        let names: Vec<String> = modules
            .iter()
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect();
        if names.is_empty() {
            return Ok(InstallOutcome::NoModulesRequested);
        }

        let uid = self.authenticate(target).await?;
        let found = self
            .execute_kw(
                target,
                uid,
                "ir.module.module",
                "search",
                json!([[["name", "in", names.clone()]]]),
            )
            .await?;
        let ids: Vec<i64> = found
            .as_array()
            .map(|a| a.iter().filter_map(Value::as_i64).collect())
            .unwrap_or_default();
        if ids.is_empty() {
            return Ok(InstallOutcome::NoneMatched(names));
        }

        self.execute_kw(
            target,
            uid,
            "ir.module.module",
            "button_immediate_install",
            json!([ids]),
        )
        .await?;
        Ok(InstallOutcome::Installed(names))
    }

    async fn configure_admin(
        &self,
        target: &RpcTarget,
        login: &str,
        email: &str,
        password: &str,
    ) -> Result<()> {
        let uid = self.authenticate(target).await?;
        self.execute_kw(
            target,
            uid,
            "res.users",
            "write",
            json!([[uid], { "login": login, "email": email, "password": password }]),
        )
        .await
        .context("Admin user setup failed")?;
        Ok(())
    }

    async fn set_company_name(&self, target: &RpcTarget, company: &str) -> Result<()> {
        let uid = self.authenticate(target).await?;
        let companies = self
            .execute_kw(target, uid, "res.company", "search", json!([[]]))
            .await
            .context("Company lookup failed")?;
        let first = companies
            .as_array()
            .and_then(|a| a.first())
            .and_then(Value::as_i64);
        if let Some(company_id) = first {
            self.execute_kw(
                target,
                uid,
                "res.company",
                "write",
                json!([[company_id], { "name": company }]),
            )
            .await
            .context("Company setup failed")?;
        }
        Ok(())
    }
}
