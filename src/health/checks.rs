//! Individual health probes behind `/api/v1/health`.
//!
//! Three things can sink a provisioning daemon: its own SQLite store, the
//! data directory it writes backups and config to, and the external binaries
//! it shells out to. Each gets a probe behind [`SystemHealthCheck`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};

use crate::storage::now_rfc3339;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Ok,
    /// Functional, but some operations will fail — e.g. a client tool
    /// missing from PATH blocks backups while the API keeps serving.
    Degraded,
    Critical,
}

impl CheckStatus {
    fn severity(self) -> u8 {
        match self {
            CheckStatus::Ok => 0,
            CheckStatus::Degraded => 1,
            CheckStatus::Critical => 2,
        }
    }

    pub fn worst(a: CheckStatus, b: CheckStatus) -> CheckStatus {
        if a.severity() >= b.severity() {
            a
        } else {
            b
        }
    }
}

/// Outcome of one probe, serialized into the health report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
    pub checked_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

impl CheckResult {
    fn new(name: &str, status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            message: message.into(),
            checked_at: now_rfc3339(),
            latency_ms: None,
        }
    }
}

#[async_trait]
pub trait SystemHealthCheck: Send + Sync {
    async fn run(&self) -> CheckResult;
}

// ─── Database ─────────────────────────────────────────────────────────────────

/// Round-trips a query through the SQLite pool and reports the latency
/// together with the instance count.
pub struct DatabaseHealthCheck {
    pool: SqlitePool,
}

impl DatabaseHealthCheck {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SystemHealthCheck for DatabaseHealthCheck {
    async fn run(&self) -> CheckResult {
        let started = std::time::Instant::now();
        let count: Result<(i64,), sqlx::Error> =
            sqlx::query_as("SELECT COUNT(*) FROM instances")
                .fetch_one(&self.pool)
                .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match count {
            Ok((instances,)) => {
                let mut result = CheckResult::new(
                    "database",
                    CheckStatus::Ok,
                    format!("SQLite reachable, {instances} instance(s) on record"),
                );
                result.latency_ms = Some(latency_ms);
                result
            }
            Err(e) => CheckResult::new(
                "database",
                CheckStatus::Critical,
                format!("SQLite query failed: {e}"),
            ),
        }
    }
}

// ─── Data directory ───────────────────────────────────────────────────────────

/// Verifies the data directory exists and accepts writes. Backups and the
/// SQLite WAL both land there, so an unwritable directory is critical.
pub struct StorageHealthCheck {
    data_dir: PathBuf,
}

impl StorageHealthCheck {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }
}

fn probe_writable(dir: &Path) -> Result<(), String> {
    if !dir.is_dir() {
        return Err(format!("data_dir is not a directory: {}", dir.display()));
    }
    let probe = dir.join(".write_probe");
    std::fs::write(&probe, b"ok")
        .map_err(|e| format!("data_dir is not writable: {} ({e})", dir.display()))?;
    let _ = std::fs::remove_file(&probe);
    Ok(())
}

#[async_trait]
impl SystemHealthCheck for StorageHealthCheck {
    async fn run(&self) -> CheckResult {
        let dir = self.data_dir.clone();
        let display = dir.display().to_string();
        // File-system probing blocks; keep it off the runtime workers.
        let outcome = tokio::task::spawn_blocking(move || probe_writable(&dir)).await;

        match outcome {
            Ok(Ok(())) => CheckResult::new(
                "storage",
                CheckStatus::Ok,
                format!("data_dir writable: {display}"),
            ),
            Ok(Err(msg)) => CheckResult::new("storage", CheckStatus::Critical, msg),
            Err(e) => CheckResult::new(
                "storage",
                CheckStatus::Critical,
                format!("storage probe panicked: {e}"),
            ),
        }
    }
}

// ─── External tooling ─────────────────────────────────────────────────────────

/// Binaries the executor shells out to, with the operation each unblocks.
const REQUIRED_BINARIES: &[(&str, &str)] = &[
    ("docker", "container deployment"),
    ("psql", "database connectivity checks"),
    ("createdb", "database creation"),
    ("pg_dump", "backups"),
];

/// Probes PATH for the container runtime and PostgreSQL client tools.
/// Missing tools degrade (the API and store still work) rather than fail.
pub struct ToolingHealthCheck;

impl ToolingHealthCheck {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ToolingHealthCheck {
    fn default() -> Self {
        Self::new()
    }
}

fn on_path(binary: &str) -> bool {
    let Some(path_var) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path_var).any(|dir| dir.join(binary).is_file())
}

#[async_trait]
impl SystemHealthCheck for ToolingHealthCheck {
    async fn run(&self) -> CheckResult {
        let missing: Vec<String> = tokio::task::spawn_blocking(|| {
            REQUIRED_BINARIES
                .iter()
                .filter(|(binary, _)| !on_path(binary))
                .map(|(binary, purpose)| format!("{binary} ({purpose})"))
                .collect()
        })
        .await
        .unwrap_or_default();

        if missing.is_empty() {
            CheckResult::new(
                "tooling",
                CheckStatus::Ok,
                "docker and PostgreSQL client tools available",
            )
        } else {
            CheckResult::new(
                "tooling",
                CheckStatus::Degraded,
                format!("Missing on PATH: {}", missing.join(", ")),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worst_picks_the_higher_severity() {
        assert_eq!(
            CheckStatus::worst(CheckStatus::Ok, CheckStatus::Degraded),
            CheckStatus::Degraded
        );
        assert_eq!(
            CheckStatus::worst(CheckStatus::Critical, CheckStatus::Degraded),
            CheckStatus::Critical
        );
        assert_eq!(
            CheckStatus::worst(CheckStatus::Ok, CheckStatus::Ok),
            CheckStatus::Ok
        );
    }

    #[tokio::test]
    async fn storage_check_flags_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("nope");
        let result = StorageHealthCheck::new(&gone).run().await;
        assert_eq!(result.status, CheckStatus::Critical);

        let result = StorageHealthCheck::new(dir.path()).run().await;
        assert_eq!(result.status, CheckStatus::Ok);
    }
}
