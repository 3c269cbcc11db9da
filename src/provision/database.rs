//! Tenant database collaborator.
//!
//! The production implementation shells out to the PostgreSQL client tools
//! (`psql`, `createdb`, `dropdb`, `pg_dump`) with the connection settings
//! exported as the standard `PG*` environment variables. Tests substitute
//! an in-memory fake.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

use super::run_command;
use crate::config::DatabaseConfig;

/// Result of a create-database call. An existing database is usable, not an
/// error — the caller downgrades it to a warning and continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateDbOutcome {
    Created,
    AlreadyExists,
}

#[async_trait]
pub trait DatabaseServer: Send + Sync {
    /// Cheap connectivity probe run before any provisioning side effect.
    async fn check_connection(&self) -> Result<()>;

    async fn create_database(&self, name: &str) -> Result<CreateDbOutcome>;

    async fn drop_database(&self, name: &str) -> Result<()>;

    /// Dump `name` into a new archive under `dest_dir`; returns the path.
    async fn dump_database(&self, name: &str, dest_dir: &Path) -> Result<PathBuf>;
}

// ─── PostgreSQL CLI implementation ────────────────────────────────────────────

pub struct PostgresCli {
    config: DatabaseConfig,
    command_timeout: Duration,
}

impl PostgresCli {
    pub fn new(config: DatabaseConfig, command_timeout: Duration) -> Self {
        Self {
            config,
            command_timeout,
        }
    }

    fn command(&self, program: &str) -> Command {
        let mut cmd = Command::new(program);
        cmd.env("PGHOST", &self.config.host)
            .env("PGPORT", self.config.port.to_string())
            .env("PGUSER", &self.config.user);
        if let Some(password) = &self.config.password {
            cmd.env("PGPASSWORD", password);
        }
        cmd
    }
}

/// Map raw client-tool output to a message an operator can act on.
fn classify_failure(host: &str, port: u16, output: &str) -> String {
    let lower = output.to_lowercase();
    if output.contains("Connection refused") || lower.contains("could not connect") {
        format!(
            "PostgreSQL server is not accessible at {host}:{port}. \
             Ensure the database server is running and reachable. Details: {output}"
        )
    } else if lower.contains("command not found")
        || lower.contains("no such file or directory")
    {
        format!(
            "Required command not found. Ensure the PostgreSQL client tools are installed. \
             Details: {output}"
        )
    } else if lower.contains("permission denied") {
        format!("Permission denied. Check database user privileges. Details: {output}")
    } else {
        output.to_string()
    }
}

#[async_trait]
impl DatabaseServer for PostgresCli {
    async fn check_connection(&self) -> Result<()> {
        let mut cmd = self.command("psql");
        cmd.args(["-d", "postgres", "-Atc", "SELECT 1"]);
        let output = run_command(cmd, Duration::from_secs(60)).await?;
        if output.success {
            Ok(())
        } else {
            Err(anyhow!(
                "Cannot connect to PostgreSQL at {}:{}: {}",
                self.config.host,
                self.config.port,
                classify_failure(&self.config.host, self.config.port, &output.combined())
            ))
        }
    }

    async fn create_database(&self, name: &str) -> Result<CreateDbOutcome> {
        let mut cmd = self.command("createdb");
        cmd.arg(name);
        let output = run_command(cmd, self.command_timeout).await?;
        let combined = output.combined();
        if combined.contains("already exists") {
            return Ok(CreateDbOutcome::AlreadyExists);
        }
        if !output.success {
            return Err(anyhow!(
                "Database creation failed: {}",
                classify_failure(&self.config.host, self.config.port, &combined)
            ));
        }
        Ok(CreateDbOutcome::Created)
    }

    async fn drop_database(&self, name: &str) -> Result<()> {
        let mut cmd = self.command("dropdb");
        cmd.args(["--if-exists", name]);
        let output = run_command(cmd, self.command_timeout).await?;
        if !output.success {
            return Err(anyhow!("Dropping database {name} failed: {}", output.combined()));
        }
        Ok(())
    }

    async fn dump_database(&self, name: &str, dest_dir: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(dest_dir).await?;
        let stamp = Utc::now().format("%Y%m%d%H%M%S");
        let dest = dest_dir.join(format!("{name}-{stamp}.dump"));

        let mut cmd = self.command("pg_dump");
        cmd.arg("-Fc").arg("-f").arg(&dest).arg(name);
        let output = run_command(cmd, self.command_timeout).await?;
        if !output.success {
            return Err(anyhow!("Backup failed: {}", output.combined()));
        }
        Ok(dest)
    }
}
