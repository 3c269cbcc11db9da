//! Container runtime collaborator.
//!
//! The production implementation drives the `docker` CLI. One container per
//! instance, one named volume for its application data, host port published
//! to the app's internal port, restart-unless-stopped.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tokio::process::Command;

use super::run_command;

/// Everything needed to deploy one instance container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Container name, e.g. `odoo_acme_corp`.
    pub name: String,
    /// Full image reference including tag, e.g. `odoo:17.0`.
    pub image: String,
    pub host_port: u16,
    pub internal_port: u16,
    pub env: Vec<(String, String)>,
    /// Named volume for application data.
    pub volume: String,
    /// Mount point of the volume inside the container.
    pub volume_mount: String,
    pub network: Option<String>,
    /// Extra arguments passed to the container entrypoint.
    pub command_args: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ContainerStats {
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create the data volume if needed and run the container detached.
    /// Returns the container id.
    async fn deploy(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start(&self, container_id: &str) -> Result<()>;

    async fn stop(&self, container_id: &str) -> Result<()>;

    async fn remove(&self, container_id: &str) -> Result<()>;

    async fn stats(&self, container_id: &str) -> Result<ContainerStats>;
}

// ─── Docker CLI implementation ────────────────────────────────────────────────

pub struct DockerCli {
    command_timeout: Duration,
}

impl DockerCli {
    pub fn new(command_timeout: Duration) -> Self {
        Self { command_timeout }
    }

    async fn docker(&self, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new("docker");
        cmd.args(args);
        let output = run_command(cmd, self.command_timeout).await?;
        if !output.success {
            return Err(anyhow!("docker {} failed: {}", args[0], output.combined()));
        }
        Ok(output.stdout)
    }
}

/// Shape of one line of `docker stats --no-stream --format '{{json .}}'`.
#[derive(Debug, Deserialize)]
struct DockerStatsLine {
    #[serde(rename = "CPUPerc")]
    cpu_perc: String,
    #[serde(rename = "MemPerc")]
    mem_perc: String,
}

fn parse_percent(s: &str) -> Option<f64> {
    s.trim().trim_end_matches('%').parse().ok()
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn deploy(&self, spec: &ContainerSpec) -> Result<String> {
        // `docker volume create` is idempotent — an existing volume is reused.
        self.docker(&["volume", "create", spec.volume.as_str()]).await?;

        let port_mapping = format!("{}:{}", spec.host_port, spec.internal_port);
        let volume_mapping = format!("{}:{}:rw", spec.volume, spec.volume_mount);
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            spec.name.clone(),
            "-p".into(),
            port_mapping,
            "-v".into(),
            volume_mapping,
            "--restart".into(),
            "unless-stopped".into(),
        ];
        for (key, value) in &spec.env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        if let Some(network) = &spec.network {
            args.push("--network".into());
            args.push(network.clone());
        }
        args.push(spec.image.clone());
        args.extend(spec.command_args.iter().cloned());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let stdout = self.docker(&arg_refs).await?;
        let container_id = stdout.trim().to_string();
        if container_id.is_empty() {
            return Err(anyhow!("docker run returned no container id"));
        }
        Ok(container_id)
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        self.docker(&["start", container_id]).await.map(|_| ())
    }

    async fn stop(&self, container_id: &str) -> Result<()> {
        self.docker(&["stop", container_id]).await.map(|_| ())
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        self.docker(&["rm", "-f", container_id]).await.map(|_| ())
    }

    async fn stats(&self, container_id: &str) -> Result<ContainerStats> {
        let stdout = self
            .docker(&[
                "stats",
                "--no-stream",
                "--format",
                "{{json .}}",
                container_id,
            ])
            .await?;
        let line = stdout
            .lines()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| anyhow!("docker stats returned no output"))?;
        let parsed: DockerStatsLine = serde_json::from_str(line.trim())?;
        Ok(ContainerStats {
            cpu_percent: parse_percent(&parsed.cpu_perc),
            memory_percent: parse_percent(&parsed.mem_perc),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_strings_parse_with_and_without_sign() {
        assert_eq!(parse_percent("1.25%"), Some(1.25));
        assert_eq!(parse_percent(" 0.00% "), Some(0.0));
        assert_eq!(parse_percent("12.5"), Some(12.5));
        assert_eq!(parse_percent("--"), None);
    }

    #[test]
    fn stats_line_deserializes_docker_format() {
        let line = r#"{"CPUPerc":"0.15%","MemPerc":"3.40%","Name":"odoo_acme"}"#;
        let parsed: DockerStatsLine = serde_json::from_str(line).unwrap();
        assert_eq!(parse_percent(&parsed.cpu_perc), Some(0.15));
        assert_eq!(parse_percent(&parsed.mem_perc), Some(3.4));
    }
}
