//! Daemon health reporting for the `/api/v1/health` endpoint.

pub mod checks;

use serde::Serialize;
use sqlx::SqlitePool;
use std::path::Path;

use checks::{
    CheckResult, CheckStatus, DatabaseHealthCheck, StorageHealthCheck, SystemHealthCheck,
    ToolingHealthCheck,
};

/// Aggregate report: the worst individual status wins.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: CheckStatus,
    pub checks: Vec<CheckResult>,
}

pub async fn run_report(pool: SqlitePool, data_dir: &Path) -> HealthReport {
    let all: Vec<Box<dyn SystemHealthCheck>> = vec![
        Box::new(DatabaseHealthCheck::new(pool)),
        Box::new(StorageHealthCheck::new(data_dir)),
        Box::new(ToolingHealthCheck::new()),
    ];

    let mut status = CheckStatus::Ok;
    let mut results = Vec::with_capacity(all.len());
    for check in all {
        let result = check.run().await;
        status = CheckStatus::worst(status, result.status);
        results.push(result);
    }

    HealthReport {
        status,
        checks: results,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    #[tokio::test]
    async fn report_is_ok_or_degraded_on_healthy_storage() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path()).await.unwrap();
        let report = run_report(storage.pool(), dir.path()).await;
        // Tooling may legitimately be absent in CI, but the database and
        // data dir must be healthy.
        assert_ne!(report.status, CheckStatus::Critical);
        assert!(report.checks.iter().any(|c| c.name == "database"));
        assert!(report.checks.iter().any(|c| c.name == "storage"));
    }
}
