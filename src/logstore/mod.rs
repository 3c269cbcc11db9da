//! Append-only per-instance log store.
//!
//! Every provisioning step and lifecycle action writes one timestamped
//! entry. Entries are immutable once written; the only mutation is the
//! age-based cleanup, which drops debug/info entries and keeps warnings and
//! errors longer. There is deliberately no transactional link between an
//! action's side effect and its log entry — a crash between the two loses
//! the entry, not the effect.

use anyhow::Result;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::HashMap;
use tracing::warn;
use uuid::Uuid;

use crate::storage::now_rfc3339;

// ─── Levels ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

pub const ALL_LEVELS: [LogLevel; 5] = [
    LogLevel::Debug,
    LogLevel::Info,
    LogLevel::Warning,
    LogLevel::Error,
    LogLevel::Critical,
];

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warning" => Some(LogLevel::Warning),
            "error" => Some(LogLevel::Error),
            "critical" => Some(LogLevel::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Entries ──────────────────────────────────────────────────────────────────

/// One entry to append. The store assigns id and timestamp.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub details: Option<String>,
    pub operation: Option<String>,
    pub component: Option<String>,
    pub error_kind: Option<String>,
    pub stack_trace: Option<String>,
    pub request_id: Option<String>,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            details: None,
            operation: None,
            component: None,
            error_kind: None,
            stack_trace: None,
            request_id: None,
        }
    }

    pub fn operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn error_kind(mut self, kind: impl Into<String>) -> Self {
        self.error_kind = Some(kind.into());
        self
    }

    pub fn request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct LogRow {
    pub id: String,
    pub instance_id: String,
    pub timestamp: String,
    pub level: String,
    pub message: String,
    pub details: Option<String>,
    pub operation: Option<String>,
    pub component: Option<String>,
    pub error_kind: Option<String>,
    pub stack_trace: Option<String>,
    pub request_id: Option<String>,
}

// ─── Queries ──────────────────────────────────────────────────────────────────

/// Filter for [`LogStore::query`]. Defaults: last 24 hours, all levels,
/// 50 entries.
#[derive(Debug, Clone)]
pub struct LogQuery {
    pub hours: i64,
    pub levels: Option<Vec<LogLevel>>,
    pub limit: i64,
}

impl Default for LogQuery {
    fn default() -> Self {
        Self {
            hours: 24,
            levels: None,
            limit: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentError {
    pub timestamp: String,
    pub level: String,
    pub message: String,
    pub operation: Option<String>,
}

/// Aggregate view of an instance's recent log activity.
#[derive(Debug, Clone, Serialize)]
pub struct LogSummary {
    pub total: i64,
    pub by_level: HashMap<String, i64>,
    pub recent_errors: Vec<RecentError>,
    pub last_activity: Option<String>,
}

/// Top-10 counters over recent error/critical entries.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorPatterns {
    pub most_common_errors: Vec<(String, i64)>,
    pub errors_by_operation: Vec<(String, i64)>,
    pub errors_by_component: Vec<(String, i64)>,
    pub errors_by_hour: Vec<(String, i64)>,
}

// ─── Store ────────────────────────────────────────────────────────────────────

/// Shares the daemon's SQLite pool; see `instance_logs` in the schema.
#[derive(Clone)]
pub struct LogStore {
    pool: SqlitePool,
}

impl LogStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append one entry. Errors are logged at WARN and never propagated —
    /// a broken log store must not interrupt a provisioning run.
    pub async fn append(&self, instance_id: &str, entry: LogEntry) {
        if let Err(e) = self.try_append(instance_id, &entry).await {
            warn!(err = %e, instance_id, "instance log write failed");
        }
    }

    pub async fn try_append(&self, instance_id: &str, entry: &LogEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO instance_logs (id, instance_id, timestamp, level, message, details,
                 operation, component, error_kind, stack_trace, request_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(instance_id)
        .bind(now_rfc3339())
        .bind(entry.level.as_str())
        .bind(&entry.message)
        .bind(&entry.details)
        .bind(&entry.operation)
        .bind(&entry.component)
        .bind(&entry.error_kind)
        .bind(&entry.stack_trace)
        .bind(&entry.request_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn info(&self, instance_id: &str, message: impl Into<String>) {
        self.append(instance_id, LogEntry::new(LogLevel::Info, message))
            .await;
    }

    pub async fn warning(&self, instance_id: &str, message: impl Into<String>) {
        self.append(instance_id, LogEntry::new(LogLevel::Warning, message))
            .await;
    }

    pub async fn error(&self, instance_id: &str, message: impl Into<String>) {
        self.append(instance_id, LogEntry::new(LogLevel::Error, message))
            .await;
    }

    /// Recent entries for an instance, newest first.
    pub async fn query(&self, instance_id: &str, q: &LogQuery) -> Result<Vec<LogRow>> {
        let since = (Utc::now() - Duration::hours(q.hours))
            .to_rfc3339_opts(SecondsFormat::Micros, true);

        let mut sql = String::from(
            "SELECT * FROM instance_logs WHERE instance_id = ? AND timestamp >= ?",
        );
        if let Some(levels) = &q.levels {
            sql.push_str(&format!(
                " AND level IN ({})",
                vec!["?"; levels.len()].join(", ")
            ));
        }
        sql.push_str(" ORDER BY timestamp DESC LIMIT ?");

        let mut query = sqlx::query_as::<_, LogRow>(&sql).bind(instance_id).bind(since);
        if let Some(levels) = &q.levels {
            for level in levels {
                query = query.bind(level.as_str());
            }
        }
        Ok(query.bind(q.limit).fetch_all(&self.pool).await?)
    }

    /// Entries whose message or details contain `term`, newest first.
    pub async fn search(
        &self,
        instance_id: &str,
        term: &str,
        limit: i64,
    ) -> Result<Vec<LogRow>> {
        let pattern = format!("%{term}%");
        Ok(sqlx::query_as(
            "SELECT * FROM instance_logs
             WHERE instance_id = ? AND (message LIKE ? OR details LIKE ?)
             ORDER BY timestamp DESC LIMIT ?",
        )
        .bind(instance_id)
        .bind(&pattern)
        .bind(&pattern)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Entries around one entry, oldest first — for reading an incident in
    /// context.
    pub async fn context_window(
        &self,
        entry_id: &str,
        minutes_before: i64,
        minutes_after: i64,
    ) -> Result<Vec<LogRow>> {
        let anchor: Option<LogRow> = sqlx::query_as("SELECT * FROM instance_logs WHERE id = ?")
            .bind(entry_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(anchor) = anchor else {
            return Ok(Vec::new());
        };
        let at = DateTime::parse_from_rfc3339(&anchor.timestamp)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());
        let start = (at - Duration::minutes(minutes_before))
            .to_rfc3339_opts(SecondsFormat::Micros, true);
        let end = (at + Duration::minutes(minutes_after))
            .to_rfc3339_opts(SecondsFormat::Micros, true);

        Ok(sqlx::query_as(
            "SELECT * FROM instance_logs
             WHERE instance_id = ? AND timestamp >= ? AND timestamp <= ?
             ORDER BY timestamp",
        )
        .bind(&anchor.instance_id)
        .bind(&start)
        .bind(&end)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Entries in a date/level range, oldest first — the export shape.
    pub async fn export(
        &self,
        instance_id: &str,
        start: Option<&str>,
        end: Option<&str>,
        levels: Option<&[LogLevel]>,
    ) -> Result<Vec<LogRow>> {
        let mut sql = String::from("SELECT * FROM instance_logs WHERE instance_id = ?");
        if start.is_some() {
            sql.push_str(" AND timestamp >= ?");
        }
        if end.is_some() {
            sql.push_str(" AND timestamp <= ?");
        }
        if let Some(levels) = levels {
            sql.push_str(&format!(
                " AND level IN ({})",
                vec!["?"; levels.len()].join(", ")
            ));
        }
        sql.push_str(" ORDER BY timestamp");

        let mut query = sqlx::query_as::<_, LogRow>(&sql).bind(instance_id);
        if let Some(start) = start {
            query = query.bind(start);
        }
        if let Some(end) = end {
            query = query.bind(end);
        }
        if let Some(levels) = levels {
            for level in levels {
                query = query.bind(level.as_str());
            }
        }
        Ok(query.fetch_all(&self.pool).await?)
    }

    /// Summary of the last `hours` hours: totals per level, the five most
    /// recent error/critical entries, and the latest activity timestamp.
    pub async fn summary(&self, instance_id: &str, hours: i64) -> Result<LogSummary> {
        let since = (Utc::now() - Duration::hours(hours))
            .to_rfc3339_opts(SecondsFormat::Micros, true);

        let counts: Vec<(String, i64)> = sqlx::query_as(
            "SELECT level, COUNT(*) FROM instance_logs
             WHERE instance_id = ? AND timestamp >= ?
             GROUP BY level",
        )
        .bind(instance_id)
        .bind(&since)
        .fetch_all(&self.pool)
        .await?;

        let mut by_level: HashMap<String, i64> = ALL_LEVELS
            .iter()
            .map(|l| (l.as_str().to_string(), 0))
            .collect();
        let mut total = 0;
        for (level, count) in counts {
            total += count;
            by_level.insert(level, count);
        }

        let recent: Vec<LogRow> = sqlx::query_as(
            "SELECT * FROM instance_logs
             WHERE instance_id = ? AND timestamp >= ? AND level IN ('error', 'critical')
             ORDER BY timestamp DESC LIMIT 5",
        )
        .bind(instance_id)
        .bind(&since)
        .fetch_all(&self.pool)
        .await?;
        let recent_errors = recent
            .into_iter()
            .map(|r| RecentError {
                timestamp: r.timestamp,
                level: r.level,
                message: r.message,
                operation: r.operation,
            })
            .collect();

        let last_activity: (Option<String>,) = sqlx::query_as(
            "SELECT MAX(timestamp) FROM instance_logs WHERE instance_id = ? AND timestamp >= ?",
        )
        .bind(instance_id)
        .bind(&since)
        .fetch_one(&self.pool)
        .await?;

        Ok(LogSummary {
            total,
            by_level,
            recent_errors,
            last_activity: last_activity.0,
        })
    }

    /// Counters over error/critical entries of the last `days` days,
    /// optionally narrowed to one instance. Top 10 per dimension.
    pub async fn error_patterns(
        &self,
        instance_id: Option<&str>,
        days: i64,
    ) -> Result<ErrorPatterns> {
        let since = (Utc::now() - Duration::days(days))
            .to_rfc3339_opts(SecondsFormat::Micros, true);

        let mut sql = String::from(
            "SELECT * FROM instance_logs
             WHERE level IN ('error', 'critical') AND timestamp >= ?",
        );
        if instance_id.is_some() {
            sql.push_str(" AND instance_id = ?");
        }
        let mut query = sqlx::query_as::<_, LogRow>(&sql).bind(&since);
        if let Some(id) = instance_id {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut errors: HashMap<String, i64> = HashMap::new();
        let mut by_operation: HashMap<String, i64> = HashMap::new();
        let mut by_component: HashMap<String, i64> = HashMap::new();
        let mut by_hour: HashMap<String, i64> = HashMap::new();

        for row in &rows {
            let kind = row
                .error_kind
                .clone()
                .unwrap_or_else(|| error_kind_from_message(&row.message));
            *errors.entry(kind).or_insert(0) += 1;

            if let Some(op) = &row.operation {
                *by_operation.entry(op.clone()).or_insert(0) += 1;
            }
            if let Some(component) = &row.component {
                *by_component.entry(component.clone()).or_insert(0) += 1;
            }
            if let Ok(t) = DateTime::parse_from_rfc3339(&row.timestamp) {
                let hour = t.with_timezone(&Utc).format("%H").to_string();
                *by_hour.entry(hour).or_insert(0) += 1;
            }
        }

        Ok(ErrorPatterns {
            most_common_errors: top_counts(errors),
            errors_by_operation: top_counts(by_operation),
            errors_by_component: top_counts(by_component),
            errors_by_hour: top_counts(by_hour),
        })
    }

    /// Delete debug/info entries older than `cutoff`. Warnings and errors
    /// are kept for the full history. Returns the number deleted.
    pub async fn cleanup_before(&self, cutoff: &str) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM instance_logs
             WHERE timestamp < ? AND level IN ('debug', 'info')",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// Grouping key for an error message: everything before the first `:`,
/// otherwise the first 50 characters.
fn error_kind_from_message(message: &str) -> String {
    match message.split_once(':') {
        Some((head, _)) => head.trim().to_string(),
        None => message.chars().take(50).collect(),
    }
}

fn top_counts(map: HashMap<String, i64>) -> Vec<(String, i64)> {
    let mut entries: Vec<(String, i64)> = map.into_iter().collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries.truncate(10);
    entries
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    async fn test_store() -> (tempfile::TempDir, LogStore) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path()).await.unwrap();
        (dir, LogStore::new(storage.pool()))
    }

    #[tokio::test]
    async fn query_filters_by_level_and_orders_newest_first() {
        let (_dir, store) = test_store().await;
        store.info("inst-1", "step one").await;
        store.error("inst-1", "boom: disk full").await;
        store.info("inst-2", "other instance").await;

        let all = store.query("inst-1", &LogQuery::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].message, "boom: disk full");

        let errors = store
            .query(
                "inst-1",
                &LogQuery {
                    levels: Some(vec![LogLevel::Error, LogLevel::Critical]),
                    ..LogQuery::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].level, "error");
    }

    #[tokio::test]
    async fn summary_counts_levels_and_surfaces_recent_errors() {
        let (_dir, store) = test_store().await;
        store.info("inst-1", "ok").await;
        store.warning("inst-1", "slow").await;
        store.error("inst-1", "broken: pipe").await;

        let summary = store.summary("inst-1", 24).await.unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.by_level["info"], 1);
        assert_eq!(summary.by_level["warning"], 1);
        assert_eq!(summary.by_level["error"], 1);
        assert_eq!(summary.by_level["critical"], 0);
        assert_eq!(summary.recent_errors.len(), 1);
        assert_eq!(summary.recent_errors[0].message, "broken: pipe");
        assert!(summary.last_activity.is_some());
    }

    #[tokio::test]
    async fn search_matches_message_and_details() {
        let (_dir, store) = test_store().await;
        store
            .append(
                "inst-1",
                LogEntry::new(LogLevel::Info, "creating database")
                    .details("database acme_corp on localhost"),
            )
            .await;
        store.info("inst-1", "deploying container").await;

        let hits = store.search("inst-1", "acme_corp", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        let hits = store.search("inst-1", "deploy", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn error_patterns_group_by_kind_and_operation() {
        let (_dir, store) = test_store().await;
        for _ in 0..3 {
            store
                .append(
                    "inst-1",
                    LogEntry::new(LogLevel::Error, "Database creation failed: timeout")
                        .operation("create_database"),
                )
                .await;
        }
        store
            .append(
                "inst-1",
                LogEntry::new(LogLevel::Critical, "Container deployment failed: no image")
                    .operation("deploy_container"),
            )
            .await;
        store.info("inst-1", "not an error").await;

        let patterns = store.error_patterns(Some("inst-1"), 7).await.unwrap();
        assert_eq!(
            patterns.most_common_errors[0],
            ("Database creation failed".to_string(), 3)
        );
        assert_eq!(
            patterns.errors_by_operation[0],
            ("create_database".to_string(), 3)
        );
    }

    #[tokio::test]
    async fn export_is_ascending_and_respects_level_filter() {
        let (_dir, store) = test_store().await;
        store.info("inst-1", "first").await;
        store.error("inst-1", "second").await;
        store.info("inst-1", "third").await;

        let all = store.export("inst-1", None, None, None).await.unwrap();
        let messages: Vec<&str> = all.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second", "third"]);

        let errors = store
            .export("inst-1", None, None, Some(&[LogLevel::Error]))
            .await
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "second");
    }

    #[tokio::test]
    async fn context_window_returns_neighbours_in_order() {
        let (_dir, store) = test_store().await;
        store.info("inst-1", "before").await;
        store.error("inst-1", "incident").await;
        store.info("inst-1", "after").await;
        store.info("inst-2", "unrelated").await;

        let incident = store
            .query(
                "inst-1",
                &LogQuery {
                    levels: Some(vec![LogLevel::Error]),
                    ..LogQuery::default()
                },
            )
            .await
            .unwrap()
            .remove(0);

        let window = store.context_window(&incident.id, 5, 5).await.unwrap();
        let messages: Vec<&str> = window.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["before", "incident", "after"]);

        assert!(store.context_window("missing", 5, 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cleanup_removes_only_old_low_severity_entries() {
        let (_dir, store) = test_store().await;
        store.info("inst-1", "old info").await;
        store.error("inst-1", "old error").await;

        // Cutoff in the future: the info entry qualifies, the error never does.
        let cutoff = (Utc::now() + Duration::days(1))
            .to_rfc3339_opts(SecondsFormat::Micros, true);
        let deleted = store.cleanup_before(&cutoff).await.unwrap();
        assert_eq!(deleted, 1);

        let remaining = store.query("inst-1", &LogQuery::default()).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].level, "error");
    }
}
