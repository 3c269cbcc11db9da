use anyhow::{Context as _, Result};
use chrono::{SecondsFormat, Utc};
use sqlx::{sqlite::SqliteConnectOptions, ConnectOptions, SqlitePool};
use std::{path::Path, str::FromStr};
use uuid::Uuid;

/// Default timeout for individual SQLite queries.
/// Prevents hung queries from blocking the daemon indefinitely.
const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Execute a future with the standard query timeout.
/// Returns an error if the operation takes longer than `QUERY_TIMEOUT`.
async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "database query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        )),
    }
}

/// Current UTC time as RFC-3339 with fixed microsecond precision.
///
/// The fixed precision keeps lexicographic TEXT comparison consistent with
/// chronological order for every timestamp column.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// RFC-3339 cutoff `days` days in the past, same format as [`now_rfc3339`].
pub fn days_ago_rfc3339(days: i64) -> String {
    (Utc::now() - chrono::Duration::days(days)).to_rfc3339_opts(SecondsFormat::Micros, true)
}

// ─── Rows ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RequestRow {
    pub id: String,
    /// Human-facing identifier, e.g. `REQ-20250805143000-9f3a`.
    pub request_id: String,
    /// portal | manual | api
    pub source: String,
    pub customer_email: String,
    pub customer_name: String,
    pub customer_phone: Option<String>,
    pub company_name: String,
    pub plan_code: String,
    pub subdomain: String,
    pub database_name: String,
    pub admin_email: String,
    pub admin_password: String,
    /// low | normal | high | urgent
    pub priority: String,
    pub state: String,
    /// Original JSON payload of the signup, when the request came in via API.
    pub raw_data: Option<String>,
    /// Newline-joined validation failures from the last validate attempt.
    pub validation_errors: Option<String>,
    pub processing_notes: Option<String>,
    pub instance_id: Option<String>,
    pub customer_id: Option<String>,
    pub archived: bool,
    pub created_at: String,
    pub updated_at: String,
    pub submitted_at: Option<String>,
    pub validated_at: Option<String>,
    pub processing_started_at: Option<String>,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InstanceRow {
    pub id: String,
    pub name: String,
    pub subdomain: String,
    pub database_name: String,
    pub plan_code: String,
    pub app_version: String,
    pub admin_email: String,
    pub admin_password: String,
    pub company_name: String,
    pub state: String,
    pub container_id: Option<String>,
    /// Host port published for this instance.
    pub port: i64,
    pub ssl_enabled: bool,
    pub cpu_limit: f64,
    pub memory_limit_mb: i64,
    pub storage_limit_gb: i64,
    pub cpu_usage: Option<f64>,
    pub memory_usage: Option<f64>,
    pub storage_usage: Option<f64>,
    pub last_activity: Option<String>,
    pub backup_enabled: bool,
    /// daily | weekly | monthly
    pub backup_frequency: String,
    pub last_backup: Option<String>,
    /// Due time of the next backup; set at activation and after each backup.
    pub next_backup: Option<String>,
    pub customer_id: Option<String>,
    pub request_id: Option<String>,
    pub provisioned_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PlanRow {
    pub code: String,
    pub name: String,
    pub description: Option<String>,
    pub plan_type: String,
    pub monthly_price: f64,
    pub currency: String,
    pub max_users: i64,
    pub storage_limit_gb: i64,
    /// JSON array of module technical names.
    pub included_modules: String,
    pub active: bool,
    pub sequence: i64,
}

impl PlanRow {
    /// Parse the JSON module list; malformed data yields an empty list.
    pub fn modules(&self) -> Vec<String> {
        serde_json::from_str(&self.included_modules).unwrap_or_default()
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CustomerRow {
    pub id: String,
    pub company_name: String,
    pub contact_name: String,
    pub contact_email: String,
    pub contact_phone: Option<String>,
    pub state: String,
    pub instance_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

// ─── Insert payloads ──────────────────────────────────────────────────────────

/// Fields for a new request row. The storage layer assigns the row id and
/// created/updated timestamps.
#[derive(Debug, Clone)]
pub struct NewRequest {
    pub request_id: String,
    pub source: String,
    pub customer_email: String,
    pub customer_name: String,
    pub customer_phone: Option<String>,
    pub company_name: String,
    pub plan_code: String,
    pub subdomain: String,
    pub database_name: String,
    pub admin_email: String,
    pub admin_password: String,
    pub priority: String,
    pub state: String,
    pub raw_data: Option<String>,
    pub submitted_at: Option<String>,
}

/// Fields for a new instance row. The host port is allocated inside the
/// insert transaction; the partial unique indexes reject a subdomain or
/// database name already held by a non-terminated instance.
#[derive(Debug, Clone)]
pub struct NewInstance {
    pub name: String,
    pub subdomain: String,
    pub database_name: String,
    pub plan_code: String,
    pub app_version: String,
    pub admin_email: String,
    pub admin_password: String,
    pub company_name: String,
    pub storage_limit_gb: i64,
    pub customer_id: Option<String>,
    pub request_id: Option<String>,
}

/// True when `err` wraps a SQLite UNIQUE-constraint violation — the losing
/// side of a subdomain / database-name race.
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<sqlx::Error>()
        .and_then(|e| match e {
            sqlx::Error::Database(db) => Some(db.message().contains("UNIQUE constraint failed")),
            _ => None,
        })
        .unwrap_or(false)
}

// ─── Storage ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        Self::new_with_slow_query(data_dir, 0).await
    }

    /// Create storage with slow-query logging enabled.
    ///
    /// `slow_query_ms` is the threshold in milliseconds — queries exceeding it
    /// are logged at WARN level. Set to 0 to disable slow-query logging.
    pub async fn new_with_slow_query(data_dir: &Path, slow_query_ms: u64) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("provisiond.db");
        let mut opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);

        if slow_query_ms > 0 {
            opts = opts.log_slow_statements(
                log::LevelFilter::Warn,
                std::time::Duration::from_millis(slow_query_ms),
            );
        }

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Return a clone of the connection pool (cheap — Arc-backed).
    /// Used to create the LogStore that shares the same SQLite connection.
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        let stmts = [
            "CREATE TABLE IF NOT EXISTS requests (
                id TEXT PRIMARY KEY,
                request_id TEXT NOT NULL UNIQUE,
                source TEXT NOT NULL DEFAULT 'portal',
                customer_email TEXT NOT NULL,
                customer_name TEXT NOT NULL,
                customer_phone TEXT,
                company_name TEXT NOT NULL,
                plan_code TEXT NOT NULL,
                subdomain TEXT NOT NULL,
                database_name TEXT NOT NULL,
                admin_email TEXT NOT NULL,
                admin_password TEXT NOT NULL,
                priority TEXT NOT NULL DEFAULT 'normal',
                state TEXT NOT NULL DEFAULT 'draft',
                raw_data TEXT,
                validation_errors TEXT,
                processing_notes TEXT,
                instance_id TEXT,
                customer_id TEXT,
                archived INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                submitted_at TEXT,
                validated_at TEXT,
                processing_started_at TEXT,
                completed_at TEXT
            )",
            "CREATE INDEX IF NOT EXISTS idx_requests_state ON requests(state)",
            "CREATE TABLE IF NOT EXISTS instances (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                subdomain TEXT NOT NULL,
                database_name TEXT NOT NULL,
                plan_code TEXT NOT NULL,
                app_version TEXT NOT NULL,
                admin_email TEXT NOT NULL,
                admin_password TEXT NOT NULL,
                company_name TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'draft',
                container_id TEXT,
                port INTEGER NOT NULL,
                ssl_enabled INTEGER NOT NULL DEFAULT 1,
                cpu_limit REAL NOT NULL DEFAULT 1.0,
                memory_limit_mb INTEGER NOT NULL DEFAULT 1024,
                storage_limit_gb INTEGER NOT NULL DEFAULT 10,
                cpu_usage REAL,
                memory_usage REAL,
                storage_usage REAL,
                last_activity TEXT,
                backup_enabled INTEGER NOT NULL DEFAULT 1,
                backup_frequency TEXT NOT NULL DEFAULT 'daily',
                last_backup TEXT,
                next_backup TEXT,
                customer_id TEXT,
                request_id TEXT,
                provisioned_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            // Uniqueness among non-terminated instances is enforced here, not
            // by a query-then-write check, so concurrent validations cannot
            // both win the same subdomain.
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_instances_live_subdomain
                 ON instances(subdomain) WHERE state != 'terminated'",
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_instances_live_database
                 ON instances(database_name) WHERE state != 'terminated'",
            "CREATE INDEX IF NOT EXISTS idx_instances_state ON instances(state)",
            "CREATE TABLE IF NOT EXISTS instance_logs (
                id TEXT PRIMARY KEY,
                instance_id TEXT NOT NULL REFERENCES instances(id) ON DELETE CASCADE,
                timestamp TEXT NOT NULL,
                level TEXT NOT NULL DEFAULT 'info',
                message TEXT NOT NULL,
                details TEXT,
                operation TEXT,
                component TEXT,
                error_kind TEXT,
                stack_trace TEXT,
                request_id TEXT
            )",
            "CREATE INDEX IF NOT EXISTS idx_instance_logs_instance_time
                 ON instance_logs(instance_id, timestamp)",
            "CREATE TABLE IF NOT EXISTS plans (
                code TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                plan_type TEXT NOT NULL DEFAULT 'basic',
                monthly_price REAL NOT NULL DEFAULT 0.0,
                currency TEXT NOT NULL DEFAULT 'USD',
                max_users INTEGER NOT NULL DEFAULT 1,
                storage_limit_gb INTEGER NOT NULL DEFAULT 10,
                included_modules TEXT NOT NULL DEFAULT '[]',
                active INTEGER NOT NULL DEFAULT 1,
                sequence INTEGER NOT NULL DEFAULT 10
            )",
            "CREATE TABLE IF NOT EXISTS customers (
                id TEXT PRIMARY KEY,
                company_name TEXT NOT NULL,
                contact_name TEXT NOT NULL,
                contact_email TEXT NOT NULL UNIQUE,
                contact_phone TEXT,
                state TEXT NOT NULL DEFAULT 'active',
                instance_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        ];
        for stmt in stmts {
            sqlx::query(stmt)
                .execute(pool)
                .await
                .context("failed to apply schema")?;
        }
        Ok(())
    }

    // ─── Requests ───────────────────────────────────────────────────────────

    pub async fn create_request(&self, new: NewRequest) -> Result<RequestRow> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        sqlx::query(
            "INSERT INTO requests (id, request_id, source, customer_email, customer_name,
                 customer_phone, company_name, plan_code, subdomain, database_name,
                 admin_email, admin_password, priority, state, raw_data,
                 created_at, updated_at, submitted_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&new.request_id)
        .bind(&new.source)
        .bind(&new.customer_email)
        .bind(&new.customer_name)
        .bind(&new.customer_phone)
        .bind(&new.company_name)
        .bind(&new.plan_code)
        .bind(&new.subdomain)
        .bind(&new.database_name)
        .bind(&new.admin_email)
        .bind(&new.admin_password)
        .bind(&new.priority)
        .bind(&new.state)
        .bind(&new.raw_data)
        .bind(&now)
        .bind(&now)
        .bind(&new.submitted_at)
        .execute(&self.pool)
        .await?;
        self.get_request(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("request not found after insert"))
    }

    pub async fn get_request(&self, id: &str) -> Result<Option<RequestRow>> {
        Ok(sqlx::query_as("SELECT * FROM requests WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn get_request_by_request_id(&self, request_id: &str) -> Result<Option<RequestRow>> {
        Ok(sqlx::query_as("SELECT * FROM requests WHERE request_id = ?")
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn list_requests_by_state(&self, state: &str) -> Result<Vec<RequestRow>> {
        with_timeout(async {
            Ok(sqlx::query_as(
                "SELECT * FROM requests WHERE state = ? AND archived = 0 ORDER BY created_at",
            )
            .bind(state)
            .fetch_all(&self.pool)
            .await?)
        })
        .await
    }

    /// Atomically moves a draft request to `submitted`. Returns `false` when
    /// the request was not in `draft`.
    pub async fn mark_request_submitted(&self, id: &str) -> Result<bool> {
        let now = now_rfc3339();
        let result = sqlx::query(
            "UPDATE requests SET state = 'submitted', submitted_at = ?, updated_at = ?
             WHERE id = ? AND state = 'draft'",
        )
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_request_validated(&self, id: &str) -> Result<()> {
        let now = now_rfc3339();
        sqlx::query(
            "UPDATE requests SET state = 'validated', validated_at = ?, validation_errors = NULL,
                 updated_at = ?
             WHERE id = ?",
        )
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_request_validation_failed(&self, id: &str, errors: &str) -> Result<()> {
        let now = now_rfc3339();
        sqlx::query(
            "UPDATE requests SET state = 'failed', validation_errors = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(errors)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Atomically claims a validated request for processing. Returns `true`
    /// if the claim succeeded, `false` if another sweep already holds it.
    ///
    /// This eliminates the window in which two concurrent sweeps could both
    /// start processing the same request.
    pub async fn claim_request_for_processing(&self, id: &str) -> Result<bool> {
        let now = now_rfc3339();
        let result = sqlx::query(
            "UPDATE requests SET state = 'processing', processing_started_at = ?, updated_at = ?
             WHERE id = ? AND state = 'validated'",
        )
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_request_completed(
        &self,
        id: &str,
        notes: &str,
        instance_id: &str,
        customer_id: &str,
    ) -> Result<()> {
        let now = now_rfc3339();
        sqlx::query(
            "UPDATE requests SET state = 'completed', processing_notes = ?, instance_id = ?,
                 customer_id = ?, completed_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(notes)
        .bind(instance_id)
        .bind(customer_id)
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_request_failed(&self, id: &str, notes: &str) -> Result<()> {
        let now = now_rfc3339();
        sqlx::query(
            "UPDATE requests SET state = 'failed', processing_notes = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(notes)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_request_cancelled(&self, id: &str) -> Result<()> {
        let now = now_rfc3339();
        sqlx::query("UPDATE requests SET state = 'cancelled', updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Atomically resets a failed request to `validated` for a retry.
    /// Returns `false` when the request was not in `failed`.
    pub async fn reset_request_for_retry(&self, id: &str) -> Result<bool> {
        let now = now_rfc3339();
        let result = sqlx::query(
            "UPDATE requests SET state = 'validated', validation_errors = NULL,
                 processing_notes = NULL, updated_at = ?
             WHERE id = ? AND state = 'failed'",
        )
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Archive terminal requests older than `cutoff`. History is kept — the
    /// rows are flagged, not deleted. Returns the number archived.
    pub async fn archive_requests_before(&self, cutoff: &str) -> Result<u64> {
        let now = now_rfc3339();
        let result = sqlx::query(
            "UPDATE requests SET archived = 1, updated_at = ?
             WHERE state IN ('completed', 'failed', 'cancelled')
               AND archived = 0 AND created_at < ?",
        )
        .bind(&now)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // ─── Instances ──────────────────────────────────────────────────────────

    /// Insert a new draft instance, allocating the next free host port inside
    /// the same transaction. Fails with a UNIQUE violation when the subdomain
    /// or database name is already held by a non-terminated instance — use
    /// [`is_unique_violation`] to classify.
    pub async fn create_instance(
        &self,
        new: NewInstance,
        first_instance_port: u16,
    ) -> Result<InstanceRow> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let mut tx = self.pool.begin().await?;

        let max_port: (Option<i64>,) = sqlx::query_as("SELECT MAX(port) FROM instances")
            .fetch_one(&mut *tx)
            .await?;
        let port = max_port
            .0
            .map(|p| p + 1)
            .unwrap_or(first_instance_port as i64);

        sqlx::query(
            "INSERT INTO instances (id, name, subdomain, database_name, plan_code, app_version,
                 admin_email, admin_password, company_name, state, port, storage_limit_gb,
                 customer_id, request_id, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'draft', ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&new.name)
        .bind(&new.subdomain)
        .bind(&new.database_name)
        .bind(&new.plan_code)
        .bind(&new.app_version)
        .bind(&new.admin_email)
        .bind(&new.admin_password)
        .bind(&new.company_name)
        .bind(port)
        .bind(new.storage_limit_gb)
        .bind(&new.customer_id)
        .bind(&new.request_id)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.get_instance(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("instance not found after insert"))
    }

    pub async fn get_instance(&self, id: &str) -> Result<Option<InstanceRow>> {
        Ok(sqlx::query_as("SELECT * FROM instances WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Look up the most recent instance for a subdomain, terminated or not.
    pub async fn get_instance_by_subdomain(&self, subdomain: &str) -> Result<Option<InstanceRow>> {
        Ok(sqlx::query_as(
            "SELECT * FROM instances WHERE subdomain = ? ORDER BY created_at DESC LIMIT 1",
        )
        .bind(subdomain)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// True when a non-terminated instance already holds this subdomain.
    pub async fn subdomain_in_use(&self, subdomain: &str) -> Result<bool> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM instances WHERE subdomain = ? AND state != 'terminated'",
        )
        .bind(subdomain)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0 > 0)
    }

    /// True when a non-terminated instance already holds this database name.
    pub async fn database_name_in_use(&self, database_name: &str) -> Result<bool> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM instances WHERE database_name = ? AND state != 'terminated'",
        )
        .bind(database_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0 > 0)
    }

    pub async fn list_instances_by_state(&self, state: &str) -> Result<Vec<InstanceRow>> {
        with_timeout(async {
            Ok(
                sqlx::query_as("SELECT * FROM instances WHERE state = ? ORDER BY created_at")
                    .bind(state)
                    .fetch_all(&self.pool)
                    .await?,
            )
        })
        .await
    }

    /// Atomically moves a draft instance into `provisioning` so the sweep
    /// picks it up exactly once. Returns `false` when the instance was not
    /// in `draft`.
    pub async fn claim_instance_for_provisioning(&self, id: &str) -> Result<bool> {
        let now = now_rfc3339();
        let result = sqlx::query(
            "UPDATE instances SET state = 'provisioning', updated_at = ?
             WHERE id = ? AND state = 'draft'",
        )
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_instance_state(&self, id: &str, state: &str) -> Result<()> {
        let now = now_rfc3339();
        sqlx::query("UPDATE instances SET state = ?, updated_at = ? WHERE id = ?")
            .bind(state)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_instance_container(&self, id: &str, container_id: &str) -> Result<()> {
        let now = now_rfc3339();
        sqlx::query("UPDATE instances SET container_id = ?, updated_at = ? WHERE id = ?")
            .bind(container_id)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Mark a provisioned instance live: `active`, stamped, and with its
    /// first backup due time set so the backup sweep will pick it up.
    pub async fn mark_instance_active(
        &self,
        id: &str,
        provisioned_at: &str,
        next_backup: Option<&str>,
    ) -> Result<()> {
        let now = now_rfc3339();
        sqlx::query(
            "UPDATE instances SET state = 'active', provisioned_at = ?, next_backup = ?,
                 updated_at = ?
             WHERE id = ?",
        )
        .bind(provisioned_at)
        .bind(next_backup)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_instance_usage(
        &self,
        id: &str,
        cpu_usage: Option<f64>,
        memory_usage: Option<f64>,
    ) -> Result<()> {
        let now = now_rfc3339();
        sqlx::query(
            "UPDATE instances SET cpu_usage = ?, memory_usage = ?, last_activity = ?,
                 updated_at = ?
             WHERE id = ?",
        )
        .bind(cpu_usage)
        .bind(memory_usage)
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_instance_backup(
        &self,
        id: &str,
        last_backup: &str,
        next_backup: &str,
    ) -> Result<()> {
        let now = now_rfc3339();
        sqlx::query(
            "UPDATE instances SET last_backup = ?, next_backup = ?, updated_at = ? WHERE id = ?",
        )
        .bind(last_backup)
        .bind(next_backup)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The backup sweep set: active instances with backups enabled whose
    /// next_backup is due at `now`. Nothing else qualifies.
    pub async fn instances_due_backup(&self, now: &str) -> Result<Vec<InstanceRow>> {
        with_timeout(async {
            Ok(sqlx::query_as(
                "SELECT * FROM instances
                 WHERE state = 'active' AND backup_enabled = 1 AND next_backup <= ?
                 ORDER BY next_backup",
            )
            .bind(now)
            .fetch_all(&self.pool)
            .await?)
        })
        .await
    }

    /// Delete an instance row. Only used for draft instances created by a
    /// request that was cancelled before provisioning began.
    pub async fn delete_instance(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM instances WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn count_instances(&self) -> Result<u64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM instances")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0 as u64)
    }

    // ─── Plans ──────────────────────────────────────────────────────────────

    pub async fn upsert_plan(&self, seed: &crate::config::PlanSeed) -> Result<()> {
        let modules = serde_json::to_string(&seed.modules)?;
        sqlx::query(
            "INSERT INTO plans (code, name, description, plan_type, monthly_price, currency,
                 max_users, storage_limit_gb, included_modules, active, sequence)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?)
             ON CONFLICT(code) DO UPDATE SET
                 name = excluded.name,
                 description = excluded.description,
                 plan_type = excluded.plan_type,
                 monthly_price = excluded.monthly_price,
                 currency = excluded.currency,
                 max_users = excluded.max_users,
                 storage_limit_gb = excluded.storage_limit_gb,
                 included_modules = excluded.included_modules,
                 active = 1,
                 sequence = excluded.sequence",
        )
        .bind(&seed.code)
        .bind(&seed.name)
        .bind(&seed.description)
        .bind(&seed.plan_type)
        .bind(seed.monthly_price)
        .bind(&seed.currency)
        .bind(seed.max_users)
        .bind(seed.storage_limit_gb)
        .bind(&modules)
        .bind(seed.sequence)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_plan(&self, code: &str) -> Result<Option<PlanRow>> {
        Ok(sqlx::query_as("SELECT * FROM plans WHERE code = ?")
            .bind(code)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn list_active_plans(&self) -> Result<Vec<PlanRow>> {
        with_timeout(async {
            Ok(
                sqlx::query_as("SELECT * FROM plans WHERE active = 1 ORDER BY sequence, name")
                    .fetch_all(&self.pool)
                    .await?,
            )
        })
        .await
    }

    // ─── Customers ──────────────────────────────────────────────────────────

    pub async fn find_customer_by_email(&self, email: &str) -> Result<Option<CustomerRow>> {
        Ok(sqlx::query_as("SELECT * FROM customers WHERE contact_email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn create_customer(
        &self,
        company_name: &str,
        contact_name: &str,
        contact_email: &str,
        contact_phone: Option<&str>,
    ) -> Result<CustomerRow> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        sqlx::query(
            "INSERT INTO customers (id, company_name, contact_name, contact_email, contact_phone,
                 state, instance_count, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, 'active', 0, ?, ?)",
        )
        .bind(&id)
        .bind(company_name)
        .bind(contact_name)
        .bind(contact_email)
        .bind(contact_phone)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        sqlx::query_as("SELECT * FROM customers WHERE id = ?")
            .bind(&id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| anyhow::anyhow!("customer not found after insert"))
    }

    pub async fn increment_customer_instances(&self, id: &str) -> Result<()> {
        let now = now_rfc3339();
        sqlx::query(
            "UPDATE customers SET instance_count = instance_count + 1, updated_at = ?
             WHERE id = ?",
        )
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_storage() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path()).await.unwrap();
        (dir, storage)
    }

    fn new_instance(subdomain: &str, database_name: &str) -> NewInstance {
        NewInstance {
            name: format!("{subdomain} - Basic"),
            subdomain: subdomain.to_string(),
            database_name: database_name.to_string(),
            plan_code: "basic".to_string(),
            app_version: "17.0".to_string(),
            admin_email: "admin@example.com".to_string(),
            admin_password: "pw".to_string(),
            company_name: "Acme".to_string(),
            storage_limit_gb: 10,
            customer_id: None,
            request_id: None,
        }
    }

    #[tokio::test]
    async fn ports_are_allocated_sequentially_from_base() {
        let (_dir, storage) = test_storage().await;
        let a = storage
            .create_instance(new_instance("acme", "acme"), 8070)
            .await
            .unwrap();
        let b = storage
            .create_instance(new_instance("globex", "globex"), 8070)
            .await
            .unwrap();
        assert_eq!(a.port, 8070);
        assert_eq!(b.port, 8071);
    }

    #[tokio::test]
    async fn live_subdomain_is_unique_but_terminated_is_reusable() {
        let (_dir, storage) = test_storage().await;
        let a = storage
            .create_instance(new_instance("acme", "acme"), 8070)
            .await
            .unwrap();

        let err = storage
            .create_instance(new_instance("acme", "acme2"), 8070)
            .await
            .unwrap_err();
        assert!(is_unique_violation(&err));

        storage.set_instance_state(&a.id, "terminated").await.unwrap();
        storage
            .create_instance(new_instance("acme", "acme2"), 8070)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn processing_claim_succeeds_exactly_once() {
        let (_dir, storage) = test_storage().await;
        let req = storage
            .create_request(NewRequest {
                request_id: "REQ-1".to_string(),
                source: "api".to_string(),
                customer_email: "a@b.co".to_string(),
                customer_name: "A".to_string(),
                customer_phone: None,
                company_name: "Acme".to_string(),
                plan_code: "basic".to_string(),
                subdomain: "acme".to_string(),
                database_name: "acme".to_string(),
                admin_email: "a@b.co".to_string(),
                admin_password: "pw".to_string(),
                priority: "normal".to_string(),
                state: "submitted".to_string(),
                raw_data: None,
                submitted_at: Some(now_rfc3339()),
            })
            .await
            .unwrap();

        storage.mark_request_validated(&req.id).await.unwrap();
        assert!(storage.claim_request_for_processing(&req.id).await.unwrap());
        assert!(!storage.claim_request_for_processing(&req.id).await.unwrap());
    }

    #[tokio::test]
    async fn backup_due_set_is_active_enabled_and_due() {
        let (_dir, storage) = test_storage().await;
        let due = storage
            .create_instance(new_instance("due", "due"), 8070)
            .await
            .unwrap();
        let future = storage
            .create_instance(new_instance("future", "future"), 8070)
            .await
            .unwrap();
        let suspended = storage
            .create_instance(new_instance("susp", "susp"), 8070)
            .await
            .unwrap();

        let past = days_ago_rfc3339(1);
        let ahead = (Utc::now() + chrono::Duration::days(1))
            .to_rfc3339_opts(SecondsFormat::Micros, true);

        storage
            .mark_instance_active(&due.id, &now_rfc3339(), Some(&past))
            .await
            .unwrap();
        storage
            .mark_instance_active(&future.id, &now_rfc3339(), Some(&ahead))
            .await
            .unwrap();
        storage
            .mark_instance_active(&suspended.id, &now_rfc3339(), Some(&past))
            .await
            .unwrap();
        storage
            .set_instance_state(&suspended.id, "suspended")
            .await
            .unwrap();

        let due_set = storage.instances_due_backup(&now_rfc3339()).await.unwrap();
        let ids: Vec<&str> = due_set.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec![due.id.as_str()]);
    }

    #[tokio::test]
    async fn archive_only_touches_old_terminal_requests() {
        let (_dir, storage) = test_storage().await;
        let req = storage
            .create_request(NewRequest {
                request_id: "REQ-2".to_string(),
                source: "portal".to_string(),
                customer_email: "a@b.co".to_string(),
                customer_name: "A".to_string(),
                customer_phone: None,
                company_name: "Acme".to_string(),
                plan_code: "basic".to_string(),
                subdomain: "acme".to_string(),
                database_name: "acme".to_string(),
                admin_email: "a@b.co".to_string(),
                admin_password: "pw".to_string(),
                priority: "normal".to_string(),
                state: "submitted".to_string(),
                raw_data: None,
                submitted_at: None,
            })
            .await
            .unwrap();

        // Still in-flight: not archived even with a future cutoff.
        let cutoff = (Utc::now() + chrono::Duration::days(1))
            .to_rfc3339_opts(SecondsFormat::Micros, true);
        assert_eq!(storage.archive_requests_before(&cutoff).await.unwrap(), 0);

        storage.mark_request_cancelled(&req.id).await.unwrap();
        assert_eq!(storage.archive_requests_before(&cutoff).await.unwrap(), 1);
        // Idempotent: already archived rows are not counted again.
        assert_eq!(storage.archive_requests_before(&cutoff).await.unwrap(), 0);
    }
}
