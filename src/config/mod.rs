use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

const DEFAULT_PORT: u16 = 8640;
const DEFAULT_BASE_DOMAIN: &str = "apps.example.com";
const DEFAULT_APP_IMAGE: &str = "odoo";
const DEFAULT_APP_VERSION: &str = "17.0";
const DEFAULT_FIRST_INSTANCE_PORT: u16 = 8070;
const DEFAULT_LOG_RETENTION_DAYS: u32 = 30;
const DEFAULT_REQUEST_RETENTION_DAYS: u32 = 30;

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

// ─── DatabaseConfig ───────────────────────────────────────────────────────────

/// Connection settings for the PostgreSQL server that hosts tenant databases
/// (`[database]` in config.toml). `PGHOST` / `PGPORT` / `PGUSER` /
/// `PGPASSWORD` environment variables override the file.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    /// None = rely on peer auth / .pgpass.
    pub password: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "odoo".to_string(),
            password: None,
        }
    }
}

// ─── ProvisioningConfig ───────────────────────────────────────────────────────

/// Executor tuning (`[provisioning]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Fixed interval between readiness probes (seconds). Default: 3.
    pub readiness_interval_secs: u64,
    /// Hard ceiling on the readiness wait (seconds). Default: 240.
    pub readiness_timeout_secs: u64,
    /// Timeout for database create/drop/dump subprocesses (seconds). Default: 300.
    pub db_command_timeout_secs: u64,
    /// Docker network the instance containers join. None = runtime default.
    pub container_network: Option<String>,
    /// Path inside the container where app data lives. Default: /var/lib/odoo.
    pub app_data_mount: String,
    /// Port the application listens on inside the container. Default: 8069.
    pub app_internal_port: u16,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            readiness_interval_secs: 3,
            readiness_timeout_secs: 240,
            db_command_timeout_secs: 300,
            container_network: None,
            app_data_mount: "/var/lib/odoo".to_string(),
            app_internal_port: 8069,
        }
    }
}

// ─── JobsConfig ───────────────────────────────────────────────────────────────

/// Background sweep intervals in seconds (`[jobs]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Validate submitted requests and process validated ones. Default: 60.
    pub request_sweep_secs: u64,
    /// Run the executor over instances in `provisioning`. Default: 30.
    pub provision_sweep_secs: u64,
    /// Back up active instances whose next_backup is due. Default: 3600.
    pub backup_sweep_secs: u64,
    /// Refresh container resource usage for active instances. Default: 300.
    pub monitor_sweep_secs: u64,
    /// Archive old requests and delete old debug/info logs. Default: 86400.
    pub cleanup_sweep_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            request_sweep_secs: 60,
            provision_sweep_secs: 30,
            backup_sweep_secs: 3600,
            monitor_sweep_secs: 300,
            cleanup_sweep_secs: 86_400,
        }
    }
}

// ─── ObservabilityConfig ──────────────────────────────────────────────────────

/// Daemon observability configuration (`[observability]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log SQLite queries that exceed this threshold (milliseconds). Default: 100.
    /// Set to 0 to disable slow query logging.
    pub slow_query_threshold_ms: u64,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            slow_query_threshold_ms: 100,
        }
    }
}

// ─── Plan seeds ───────────────────────────────────────────────────────────────

/// One `[[plan]]` entry in config.toml. Upserted into the plans table at
/// startup — the daemon consumes plans, it does not manage them.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlanSeed {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// free | basic | standard | premium | enterprise | custom. Default: basic.
    #[serde(default = "PlanSeed::default_plan_type")]
    pub plan_type: String,
    #[serde(default)]
    pub monthly_price: f64,
    #[serde(default = "PlanSeed::default_currency")]
    pub currency: String,
    #[serde(default = "PlanSeed::default_max_users")]
    pub max_users: i64,
    #[serde(default = "PlanSeed::default_storage_limit_gb")]
    pub storage_limit_gb: i64,
    /// Technical names of the modules installed on provisioned instances.
    #[serde(default)]
    pub modules: Vec<String>,
    #[serde(default = "PlanSeed::default_sequence")]
    pub sequence: i64,
}

impl PlanSeed {
    fn default_plan_type() -> String {
        "basic".to_string()
    }
    fn default_currency() -> String {
        "USD".to_string()
    }
    fn default_max_users() -> i64 {
        1
    }
    fn default_storage_limit_gb() -> i64 {
        10
    }
    fn default_sequence() -> i64 {
        10
    }
}

// ─── TOML config file ─────────────────────────────────────────────────────────

/// `{data_dir}/config.toml` — all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// REST API port (default: 8640).
    port: Option<u16>,
    /// Bind address (default: "127.0.0.1"; use "0.0.0.0" for LAN access).
    bind_address: Option<String>,
    /// Log level filter string, e.g. "debug", "info,provisiond=trace".
    log: Option<String>,
    /// Log output format: "pretty" (default) | "json".
    log_format: Option<String>,
    /// Domain instances are served under: {subdomain}.{base_domain}.
    base_domain: Option<String>,
    /// Container image (without tag) deployed per instance.
    app_image: Option<String>,
    /// Image tag / application version deployed per instance.
    app_version: Option<String>,
    /// First host port handed to an instance (default: 8070).
    first_instance_port: Option<u16>,
    /// Days before old debug/info log entries are deleted (0 = never).
    log_retention_days: Option<u32>,
    /// Days before terminal requests are archived (0 = never).
    request_retention_days: Option<u32>,
    /// Tenant database server connection (`[database]`).
    database: Option<DatabaseConfig>,
    /// Executor tuning (`[provisioning]`).
    provisioning: Option<ProvisioningConfig>,
    /// Background sweep intervals (`[jobs]`).
    jobs: Option<JobsConfig>,
    /// Observability configuration (`[observability]`).
    observability: Option<ObservabilityConfig>,
    /// Plan seeds (`[[plan]]`).
    plan: Option<Vec<PlanSeed>>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

// ─── ProvisionerConfig ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    pub port: u16,
    pub bind_address: String,
    pub data_dir: PathBuf,
    pub log: String,
    /// "pretty" (default) | "json" (structured for log aggregators).
    pub log_format: String,
    /// Instances resolve as https://{subdomain}.{base_domain}.
    pub base_domain: String,
    pub app_image: String,
    pub app_version: String,
    pub first_instance_port: u16,
    /// Days before old debug/info log entries are deleted (0 = never).
    pub log_retention_days: u32,
    /// Days before terminal requests are archived (0 = never).
    pub request_retention_days: u32,
    pub database: DatabaseConfig,
    pub provisioning: ProvisioningConfig,
    pub jobs: JobsConfig,
    pub observability: ObservabilityConfig,
    pub plans: Vec<PlanSeed>,
}

impl ProvisionerConfig {
    /// Build config from CLI/env args + optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env — passed as `Some(value)` from clap
    ///   2. TOML file at `{data_dir}/config.toml`
    ///   3. Built-in defaults
    pub fn new(
        port: Option<u16>,
        data_dir: Option<PathBuf>,
        log: Option<String>,
        bind_address: Option<String>,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);

        // Load TOML as the lowest-priority override layer
        let toml = load_toml(&data_dir).unwrap_or_default();

        let port = port.or(toml.port).unwrap_or(DEFAULT_PORT);
        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());

        let bind_address = bind_address
            .or(std::env::var("PROVISIOND_BIND")
                .ok()
                .filter(|s| !s.is_empty()))
            .or(toml.bind_address)
            .unwrap_or_else(default_bind_address);

        let log_format = std::env::var("PROVISIOND_LOG_FORMAT")
            .ok()
            .filter(|s| !s.is_empty())
            .or(toml.log_format)
            .unwrap_or_else(|| "pretty".to_string());

        let base_domain = std::env::var("PROVISIOND_BASE_DOMAIN")
            .ok()
            .filter(|s| !s.is_empty())
            .or(toml.base_domain)
            .unwrap_or_else(|| DEFAULT_BASE_DOMAIN.to_string());

        let app_image = toml
            .app_image
            .unwrap_or_else(|| DEFAULT_APP_IMAGE.to_string());
        let app_version = toml
            .app_version
            .unwrap_or_else(|| DEFAULT_APP_VERSION.to_string());
        let first_instance_port = toml
            .first_instance_port
            .unwrap_or(DEFAULT_FIRST_INSTANCE_PORT);

        let log_retention_days = toml
            .log_retention_days
            .unwrap_or(DEFAULT_LOG_RETENTION_DAYS);
        let request_retention_days = toml
            .request_retention_days
            .unwrap_or(DEFAULT_REQUEST_RETENTION_DAYS);

        // The standard PG* environment overrides win over the [database]
        // section, matching how the psql/pg_dump subprocesses resolve them.
        let mut database = toml.database.unwrap_or_default();
        if let Ok(host) = std::env::var("PGHOST") {
            if !host.is_empty() {
                database.host = host;
            }
        }
        if let Some(pg_port) = std::env::var("PGPORT")
            .ok()
            .and_then(|p| p.parse::<u16>().ok())
        {
            database.port = pg_port;
        }
        if let Ok(user) = std::env::var("PGUSER") {
            if !user.is_empty() {
                database.user = user;
            }
        }
        if let Ok(pw) = std::env::var("PGPASSWORD") {
            if !pw.is_empty() {
                database.password = Some(pw);
            }
        }

        let provisioning = toml.provisioning.unwrap_or_default();
        let jobs = toml.jobs.unwrap_or_default();
        let observability = toml.observability.unwrap_or_default();
        let plans = toml.plan.unwrap_or_default();

        Self {
            port,
            bind_address,
            data_dir,
            log,
            log_format,
            base_domain,
            app_image,
            app_version,
            first_instance_port,
            log_retention_days,
            request_retention_days,
            database,
            provisioning,
            jobs,
            observability,
            plans,
        }
    }
}

// ─── Hot-reloadable config subset ─────────────────────────────────────────────

/// Non-critical config fields that can be changed without restarting.
#[derive(Debug, Clone)]
pub struct HotConfig {
    pub log_level: String,
    pub log_retention_days: u32,
    pub request_retention_days: u32,
}

/// Watches `config.toml` for changes and reloads non-critical fields.
///
/// Uses the `notify` crate (inotify on Linux, kqueue on macOS). Only the log
/// level and the two retention windows are reloaded; port, bind address, and
/// the other startup-only fields require a full restart.
pub struct ConfigWatcher {
    pub hot: Arc<RwLock<HotConfig>>,
    // Hold the watcher alive; dropping it stops the file watch.
    _watcher: notify_debouncer_full::Debouncer<
        notify_debouncer_full::notify::RecommendedWatcher,
        notify_debouncer_full::FileIdMap,
    >,
}

impl ConfigWatcher {
    /// Start watching `{data_dir}/config.toml` for changes.
    ///
    /// `on_log_level` is invoked with the new filter string whenever it
    /// changes (the caller owns the tracing reload handle). Returns `None`
    /// if the watcher could not be created — non-fatal, the daemon runs
    /// fine without hot-reload.
    pub fn start(
        data_dir: &Path,
        on_log_level: impl Fn(&str) + Send + Sync + 'static,
    ) -> Option<Self> {
        let config_path = data_dir.join("config.toml");
        let initial = load_hot_config(&config_path);
        let hot = Arc::new(RwLock::new(initial));

        let hot_clone = hot.clone();
        let config_path_clone = config_path.clone();
        let rt_handle = tokio::runtime::Handle::current();
        let on_log_level = Arc::new(on_log_level);

        let watcher = notify_debouncer_full::new_debouncer(
            std::time::Duration::from_secs(2),
            None,
            move |result: notify_debouncer_full::DebounceEventResult| {
                if let Ok(events) = result {
                    // Only act on modify/create events
                    let relevant = events.iter().any(|e| {
                        use notify_debouncer_full::notify::EventKind;
                        matches!(e.event.kind, EventKind::Modify(_) | EventKind::Create(_))
                    });
                    if relevant {
                        let hot = hot_clone.clone();
                        let path = config_path_clone.clone();
                        let on_log_level = on_log_level.clone();
                        rt_handle.spawn(async move {
                            let new_config = load_hot_config(&path);
                            let mut guard = hot.write().await;
                            if guard.log_level != new_config.log_level
                                || guard.log_retention_days != new_config.log_retention_days
                                || guard.request_retention_days
                                    != new_config.request_retention_days
                            {
                                info!(
                                    log_level = %new_config.log_level,
                                    log_retention_days = new_config.log_retention_days,
                                    request_retention_days = new_config.request_retention_days,
                                    "config.toml reloaded"
                                );
                                if guard.log_level != new_config.log_level {
                                    on_log_level(&new_config.log_level);
                                }
                                *guard = new_config;
                            }
                        });
                    }
                }
            },
        );

        match watcher {
            Ok(mut debouncer) => {
                use notify_debouncer_full::notify::Watcher as _;
                // Watch the data_dir (parent of config.toml) since watching a
                // non-existent file fails on some platforms.
                let watch_path = config_path.parent().unwrap_or_else(|| Path::new("."));
                if let Err(e) = debouncer.watcher().watch(
                    watch_path,
                    notify_debouncer_full::notify::RecursiveMode::NonRecursive,
                ) {
                    warn!("config watcher failed to start: {e} — hot-reload disabled");
                    return None;
                }
                info!(path = %config_path.display(), "config hot-reload watcher started");
                Some(Self {
                    hot,
                    _watcher: debouncer,
                })
            }
            Err(e) => {
                warn!("config watcher creation failed: {e} — hot-reload disabled");
                None
            }
        }
    }
}

/// Load only the hot-reloadable fields from config.toml.
fn load_hot_config(path: &Path) -> HotConfig {
    let toml = std::fs::read_to_string(path)
        .ok()
        .and_then(|s| toml::from_str::<TomlConfig>(&s).ok())
        .unwrap_or_default();
    HotConfig {
        log_level: toml.log.unwrap_or_else(|| "info".to_string()),
        log_retention_days: toml
            .log_retention_days
            .unwrap_or(DEFAULT_LOG_RETENTION_DAYS),
        request_retention_days: toml
            .request_retention_days
            .unwrap_or(DEFAULT_REQUEST_RETENTION_DAYS),
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        // ~/Library/Application Support/provisiond
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("provisiond");
        }
    }
    #[cfg(target_os = "linux")]
    {
        // $XDG_DATA_HOME/provisiond or ~/.local/share/provisiond
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("provisiond");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("provisiond");
        }
    }
    #[cfg(target_os = "windows")]
    {
        // %APPDATA%\provisiond
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("provisiond");
        }
    }
    // Fallback
    PathBuf::from(".provisiond")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_toml() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ProvisionerConfig::new(None, Some(dir.path().to_path_buf()), None, None);
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.first_instance_port, 8070);
        assert_eq!(cfg.provisioning.readiness_interval_secs, 3);
        assert_eq!(cfg.provisioning.readiness_timeout_secs, 240);
        assert_eq!(cfg.jobs.provision_sweep_secs, 30);
        assert!(cfg.plans.is_empty());
    }

    #[test]
    fn toml_overrides_defaults_and_cli_overrides_toml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            r#"
port = 9000
base_domain = "tenants.example.org"

[database]
host = "db"

[[plan]]
code = "basic"
name = "Basic"
modules = ["crm", "sale"]
"#,
        )
        .unwrap();

        let cfg = ProvisionerConfig::new(None, Some(dir.path().to_path_buf()), None, None);
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.base_domain, "tenants.example.org");
        assert_eq!(cfg.plans.len(), 1);
        assert_eq!(cfg.plans[0].modules, vec!["crm", "sale"]);

        let cfg = ProvisionerConfig::new(Some(9100), Some(dir.path().to_path_buf()), None, None);
        assert_eq!(cfg.port, 9100);
    }
}
