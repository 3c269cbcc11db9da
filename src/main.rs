use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use provisiond::{
    config::{ConfigWatcher, ProvisionerConfig},
    jobs,
    logstore::LogStore,
    provision::{
        database::{DatabaseServer, PostgresCli},
        rpc::{InstanceRpc, JsonRpcClient},
        runtime::{ContainerRuntime, DockerCli},
        Provisioner,
    },
    rest,
    storage::Storage,
    AppContext,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Hard ceiling for individual docker CLI invocations.
const DOCKER_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Parser)]
#[command(
    name = "provisiond",
    about = "Tenant provisioning daemon — database, container, and lifecycle orchestration",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// REST API port
    #[arg(long, env = "PROVISIOND_PORT")]
    port: Option<u16>,

    /// Data directory for config, backups, and the SQLite database
    #[arg(long, env = "PROVISIOND_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "PROVISIOND_LOG")]
    log: Option<String>,

    /// Bind address for the REST API (default: 127.0.0.1; use 0.0.0.0 for LAN access)
    #[arg(long, env = "PROVISIOND_BIND")]
    bind_address: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "PROVISIOND_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon server (default when no subcommand given).
    ///
    /// Runs provisiond in the foreground: REST API plus the background
    /// provisioning, backup, monitoring, and cleanup sweeps.
    ///
    /// Examples:
    ///   provisiond serve
    ///   provisiond
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = Args::parse();
    match args.command.take().unwrap_or(Command::Serve) {
        Command::Serve => serve(args).await,
    }
}

type ReloadHandle =
    tracing_subscriber::reload::Handle<EnvFilter, tracing_subscriber::registry::Registry>;

/// Initialise tracing with a reloadable env-filter so the log level can be
/// changed from config.toml without a restart. Returns the appender guard
/// (kept alive for the process lifetime) and the filter reload handle.
fn init_tracing(
    config: &ProvisionerConfig,
    log_file: Option<&Path>,
) -> Result<(Option<tracing_appender::non_blocking::WorkerGuard>, ReloadHandle)> {
    let filter =
        EnvFilter::try_new(&config.log).unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, reload_handle) = tracing_subscriber::reload::Layer::new(filter);
    let registry = tracing_subscriber::registry().with(filter_layer);
    let json = config.log_format == "json";

    let mut guard = None;
    match log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .map(|f| f.to_string_lossy().to_string())
                .unwrap_or_else(|| "provisiond.log".to_string());
            let appender = tracing_appender::rolling::daily(dir, file_name);
            let (writer, g) = tracing_appender::non_blocking(appender);
            guard = Some(g);
            if json {
                registry
                    .with(
                        tracing_subscriber::fmt::layer()
                            .json()
                            .with_writer(writer)
                            .with_ansi(false),
                    )
                    .init();
            } else {
                registry
                    .with(
                        tracing_subscriber::fmt::layer()
                            .with_writer(writer)
                            .with_ansi(false),
                    )
                    .init();
            }
        }
        None => {
            if json {
                registry.with(tracing_subscriber::fmt::layer().json()).init();
            } else {
                registry.with(tracing_subscriber::fmt::layer()).init();
            }
        }
    }

    Ok((guard, reload_handle))
}

async fn serve(args: Args) -> Result<()> {
    let config = Arc::new(ProvisionerConfig::new(
        args.port,
        args.data_dir,
        args.log,
        args.bind_address,
    ));
    let (_log_guard, reload_handle) = init_tracing(&config, args.log_file.as_deref())?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %config.data_dir.display(),
        "provisiond starting"
    );

    let storage = Arc::new(
        Storage::new_with_slow_query(
            &config.data_dir,
            config.observability.slow_query_threshold_ms,
        )
        .await
        .context("failed to open storage")?,
    );
    let logs = Arc::new(LogStore::new(storage.pool()));

    // Seed reference plans from config.toml ([[plan]] entries).
    for seed in &config.plans {
        storage
            .upsert_plan(seed)
            .await
            .with_context(|| format!("failed to seed plan {}", seed.code))?;
    }
    if storage.list_active_plans().await?.is_empty() {
        warn!("no active plans configured — signup requests will fail validation");
    }

    let db: Arc<dyn DatabaseServer> = Arc::new(PostgresCli::new(
        config.database.clone(),
        Duration::from_secs(config.provisioning.db_command_timeout_secs),
    ));
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerCli::new(DOCKER_COMMAND_TIMEOUT));
    let rpc: Arc<dyn InstanceRpc> = Arc::new(JsonRpcClient::new(
        Duration::from_secs(config.provisioning.readiness_interval_secs),
        Duration::from_secs(config.provisioning.readiness_timeout_secs),
    )?);
    let provisioner = Arc::new(Provisioner::new(
        storage.clone(),
        logs.clone(),
        db,
        runtime,
        rpc,
        config.clone(),
    ));

    let reload = reload_handle.clone();
    let _config_watcher = ConfigWatcher::start(&config.data_dir, move |level| {
        match EnvFilter::try_new(level) {
            Ok(filter) => {
                if let Err(e) = reload.reload(filter) {
                    warn!(err = %e, "failed to apply reloaded log filter");
                }
            }
            Err(e) => warn!(err = %e, level, "invalid log filter in config.toml"),
        }
    });

    let ctx = Arc::new(AppContext {
        config: config.clone(),
        storage,
        logs,
        provisioner,
        hot: _config_watcher.as_ref().map(|w| w.hot.clone()),
        started_at: std::time::Instant::now(),
    });

    let _sweeps = jobs::spawn_all(ctx.clone());
    rest::serve(ctx).await
}
