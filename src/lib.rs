pub mod config;
pub mod error;
pub mod health;
pub mod instance;
pub mod jobs;
pub mod logstore;
pub mod provision;
pub mod request;
pub mod rest;
pub mod storage;

use std::sync::Arc;

use config::{HotConfig, ProvisionerConfig};
use logstore::LogStore;
use provision::Provisioner;
use storage::Storage;

/// Shared application state passed to every route handler and background
/// sweep.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<ProvisionerConfig>,
    pub storage: Arc<Storage>,
    pub logs: Arc<LogStore>,
    pub provisioner: Arc<Provisioner>,
    /// Hot-reloaded config subset; `None` when the config watcher is not
    /// running (tests, watcher startup failure).
    pub hot: Option<Arc<tokio::sync::RwLock<HotConfig>>>,
    pub started_at: std::time::Instant,
}
