pub mod access;
pub mod cache;
pub mod colors;
pub mod config;
pub mod db;
pub mod errors;
pub mod formatting;
pub mod models;
pub mod pivot;
pub mod service;
pub mod staging;
pub mod warehouse;

use crate::cache::CacheCoordinator;
use crate::config::DashboardConfig;
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::service::DashboardService;
use crate::staging::FileStagingStore;
use crate::warehouse::{JsonExtractWarehouse, UnconfiguredWarehouse, Warehouse};
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Wires the stores, the cache coordinator and the service from one config.
pub fn bootstrap(config: &DashboardConfig) -> AppResult<DashboardService> {
    std::fs::create_dir_all(&config.data_dir)?;
    let db = Arc::new(Database::new(&config.database_path())?);

    let warehouse: Arc<dyn Warehouse> = match &config.warehouse_extract_path {
        Some(path) => Arc::new(JsonExtractWarehouse::new(path)),
        None => Arc::new(UnconfiguredWarehouse),
    };
    let staging = Arc::new(FileStagingStore::new(config.staging_dir()));
    let cache = Arc::new(CacheCoordinator::new(db, warehouse, staging, config.refresh_timeout()));

    tracing::info!(
        data_dir = %config.data_dir.display(),
        dashboards = config.dashboards.len(),
        users = config.users.len(),
        "dashboard service ready"
    );
    Ok(DashboardService::new(config, cache))
}

/// Runs both refresh stages every `every`, starting one period from now.
pub fn spawn_auto_refresh(cache: Arc<CacheCoordinator>, every: std::time::Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let outcome = cache.refresh_all().await;
            if outcome.success {
                tracing::info!(message = %outcome.message, "scheduled refresh completed");
            } else {
                tracing::warn!(message = %outcome.message, "scheduled refresh failed");
            }
        }
    })
}

/// Loads configuration, refreshes the cache once, prints the dashboard hub
/// and, when auto-refresh is configured, keeps refreshing until Ctrl-C.
pub async fn run(config_path: Option<&Path>) -> AppResult<()> {
    let config = DashboardConfig::load(config_path)?;
    init_tracing(&config.log_dir())?;

    let service = bootstrap(&config)?;
    let outcome = service.cache().refresh_all().await;
    if outcome.success {
        tracing::info!(message = %outcome.message, "startup refresh completed");
    } else {
        tracing::warn!(message = %outcome.message, "startup refresh failed; serving existing local data");
    }

    let root = service
        .users()
        .current_user(&config.root_admin)
        .ok_or_else(|| AppError::NotFound(format!("root admin '{}' is not configured", config.root_admin)))?;
    let hub = service.dashboard_hub(Some(&root));
    println!("{}", serde_json::to_string_pretty(&hub)?);

    let Some(every) = config.auto_refresh_interval() else {
        return Ok(());
    };
    let refresher = spawn_auto_refresh(Arc::clone(service.cache()), every);
    tracing::info!(minutes = every.as_secs() / 60, "auto refresh enabled");

    tokio::signal::ctrl_c().await?;
    refresher.abort();
    tracing::info!("shutting down");
    Ok(())
}

fn init_tracing(log_dir: &Path) -> AppResult<()> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "dashboard.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| AppError::Internal(error.to_string()))
}
