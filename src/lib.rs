//! Authenticator - TOTP account store with server sync
//!
//! - `db`: local account store (SQLite) with soft delete and sync bookkeeping
//! - `vault`: optional secret mirror behind [`vault::SecretVault`]
//! - `sync`: merge engine, Casdoor client, orchestrator, history, scheduler
//! - `config`: environment-driven settings

pub mod config;
pub mod db;
pub mod sync;
pub mod vault;

use config::{AppConfig, ConfigError};
use db::{Database, DbError};
use std::sync::Arc;
use std::time::Duration;
use sync::{
    BackgroundScheduler, SchedulerError, SyncApiClient, SyncApiError, SyncConfig, SyncManager,
    SyncOutcome,
};

const DEVICE_ID_KEY: &str = "device_id";

/// Startup errors
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Sync client error: {0}")]
    Client(#[from] SyncApiError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared application handles, built once at startup
pub struct AppContext {
    db: Arc<Database>,
    api_client: Arc<SyncApiClient>,
    sync_manager: SyncManager,
    background_scheduler: BackgroundScheduler,
    interval_override: Option<u64>,
}

impl AppContext {
    /// Open the database and wire the sync stack for `config`
    pub async fn new(config: &AppConfig) -> Result<Self, AppError> {
        std::fs::create_dir_all(&config.data_dir)?;

        let db_path = config.database_path();
        log::info!("Database path: {:?}", db_path);
        let db = Arc::new(Database::new(db_path)?);

        // Device identity outlives individual runs
        let device_id: String = match db.get_setting(DEVICE_ID_KEY)? {
            Some(id) => id,
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                db.set_setting(DEVICE_ID_KEY, &id)?;
                id
            }
        };
        let sync_config = SyncConfig { device_id, ..config.sync.clone() };

        let api_client = Arc::new(SyncApiClient::new(
            config.server.clone(),
            Duration::from_secs(sync_config.request_timeout_secs),
        )?);

        if let Some(session) = &config.session {
            api_client.set_session(session.clone()).await;
        }

        let sync_manager = SyncManager::with_config(sync_config, db.clone(), api_client.clone());
        sync_manager.set_can_sync(config.session.is_some());

        let background_scheduler = BackgroundScheduler::new(db.clone());

        Ok(Self {
            db,
            api_client,
            sync_manager,
            background_scheduler,
            interval_override: config.interval_override.map(u64::from),
        })
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn api_client(&self) -> &Arc<SyncApiClient> {
        &self.api_client
    }

    pub fn sync_manager(&self) -> &SyncManager {
        &self.sync_manager
    }

    pub fn scheduler(&self) -> &BackgroundScheduler {
        &self.background_scheduler
    }

    /// Startup sync, then periodic sync
    pub async fn start(&self) -> Result<(), AppError> {
        let config = self.sync_manager.get_config().await;

        if !config.enabled {
            log::info!("Sync disabled, running offline");
            return Ok(());
        }

        if config.sync_on_startup && self.sync_manager.can_sync() {
            match self.sync_manager.sync_now().await {
                Ok(SyncOutcome::Completed(report)) => {
                    log::info!("Startup sync completed: {} accounts", report.merged_count);
                }
                Ok(SyncOutcome::Coalesced) => {}
                Err(e) => log::warn!("Startup sync failed: {}", e),
            }
        }

        // The stored interval stands unless the environment sets one
        self.background_scheduler.load_config().await?;
        let stored = self.background_scheduler.get_config().await;
        let interval_minutes = self.interval_override.unwrap_or(stored.interval_minutes);
        self.background_scheduler
            .update_config(stored.enabled, interval_minutes, self.sync_manager.clone())
            .await?;

        Ok(())
    }

    /// Stop background work
    pub async fn shutdown(&self) {
        if self.background_scheduler.is_running() {
            if let Err(e) = self.background_scheduler.stop().await {
                log::warn!("Failed to stop scheduler: {}", e);
            }
        }
        log::info!("Authenticator stopped");
    }
}

async fn serve(config: AppConfig) -> Result<(), AppError> {
    let context = AppContext::new(&config).await?;
    context.start().await?;

    let active = context.db().get_active_accounts()?.len();
    log::info!("Authenticator running with {} accounts, press Ctrl-C to stop", active);

    tokio::signal::ctrl_c().await?;
    context.shutdown().await;
    Ok(())
}

/// Headless entry point
pub fn run() {
    // Load .env file for server and session settings
    dotenvy::dotenv().ok();

    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Invalid configuration: {}", e);
            eprintln!("FATAL: Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Failed to start async runtime: {}", e);
            eprintln!("FATAL: Failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(serve(config)) {
        log::error!("Authenticator failed: {}", e);
        eprintln!("FATAL: {}", e);
        std::process::exit(1);
    }
}
