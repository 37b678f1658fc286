//! Background Sync Scheduler
//!
//! Triggers a sync cycle at a configurable interval on a Tokio task. A tick
//! that lands while a cycle is already running is coalesced by the manager.
//! After a completed cycle, tombstones whose deletion reached the server are
//! purged and old history entries are dropped.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use super::manager::{SyncManager, SyncOutcome};
use crate::db::Database;

const CONFIG_KEY: &str = "scheduler_config";
const MIN_INTERVAL_MINUTES: u64 = 1;
const MAX_INTERVAL_MINUTES: u64 = 1440;
const HISTORY_RETENTION_DAYS: i64 = 30;

/// Scheduler configuration stored in settings table
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval_minutes: u64,
    pub last_run: Option<String>, // RFC 3339 timestamp
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_minutes: 5,
            last_run: None,
        }
    }
}

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),

    #[error("Scheduler state poisoned")]
    Poisoned,
}

/// Background scheduler for automatic sync operations
#[derive(Clone)]
pub struct BackgroundScheduler {
    db: Arc<Database>,
    config: Arc<RwLock<SchedulerConfig>>,
    running: Arc<AtomicBool>,
    task_handle: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl BackgroundScheduler {
    /// Create new scheduler instance
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            config: Arc::new(RwLock::new(SchedulerConfig::default())),
            running: Arc::new(AtomicBool::new(false)),
            task_handle: Arc::new(StdMutex::new(None)),
        }
    }

    /// Load configuration from database settings table
    pub async fn load_config(&self) -> Result<(), SchedulerError> {
        let config: SchedulerConfig = self.db
            .get_setting(CONFIG_KEY)
            .map_err(|e| SchedulerError::Database(e.to_string()))?
            .unwrap_or_default();

        *self.config.write().await = config;
        Ok(())
    }

    /// Save configuration to database settings table
    pub async fn save_config(&self) -> Result<(), SchedulerError> {
        let config = self.config.read().await.clone();
        self.db
            .set_setting(CONFIG_KEY, &config)
            .map_err(|e| SchedulerError::Database(e.to_string()))?;
        Ok(())
    }

    /// Start background scheduler task
    pub async fn start(&self, sync_manager: SyncManager) -> Result<(), SchedulerError> {
        let interval_minutes = self.config.read().await.interval_minutes;
        validate_interval(interval_minutes)?;

        if self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SchedulerError::AlreadyRunning);
        }

        let running = self.running.clone();
        let db = self.db.clone();
        let config = self.config.clone();

        let handle = tokio::spawn(async move {
            Self::scheduler_loop(running, db, config, sync_manager).await;
        });

        match self.task_handle.lock() {
            Ok(mut guard) => *guard = Some(handle),
            Err(_) => {
                handle.abort();
                self.running.store(false, Ordering::Release);
                return Err(SchedulerError::Poisoned);
            }
        }

        log::info!("Background scheduler started (interval: {} minutes)", interval_minutes);
        Ok(())
    }

    /// Stop background scheduler task
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Err(SchedulerError::NotRunning);
        }

        let handle = self.task_handle
            .lock()
            .map_err(|_| SchedulerError::Poisoned)?
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }

        log::info!("Background scheduler stopped");
        Ok(())
    }

    /// Check if scheduler is currently running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Get current configuration
    pub async fn get_config(&self) -> SchedulerConfig {
        self.config.read().await.clone()
    }

    /// Update configuration and restart scheduler if needed
    pub async fn update_config(
        &self,
        enabled: bool,
        interval_minutes: u64,
        sync_manager: SyncManager,
    ) -> Result<(), SchedulerError> {
        validate_interval(interval_minutes)?;

        {
            let mut config = self.config.write().await;
            config.enabled = enabled;
            config.interval_minutes = interval_minutes;
        }

        self.save_config().await?;

        if self.is_running() {
            // Lost a race with another stop; nothing left to stop
            if let Err(SchedulerError::NotRunning) = self.stop().await {
                log::debug!("Scheduler already stopped during reconfiguration");
            }
        }

        if enabled {
            self.start(sync_manager).await?;
        }

        log::info!("Scheduler config updated: enabled={}, interval={} minutes", enabled, interval_minutes);
        Ok(())
    }

    /// Background scheduler loop (runs in spawned task)
    async fn scheduler_loop(
        running: Arc<AtomicBool>,
        db: Arc<Database>,
        config: Arc<RwLock<SchedulerConfig>>,
        sync_manager: SyncManager,
    ) {
        let interval_minutes = config.read().await.interval_minutes;
        let mut interval = tokio::time::interval(
            std::time::Duration::from_secs(60 * interval_minutes)
        );
        // The first tick fires immediately; startup sync is handled by the caller
        interval.tick().await;

        log::info!("Scheduler loop started (interval: {} minutes)", interval_minutes);

        loop {
            interval.tick().await;

            if !running.load(Ordering::Acquire) {
                log::info!("Scheduler loop: stopping (running flag is false)");
                break;
            }

            log::info!("Background sync triggered by scheduler");

            match sync_manager.sync_now().await {
                Ok(SyncOutcome::Completed(report)) => {
                    log::info!(
                        "Background sync completed: {} accounts, pushed={}",
                        report.merged_count, report.pushed
                    );

                    if let Err(e) = db.purge_synced_tombstones() {
                        log::warn!("Failed to purge synced tombstones: {}", e);
                    }
                    if let Err(e) = sync_manager.history().enforce_retention_policy(HISTORY_RETENTION_DAYS) {
                        log::warn!("Failed to prune sync history: {}", e);
                    }

                    let snapshot = {
                        let mut cfg = config.write().await;
                        cfg.last_run = Some(Utc::now().to_rfc3339());
                        cfg.clone()
                    };

                    if let Err(e) = db.set_setting(CONFIG_KEY, &snapshot) {
                        log::error!("Failed to save last_run timestamp: {}", e);
                    }
                }
                Ok(SyncOutcome::Coalesced) => {
                    log::debug!("Background sync skipped, a cycle is already running");
                }
                Err(e) => {
                    // Dirty records stay dirty; the next tick retries them
                    log::warn!("Background sync failed: {}", e);
                }
            }
        }

        log::info!("Scheduler loop exited");
    }
}

fn validate_interval(interval_minutes: u64) -> Result<(), SchedulerError> {
    if !(MIN_INTERVAL_MINUTES..=MAX_INTERVAL_MINUTES).contains(&interval_minutes) {
        return Err(SchedulerError::InvalidInterval(format!(
            "Interval must be {}-{} minutes, got {}",
            MIN_INTERVAL_MINUTES, MAX_INTERVAL_MINUTES, interval_minutes
        )));
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
