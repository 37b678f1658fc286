//! Sync Manager - Orchestrates synchronization cycles
//!
//! One cycle:
//! - Fetch the server list
//! - Read local dirty records; with none, adopt the server list as is
//! - Merge and push the merged list as a full replacement
//! - Commit the merged list locally once the server acknowledged it
//!
//! At most one cycle runs at a time. A trigger that arrives while a cycle is
//! in flight is dropped and reported as `Coalesced`.
//! A failed cycle passes through `Failed` back to `Idle` and leaves every
//! dirty marker in place, so the next cycle retries the same changes.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::api::{RemoteAccountService, SyncApiError};
use super::history::{HistoryManager, SyncOperation};
use super::merge::merge;
use super::models::{SyncConfig, SyncPhase, SyncReport, SyncState, SyncStatus};
use crate::db::{self, Database, DbError, SyncAccount};

/// Result of a `sync_now` trigger
#[derive(Debug, Clone)]
pub enum SyncOutcome {
    /// A cycle ran to completion
    Completed(SyncReport),
    /// Another cycle was already running; this trigger was dropped
    Coalesced,
}

impl SyncOutcome {
    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            SyncOutcome::Completed(report) => Some(report),
            SyncOutcome::Coalesced => None,
        }
    }
}

/// Sync manager - main orchestrator
#[derive(Clone)]
pub struct SyncManager {
    remote: Arc<dyn RemoteAccountService>,
    config: Arc<RwLock<SyncConfig>>,
    db: Arc<Database>,
    history_manager: Arc<HistoryManager>,
    state: Arc<RwLock<SyncState>>,
    can_sync: Arc<AtomicBool>,
    in_flight: Arc<AtomicBool>,
}

impl SyncManager {
    /// Create new sync manager with default config
    pub fn new(db: Arc<Database>, remote: Arc<dyn RemoteAccountService>) -> Self {
        Self::with_config(SyncConfig::default(), db, remote)
    }

    /// Initialize with existing config
    pub fn with_config(
        config: SyncConfig,
        db: Arc<Database>,
        remote: Arc<dyn RemoteAccountService>,
    ) -> Self {
        Self {
            remote,
            config: Arc::new(RwLock::new(config)),
            history_manager: Arc::new(HistoryManager::new(db.clone())),
            db,
            state: Arc::new(RwLock::new(SyncState::default())),
            can_sync: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    // ========================================================================
    // Gate & Config
    // ========================================================================

    /// Open or close the sync gate (signed in and server reachable)
    pub fn set_can_sync(&self, can_sync: bool) {
        let previous = self.can_sync.swap(can_sync, Ordering::AcqRel);
        if previous != can_sync {
            log::info!("Sync gate {}", if can_sync { "opened" } else { "closed" });
        }
    }

    pub fn can_sync(&self) -> bool {
        self.can_sync.load(Ordering::Acquire)
    }

    /// Get current sync config
    pub async fn get_config(&self) -> SyncConfig {
        self.config.read().await.clone()
    }

    /// Update sync config
    pub async fn update_config(&self, new_config: SyncConfig) {
        let mut config = self.config.write().await;
        *config = new_config;
    }

    pub fn history(&self) -> &HistoryManager {
        &self.history_manager
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Current phase, last error, last success and pending change count
    pub async fn status(&self) -> Result<SyncStatus, SyncManagerError> {
        let pending_changes = self.db.count_dirty_accounts()?;
        let state = self.state.read().await.clone();

        Ok(SyncStatus {
            phase: state.phase,
            can_sync: self.can_sync(),
            last_error: state.last_error,
            last_sync_at: state.last_sync_at,
            pending_changes,
        })
    }

    // ========================================================================
    // Sync Operations
    // ========================================================================

    /// Run one sync cycle now
    pub async fn sync_now(&self) -> Result<SyncOutcome, SyncManagerError> {
        let config = self.config.read().await.clone();

        if !config.enabled {
            return Err(SyncManagerError::SyncDisabled);
        }

        if !self.can_sync() {
            let err = SyncManagerError::Connectivity("not signed in or server unreachable".to_string());
            self.state.write().await.last_error = Some(err.to_string());
            return Err(err);
        }

        let _guard = match InFlightGuard::acquire(&self.in_flight) {
            Some(guard) => guard,
            None => {
                log::debug!("Sync already in progress, trigger coalesced");
                return Ok(SyncOutcome::Coalesced);
            }
        };

        log::info!("Starting sync cycle (device: {})", config.device_name);

        let mut operation = SyncOperation::Pull;
        let result = self.run_cycle(&mut operation).await;
        if result.is_err() {
            self.set_phase(SyncPhase::Failed).await;
        }

        let mut state = self.state.write().await;
        state.phase = SyncPhase::Idle;

        match result {
            Ok((report, merged)) => {
                state.last_error = None;
                state.last_sync_at = report.synced_at;
                drop(state);

                if let Err(e) = self.history_manager.record_success(&config.device_id, operation, &merged) {
                    log::warn!("Failed to record sync history: {}", e);
                }

                log::info!(
                    "Sync cycle completed: {} merged, {} inserted, {} updated, {} deleted, {} skipped",
                    report.merged_count, report.inserted, report.updated, report.deleted, report.skipped
                );
                Ok(SyncOutcome::Completed(report))
            }
            Err(e) => {
                state.last_error = Some(e.to_string());
                drop(state);

                if let Err(history_err) = self.history_manager.record_failure(&config.device_id, operation, &e.to_string()) {
                    log::warn!("Failed to record sync history: {}", history_err);
                }

                log::error!("Sync cycle failed: {}", e);
                Err(e)
            }
        }
    }

    async fn run_cycle(
        &self,
        operation: &mut SyncOperation,
    ) -> Result<(SyncReport, Vec<SyncAccount>), SyncManagerError> {
        self.set_phase(SyncPhase::Fetching).await;
        let snapshot = self.remote.fetch().await?;

        let dirty = self.db.get_dirty_accounts()?;

        let mut report = SyncReport {
            server_count: snapshot.accounts.len(),
            local_changes: dirty.len(),
            ..SyncReport::default()
        };

        let merged = if dirty.is_empty() {
            log::info!("No local changes, adopting server list");
            snapshot.accounts
        } else {
            *operation = SyncOperation::Merge;

            self.set_phase(SyncPhase::Merging).await;
            // A server that never reported an update time loses to any local edit
            let snapshot_time = snapshot.snapshot_time.unwrap_or_else(DateTime::<Utc>::default);
            let merged = merge(&snapshot.accounts, snapshot_time, &dirty);

            self.set_phase(SyncPhase::Pushing).await;
            self.remote.replace(&merged).await?;
            report.pushed = true;
            merged
        };

        self.set_phase(SyncPhase::Committing).await;
        let synced_at = db::now();
        let summary = self.db.commit_merged(&merged, synced_at, &dirty)?;

        report.merged_count = merged.len();
        report.inserted = summary.inserted;
        report.updated = summary.updated;
        report.deleted = summary.deleted;
        report.skipped = summary.skipped;
        report.synced_at = Some(synced_at);

        Ok((report, merged))
    }

    async fn set_phase(&self, phase: SyncPhase) {
        log::debug!("Sync phase: {}", phase.as_str());
        self.state.write().await.phase = phase;
    }
}

/// Clears the in-flight flag when the cycle ends, however it ends
struct InFlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncManagerError {
    #[error("Sync is disabled")]
    SyncDisabled,

    #[error("Cannot sync: {0}")]
    Connectivity(String),

    #[error("Transport error: {0}")]
    Transport(SyncApiError),

    #[error("Server rejected sync: {0}")]
    ServerRejection(String),

    #[error("Store error: {0}")]
    Store(#[from] DbError),
}

impl From<SyncApiError> for SyncManagerError {
    fn from(err: SyncApiError) -> Self {
        match err {
            SyncApiError::Rejected(msg) => SyncManagerError::ServerRejection(msg),
            other => SyncManagerError::Transport(other),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
