//! Sync History Module - cycle outcome log
//!
//! Records one entry per finished sync cycle:
//! - which path the cycle took (pull-only or full merge)
//! - how many accounts ended up in the merged list
//! - a SHA-256 fingerprint of that list, so two devices can tell whether
//!   they converged without comparing secrets
//! - the error for failed cycles
//!
//! Old entries are removed by a retention policy.

use crate::db::{Database, SyncAccount};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

// ============================================================================
// Types & Structures
// ============================================================================

/// Path a sync cycle took
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOperation {
    /// Nothing local to push; server list adopted
    Pull,
    /// Local changes merged and pushed
    Merge,
}

impl SyncOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOperation::Pull => "pull",
            SyncOperation::Merge => "merge",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "pull" => Ok(SyncOperation::Pull),
            "merge" => Ok(SyncOperation::Merge),
            _ => Err(format!("Invalid operation: {}", s)),
        }
    }
}

/// Outcome recorded for a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStatus {
    Success,
    Failed,
}

impl HistoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryStatus::Success => "success",
            HistoryStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "success" => Ok(HistoryStatus::Success),
            "failed" => Ok(HistoryStatus::Failed),
            _ => Err(format!("Invalid status: {}", s)),
        }
    }
}

/// A single history entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub device_id: String,
    pub operation: SyncOperation,
    pub sync_status: HistoryStatus,
    pub items_count: i64,
    pub snapshot_hash: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// History statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryStats {
    pub total_entries: i64,
    pub failed_entries: i64,
    pub oldest_entry: Option<DateTime<Utc>>,
    pub newest_entry: Option<DateTime<Utc>>,
}

// ============================================================================
// History Manager
// ============================================================================

/// Manages the sync history log
pub struct HistoryManager {
    db: Arc<Database>,
}

impl HistoryManager {
    /// Create new history manager
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Record a successful cycle
    pub fn record_success(
        &self,
        device_id: &str,
        operation: SyncOperation,
        merged: &[SyncAccount],
    ) -> Result<i64, HistoryError> {
        let hash = compute_snapshot_hash(merged)?;
        self.insert(device_id, operation, HistoryStatus::Success, merged.len() as i64, Some(&hash), None)
    }

    /// Record a failed cycle
    pub fn record_failure(
        &self,
        device_id: &str,
        operation: SyncOperation,
        error: &str,
    ) -> Result<i64, HistoryError> {
        self.insert(device_id, operation, HistoryStatus::Failed, 0, None, Some(error))
    }

    fn insert(
        &self,
        device_id: &str,
        operation: SyncOperation,
        status: HistoryStatus,
        items_count: i64,
        snapshot_hash: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<i64, HistoryError> {
        self.db.execute_insert(
            "INSERT INTO sync_history (
                device_id, operation, sync_status, items_count,
                snapshot_hash, error_message, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                device_id,
                operation.as_str(),
                status.as_str(),
                items_count,
                snapshot_hash,
                error_message,
                timestamp(Utc::now()),
            ],
        ).map_err(|e| HistoryError::DatabaseError(e.to_string()))
    }

    /// Most recent entries first
    pub fn get_history(&self, limit: u32) -> Result<Vec<HistoryEntry>, HistoryError> {
        self.db.query(
            "SELECT id, device_id, operation, sync_status, items_count,
                    snapshot_hash, error_message, created_at
             FROM sync_history
             ORDER BY created_at DESC, id DESC
             LIMIT ?1",
            rusqlite::params![limit],
            |row| {
                Ok(HistoryEntry {
                    id: row.get(0)?,
                    device_id: row.get(1)?,
                    operation: SyncOperation::from_str(&row.get::<_, String>(2)?)
                        .map_err(|e| conversion_error(2, e))?,
                    sync_status: HistoryStatus::from_str(&row.get::<_, String>(3)?)
                        .map_err(|e| conversion_error(3, e))?,
                    items_count: row.get(4)?,
                    snapshot_hash: row.get(5)?,
                    error_message: row.get(6)?,
                    created_at: parse_timestamp(7, &row.get::<_, String>(7)?)?,
                })
            }
        ).map_err(|e| HistoryError::DatabaseError(e.to_string()))
    }

    /// Latest successful fingerprint, if any cycle succeeded
    pub fn last_snapshot_hash(&self) -> Result<Option<String>, HistoryError> {
        let hashes = self.db.query(
            "SELECT snapshot_hash FROM sync_history
             WHERE sync_status = 'success'
             ORDER BY created_at DESC, id DESC
             LIMIT 1",
            [],
            |row| row.get::<_, Option<String>>(0),
        ).map_err(|e| HistoryError::DatabaseError(e.to_string()))?;

        Ok(hashes.into_iter().next().flatten())
    }

    /// Enforce retention policy - delete entries older than specified days
    pub fn enforce_retention_policy(&self, retention_days: i64) -> Result<usize, HistoryError> {
        if retention_days < 0 {
            return Err(HistoryError::InvalidOperation(format!(
                "retention must be non-negative, got {} days",
                retention_days
            )));
        }

        let cutoff_date = Utc::now() - chrono::Duration::days(retention_days);

        let deleted = self.db.execute(
            "DELETE FROM sync_history WHERE created_at < ?1",
            rusqlite::params![timestamp(cutoff_date)],
        ).map_err(|e| HistoryError::DatabaseError(e.to_string()))?;

        if deleted > 0 {
            log::info!("Removed {} sync history entries older than {} days", deleted, retention_days);
        }
        Ok(deleted)
    }

    /// Get statistics about sync history
    pub fn get_stats(&self) -> Result<HistoryStats, HistoryError> {
        self.db.query_row(
            "SELECT
                COUNT(*) as total,
                COALESCE(SUM(CASE WHEN sync_status = 'failed' THEN 1 ELSE 0 END), 0) as failed,
                MIN(created_at) as oldest,
                MAX(created_at) as newest
             FROM sync_history",
            [],
            |row| {
                Ok(HistoryStats {
                    total_entries: row.get(0)?,
                    failed_entries: row.get(1)?,
                    oldest_entry: row.get::<_, Option<String>>(2)?
                        .and_then(|s| s.parse().ok()),
                    newest_entry: row.get::<_, Option<String>>(3)?
                        .and_then(|s| s.parse().ok()),
                })
            }
        ).map_err(|e| HistoryError::DatabaseError(e.to_string()))
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// SHA-256 over the canonical JSON of a merged list
pub fn compute_snapshot_hash(accounts: &[SyncAccount]) -> Result<String, HistoryError> {
    let bytes = serde_json::to_vec(accounts)
        .map_err(|e| HistoryError::InvalidOperation(e.to_string()))?;

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Fixed-width RFC 3339, so text order matches time order
fn timestamp(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, message.into())
}

fn parse_timestamp(column: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

// ============================================================================
// Tests
// ============================================================================
