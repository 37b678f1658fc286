//! Sync Module - reconciles local accounts with the server
//!
//! Keeps the local account store and the user's MFA account list on the
//! server in agreement:
//! - Merge: per-key resolution against the server snapshot time
//! - Tombstones: local deletions reach the server and are not resurrected
//! - Retry: a failed cycle leaves dirty records in place for the next one
//!
//! Architecture:
//! - `api`: transport trait and the Casdoor HTTP client
//! - `merge`: pure reconciliation
//! - `manager`: single-flight cycle orchestration
//! - `history` / `scheduler`: outcome log and periodic trigger

pub mod api;
pub mod history;
pub mod manager;
pub mod merge;
pub mod models;
pub mod scheduler;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use api::{RemoteAccount, RemoteAccountService, RemoteSnapshot, SyncApiClient, SyncApiError};
pub use history::{HistoryEntry, HistoryError, HistoryManager, HistoryStats, HistoryStatus, SyncOperation};
pub use manager::{SyncManager, SyncManagerError, SyncOutcome};
pub use merge::{merge, Resolution};
pub use models::{ServerConfig, SyncConfig, SyncPhase, SyncReport, SyncStatus, UserSession};
pub use scheduler::{BackgroundScheduler, SchedulerConfig, SchedulerError};
