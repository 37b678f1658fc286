//! Sync Data Models - Client-Side Structures
//!
//! Data Categories:
//! - SyncConfig: sync settings and device metadata
//! - ServerConfig: the account-of-record server this device talks to
//! - UserSession: who is signed in and the token used for RPCs
//! - SyncPhase / SyncStatus: observable orchestrator state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::ConfigError;

// ============================================================================
// Sync Configuration
// ============================================================================

/// Sync configuration
///
/// Persisted in the SQLite settings table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Whether sync is enabled
    pub enabled: bool,

    /// Unique device identifier (UUID v4)
    pub device_id: String,

    /// Device name (hostname by default)
    pub device_name: String,

    /// Auto-sync interval in minutes
    pub sync_interval_minutes: u32,

    /// Sync on app startup
    pub sync_on_startup: bool,

    /// Timeout applied to each RPC
    pub request_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            device_id: uuid::Uuid::new_v4().to_string(),
            device_name: get_default_device_name(),
            sync_interval_minutes: 5,
            sync_on_startup: true,
            request_timeout_secs: 30,
        }
    }
}

/// Get default device name from hostname
fn get_default_device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| format!("{} Device", std::env::consts::OS))
}

// ============================================================================
// Server & Session
// ============================================================================

/// Casdoor server the accounts are synced with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub server_url: String,
    pub client_id: String,
    #[serde(default)]
    pub app_name: String,
    #[serde(default)]
    pub organization_name: String,
    pub redirect_path: String,
    #[serde(default = "default_signin_path")]
    pub signin_path: String,
}

fn default_signin_path() -> String {
    "/api/signin".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            client_id: String::new(),
            app_name: String::new(),
            organization_name: String::new(),
            redirect_path: "http://casdoor-app".to_string(),
            signin_path: default_signin_path(),
        }
    }
}

impl ServerConfig {
    /// Public demo site
    pub fn demo() -> Self {
        Self {
            server_url: "https://door.casdoor.com".to_string(),
            client_id: "b800a86702dd4d29ec4d".to_string(),
            app_name: "app-example".to_string(),
            organization_name: "casbin".to_string(),
            ..Self::default()
        }
    }

    /// Server URL, client id and redirect path are required
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_url.trim().is_empty() {
            return Err(ConfigError::MissingField("server_url"));
        }
        if self.client_id.trim().is_empty() {
            return Err(ConfigError::MissingField("client_id"));
        }
        if self.redirect_path.trim().is_empty() {
            return Err(ConfigError::MissingField("redirect_path"));
        }

        Url::parse(&self.server_url)
            .map_err(|e| ConfigError::InvalidUrl(format!("{}: {}", self.server_url, e)))?;

        Ok(())
    }

    /// Server URL without a trailing slash
    pub fn base_url(&self) -> &str {
        self.server_url.trim_end_matches('/')
    }
}

/// Signed-in user
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSession {
    /// Organization that owns the user
    pub owner: String,
    pub name: String,
    pub access_token: String,
}

impl UserSession {
    /// Casdoor user id, `owner/name`
    pub fn user_id(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

impl std::fmt::Debug for UserSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserSession")
            .field("owner", &self.owner)
            .field("name", &self.name)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

// ============================================================================
// Sync Status & Metadata
// ============================================================================

/// Where the orchestrator is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Idle,
    Fetching,
    Merging,
    Pushing,
    Committing,
    /// Exit from an in-flight phase; the manager moves on to `Idle` at once
    Failed,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Fetching => "fetching",
            SyncPhase::Merging => "merging",
            SyncPhase::Pushing => "pushing",
            SyncPhase::Committing => "committing",
            SyncPhase::Failed => "failed",
        }
    }
}

impl Default for SyncPhase {
    fn default() -> Self {
        SyncPhase::Idle
    }
}

/// Internal orchestrator state
#[derive(Debug, Clone, Default)]
pub(crate) struct SyncState {
    pub phase: SyncPhase,
    pub last_error: Option<String>,
    pub last_sync_at: Option<DateTime<Utc>>,
}

/// Snapshot of the orchestrator for callers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatus {
    pub phase: SyncPhase,
    pub can_sync: bool,
    pub last_error: Option<String>,
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Local records not yet on the server
    pub pending_changes: usize,
}

/// What a completed cycle did
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncReport {
    /// Accounts on the server before the cycle
    pub server_count: usize,
    /// Dirty local records fed into the merge
    pub local_changes: usize,
    /// Accounts in the merged list
    pub merged_count: usize,
    /// False when there was nothing local to push
    pub pushed: bool,
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub synced_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Tests
// ============================================================================
