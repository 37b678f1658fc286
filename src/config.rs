//! Application configuration
//!
//! Settings come from `AUTHENTICATOR_*` environment variables (a `.env` file
//! is loaded first by [`crate::run`]). Everything has a default except the
//! signed-in session, which is optional: without it the app runs offline.
//!
//! | Variable | Meaning |
//! |---|---|
//! | `AUTHENTICATOR_DATA_DIR` | directory holding the database |
//! | `AUTHENTICATOR_SERVER_URL` | Casdoor server; unset means the demo site |
//! | `AUTHENTICATOR_CLIENT_ID`, `_APP_NAME`, `_ORGANIZATION` | application registration |
//! | `AUTHENTICATOR_REDIRECT_PATH`, `_SIGNIN_PATH` | sign-in flow paths |
//! | `AUTHENTICATOR_USER_OWNER`, `_USER_NAME`, `_ACCESS_TOKEN` | signed-in session |
//! | `AUTHENTICATOR_SYNC_ENABLED`, `_SYNC_ON_STARTUP` | `true` / `false` |
//! | `AUTHENTICATOR_SYNC_INTERVAL_MINUTES` | 1-1440 |
//! | `AUTHENTICATOR_REQUEST_TIMEOUT_SECS` | per-RPC timeout |

use std::path::PathBuf;
use std::str::FromStr;

use crate::sync::{ServerConfig, SyncConfig, UserSession};

const ENV_PREFIX: &str = "AUTHENTICATOR_";
const DATABASE_FILE: &str = "authenticator.db";

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Cannot determine data directory")]
    DataDir,
}

/// Everything needed to start the app
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub server: ServerConfig,
    pub session: Option<UserSession>,
    pub sync: SyncConfig,
    /// Interval set through the environment; overrides the stored scheduler interval
    pub interval_override: Option<u32>,
}

impl AppConfig {
    /// Load from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(&format!("{}{}", ENV_PREFIX, name))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let data_dir = match var("DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => default_data_dir()?,
        };

        let server = match var("SERVER_URL") {
            Some(server_url) => {
                let defaults = ServerConfig::default();
                ServerConfig {
                    server_url,
                    client_id: var("CLIENT_ID").unwrap_or_default(),
                    app_name: var("APP_NAME").unwrap_or_default(),
                    organization_name: var("ORGANIZATION").unwrap_or_default(),
                    redirect_path: var("REDIRECT_PATH").unwrap_or(defaults.redirect_path),
                    signin_path: var("SIGNIN_PATH").unwrap_or(defaults.signin_path),
                }
            }
            None => {
                log::info!("No server configured, using the demo site");
                ServerConfig::demo()
            }
        };
        server.validate()?;

        let session = match (var("USER_OWNER"), var("USER_NAME"), var("ACCESS_TOKEN")) {
            (Some(owner), Some(name), Some(access_token)) => Some(UserSession { owner, name, access_token }),
            (None, None, None) => None,
            _ => {
                return Err(ConfigError::InvalidValue {
                    key: format!("{}USER_*", ENV_PREFIX),
                    reason: "owner, name and access token must be set together".to_string(),
                })
            }
        };

        let mut sync = SyncConfig::default();
        let mut interval_override = None;
        if let Some(raw) = var("SYNC_ENABLED") {
            sync.enabled = parse_value("SYNC_ENABLED", &raw)?;
        }
        if let Some(raw) = var("SYNC_ON_STARTUP") {
            sync.sync_on_startup = parse_value("SYNC_ON_STARTUP", &raw)?;
        }
        if let Some(raw) = var("SYNC_INTERVAL_MINUTES") {
            sync.sync_interval_minutes = parse_value("SYNC_INTERVAL_MINUTES", &raw)?;
            if !(1..=1440).contains(&sync.sync_interval_minutes) {
                return Err(ConfigError::InvalidValue {
                    key: format!("{}SYNC_INTERVAL_MINUTES", ENV_PREFIX),
                    reason: "must be between 1 and 1440".to_string(),
                });
            }
            interval_override = Some(sync.sync_interval_minutes);
        }
        if let Some(raw) = var("REQUEST_TIMEOUT_SECS") {
            sync.request_timeout_secs = parse_value("REQUEST_TIMEOUT_SECS", &raw)?;
        }

        Ok(Self { data_dir, server, session, sync, interval_override })
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE)
    }
}

fn default_data_dir() -> Result<PathBuf, ConfigError> {
    directories::ProjectDirs::from("org", "casbin", "authenticator")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or(ConfigError::DataDir)
}

fn parse_value<T>(name: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>().map_err(|e| ConfigError::InvalidValue {
        key: format!("{}{}", ENV_PREFIX, name),
        reason: e.to_string(),
    })
}
