//! Sync API Client - HTTP communication with the Casdoor server
//!
//! The sync engine needs two RPCs:
//! - `fetch`: the user's current MFA account list and its snapshot time
//! - `replace`: overwrite that list with the merged result
//!
//! Both are served by the Casdoor user API (`get-user` / `update-user`).
//! The access token travels as a query parameter and is never logged.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::RwLock;
use url::Url;

use super::models::{ServerConfig, UserSession};
use crate::db::SyncAccount;

/// Remote account-of-record service
#[async_trait]
pub trait RemoteAccountService: Send + Sync {
    /// Current server list. No partial results: any failure is an error.
    async fn fetch(&self) -> Result<RemoteSnapshot, SyncApiError>;

    /// Replace the server list wholesale
    async fn replace(&self, accounts: &[SyncAccount]) -> Result<(), SyncApiError>;
}

/// Server state at fetch time
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteSnapshot {
    /// When the server list last changed, if the server reported it
    pub snapshot_time: Option<DateTime<Utc>>,
    pub accounts: Vec<SyncAccount>,
}

/// API client for the Casdoor user API
pub struct SyncApiClient {
    client: Client,
    server: ServerConfig,
    /// Signed-in user (cached in memory)
    session: Arc<RwLock<Option<UserSession>>>,
}

impl SyncApiClient {
    /// Create new API client
    pub fn new(server: ServerConfig, timeout: std::time::Duration) -> Result<Self, SyncApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            server,
            session: Arc::new(RwLock::new(None)),
        })
    }

    /// Set session (after sign-in)
    pub async fn set_session(&self, session: UserSession) {
        let mut guard = self.session.write().await;
        *guard = Some(session);
    }

    /// Get current session
    pub async fn get_session(&self) -> Option<UserSession> {
        self.session.read().await.clone()
    }

    /// Clear session (sign-out)
    pub async fn clear_session(&self) {
        let mut guard = self.session.write().await;
        *guard = None;
    }

    pub fn server(&self) -> &ServerConfig {
        &self.server
    }

    fn endpoint(&self, path: &str, session: &UserSession) -> Result<Url, SyncApiError> {
        let mut url = Url::parse(&format!("{}{}", self.server.base_url(), path))?;
        url.query_pairs_mut()
            .append_pair("id", &session.user_id())
            .append_pair("access_token", &session.access_token);
        Ok(url)
    }

    async fn require_session(&self) -> Result<UserSession, SyncApiError> {
        self.get_session().await.ok_or(SyncApiError::Unauthorized)
    }

    /// Fetch the full user object
    async fn get_user(&self, session: &UserSession) -> Result<Value, SyncApiError> {
        let response = self.client
            .get(self.endpoint("/api/get-user", session)?)
            .send()
            .await?;

        let body: ApiResponse = handle_response(response).await?;
        body.ensure_ok()?;

        match body.data {
            Some(user) if user.is_object() => Ok(user),
            _ => Err(SyncApiError::InvalidResponse),
        }
    }
}

#[async_trait]
impl RemoteAccountService for SyncApiClient {
    async fn fetch(&self) -> Result<RemoteSnapshot, SyncApiError> {
        let session = self.require_session().await?;
        log::debug!("Fetching MFA accounts for {}", session.user_id());

        let user = self.get_user(&session).await?;
        let snapshot = parse_snapshot(&user)?;

        log::info!(
            "Fetched {} MFA accounts (updated {})",
            snapshot.accounts.len(),
            snapshot.snapshot_time.map_or_else(|| "never".to_string(), |t| t.to_rfc3339())
        );
        Ok(snapshot)
    }

    async fn replace(&self, accounts: &[SyncAccount]) -> Result<(), SyncApiError> {
        let session = self.require_session().await?;
        log::debug!("Replacing MFA accounts for {} ({} entries)", session.user_id(), accounts.len());

        let mut user = self.get_user(&session).await?;
        let wire: Vec<RemoteAccount> = accounts.iter().map(RemoteAccount::from).collect();
        user["mfaAccounts"] = serde_json::to_value(wire).map_err(|_| SyncApiError::InvalidResponse)?;

        let response = self.client
            .post(self.endpoint("/api/update-user", &session)?)
            .json(&user)
            .send()
            .await?;

        let body: ApiResponse = handle_response(response).await?;
        body.ensure_ok()?;

        log::info!("Server accepted {} MFA accounts", accounts.len());
        Ok(())
    }
}

// ============================================================================
// API Request/Response Types
// ============================================================================

/// Casdoor response envelope
#[derive(Debug, Clone, Deserialize)]
struct ApiResponse {
    status: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Option<Value>,
}

impl ApiResponse {
    fn ensure_ok(&self) -> Result<(), SyncApiError> {
        if self.status == "ok" {
            Ok(())
        } else if self.msg.is_empty() {
            Err(SyncApiError::Rejected(format!("status {}", self.status)))
        } else {
            Err(SyncApiError::Rejected(self.msg.clone()))
        }
    }
}

/// MFA account as stored on the user object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteAccount {
    pub account_name: String,
    #[serde(default)]
    pub issuer: String,
    #[serde(default)]
    pub secret_key: String,
}

impl From<&SyncAccount> for RemoteAccount {
    fn from(account: &SyncAccount) -> Self {
        Self {
            account_name: account.account_name.clone(),
            issuer: account.issuer.clone().unwrap_or_default(),
            secret_key: account.secret.clone(),
        }
    }
}

impl From<RemoteAccount> for SyncAccount {
    fn from(account: RemoteAccount) -> Self {
        SyncAccount::new(Some(&account.issuer), &account.account_name, &account.secret_key)
    }
}

fn parse_snapshot(user: &Value) -> Result<RemoteSnapshot, SyncApiError> {
    let snapshot_time = user
        .get("updatedTime")
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|t| t.with_timezone(&Utc));

    let accounts = match user.get("mfaAccounts") {
        None | Some(Value::Null) => Vec::new(),
        Some(list) => serde_json::from_value::<Vec<RemoteAccount>>(list.clone())
            .map_err(|_| SyncApiError::InvalidResponse)?
            .into_iter()
            .map(SyncAccount::from)
            .collect(),
    };

    Ok(RemoteSnapshot { snapshot_time, accounts })
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncApiError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Invalid server URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Unauthorized - sign-in required")]
    Unauthorized,

    #[error("Server rejected request: {0}")]
    Rejected(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Invalid response from server")]
    InvalidResponse,
}

/// Handle successful JSON response
async fn handle_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, SyncApiError> {
    let status = response.status();

    if status.is_success() {
        response.json::<T>().await
            .map_err(|_| SyncApiError::InvalidResponse)
    } else {
        Err(handle_error(response).await)
    }
}

/// Convert error response to SyncApiError
async fn handle_error(response: reqwest::Response) -> SyncApiError {
    let status = response.status();

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SyncApiError::Unauthorized,
        _ => {
            let msg = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            SyncApiError::ServerError(format!("{}: {}", status, msg))
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
