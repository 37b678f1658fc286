//! Account store - TOTP credential records
//!
//! Records are soft-deleted and carry two timestamps:
//! - `last_change_time`: bumped on every local mutation
//! - `last_sync_time`: stamped only when a sync cycle commits
//!
//! A record is dirty while it has never synced or has changed since it last
//! synced. Dirty records are what the sync engine pushes.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

use super::{millis_to_time, now, Database, DbError, DbResult};

const ACCOUNT_COLUMNS: &str =
    "id, issuer, account_name, secret, is_deleted, last_change_time, last_sync_time";

// ============================================================================
// DATA STRUCTURES
// ============================================================================

/// Natural identity of an account: `(issuer, account_name)`.
///
/// A missing issuer and an empty issuer are the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountKey {
    pub issuer: String,
    pub account_name: String,
}

impl AccountKey {
    pub fn new(issuer: Option<&str>, account_name: &str) -> Self {
        Self {
            issuer: issuer.unwrap_or_default().to_string(),
            account_name: account_name.to_string(),
        }
    }
}

impl fmt::Display for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.issuer.is_empty() {
            write!(f, "{}", self.account_name)
        } else {
            write!(f, "{}:{}", self.issuer, self.account_name)
        }
    }
}

/// Account content as exchanged with the server and produced by a merge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncAccount {
    pub issuer: Option<String>,
    pub account_name: String,
    pub secret: String,
}

impl SyncAccount {
    pub fn new(issuer: Option<&str>, account_name: &str, secret: &str) -> Self {
        Self {
            issuer: normalize_issuer(issuer),
            account_name: account_name.to_string(),
            secret: secret.to_string(),
        }
    }

    pub fn key(&self) -> AccountKey {
        AccountKey::new(self.issuer.as_deref(), &self.account_name)
    }
}

/// A stored account row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: i64,
    pub issuer: Option<String>,
    pub account_name: String,
    pub secret: String,
    pub is_deleted: bool,
    pub last_change_time: DateTime<Utc>,
    pub last_sync_time: Option<DateTime<Utc>>,
}

impl Account {
    pub fn key(&self) -> AccountKey {
        AccountKey::new(self.issuer.as_deref(), &self.account_name)
    }

    /// Never synced, or changed since the last sync
    pub fn is_dirty(&self) -> bool {
        match self.last_sync_time {
            Some(synced) => self.last_change_time > synced,
            None => true,
        }
    }

    pub fn to_sync_account(&self) -> SyncAccount {
        SyncAccount {
            issuer: self.issuer.clone(),
            account_name: self.account_name.clone(),
            secret: self.secret.clone(),
        }
    }

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            issuer: row.get(1)?,
            account_name: row.get(2)?,
            secret: row.get(3)?,
            is_deleted: row.get(4)?,
            last_change_time: millis_to_time(5, row.get(5)?)?,
            last_sync_time: row
                .get::<_, Option<i64>>(6)?
                .map(|millis| millis_to_time(6, millis))
                .transpose()?,
        })
    }
}

/// Input for creating an account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAccount {
    pub issuer: Option<String>,
    pub account_name: String,
    pub secret: String,
}

impl NewAccount {
    pub fn new(issuer: Option<&str>, account_name: &str, secret: &str) -> Self {
        Self {
            issuer: issuer.map(str::to_string),
            account_name: account_name.to_string(),
            secret: secret.to_string(),
        }
    }

    pub fn key(&self) -> AccountKey {
        AccountKey::new(self.issuer.as_deref(), &self.account_name)
    }
}

/// Partial update; `None` keeps the stored value
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountUpdate {
    pub issuer: Option<String>,
    pub account_name: Option<String>,
    pub secret: Option<String>,
}

/// What a commit did to the table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSummary {
    /// Server accounts that had no local row
    pub inserted: usize,
    /// Local rows whose secret changed
    pub updated: usize,
    /// Local rows tombstoned because the merged list no longer has them
    pub deleted: usize,
    /// Rows that received the new sync time
    pub stamped: usize,
    /// Keys left alone because they changed while the cycle was running
    pub skipped: usize,
}

// ============================================================================
// ACCOUNT STORE
// ============================================================================

impl Database {
    /// Create an account. Fails with `Duplicate` if a live account has the same key.
    pub fn create_account(&self, account: &NewAccount) -> DbResult<i64> {
        let issuer = normalize_issuer(account.issuer.as_deref());
        validate_account_name(&account.account_name)?;
        validate_secret(&account.secret)?;

        let key = AccountKey::new(issuer.as_deref(), &account.account_name);

        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if find_active_by_key(&tx, &key)?.is_some() {
            return Err(DbError::Duplicate(key));
        }

        let id = insert_account(&tx, issuer.as_deref(), &account.account_name, &account.secret, now(), None)?;

        if let Some(vault) = self.vault() {
            vault.set(id, &account.secret)?;
        }

        if let Err(e) = tx.commit() {
            self.forget_secret(id);
            return Err(e.into());
        }

        log::info!("Account created: {} (ID: {})", key, id);
        Ok(id)
    }

    /// Update an account.
    ///
    /// Changing the issuer or account name changes the key: the old row is
    /// tombstoned and a new row takes its place, so the rename reaches the
    /// server as a delete plus an add. Returns the id now holding the account.
    pub fn update_account(&self, id: i64, update: &AccountUpdate) -> DbResult<i64> {
        if let Some(name) = &update.account_name {
            validate_account_name(name)?;
        }
        if let Some(secret) = &update.secret {
            validate_secret(secret)?;
        }

        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = load_account(&tx, id)?
            .filter(|account| !account.is_deleted)
            .ok_or_else(|| DbError::NotFound(format!("account {}", id)))?;

        let issuer = match &update.issuer {
            Some(issuer) => normalize_issuer(Some(issuer)),
            None => current.issuer.clone(),
        };
        let account_name = update
            .account_name
            .clone()
            .unwrap_or_else(|| current.account_name.clone());
        let secret = update.secret.clone().unwrap_or_else(|| current.secret.clone());

        let new_key = AccountKey::new(issuer.as_deref(), &account_name);
        let changed_at = next_change_time(&current);

        if new_key == current.key() {
            tx.execute(
                "UPDATE accounts SET issuer = ?1, secret = ?2, last_change_time = ?3 WHERE id = ?4",
                params![issuer, secret, changed_at.timestamp_millis(), id],
            )?;

            let vault = self.vault().filter(|_| update.secret.is_some());
            if let Some(vault) = vault {
                vault.set(id, &secret)?;
            }

            if let Err(e) = tx.commit() {
                if vault.is_some() {
                    self.restore_secret(id, &current.secret);
                }
                return Err(e.into());
            }
            log::info!("Account updated: {} (ID: {})", new_key, id);
            return Ok(id);
        }

        if find_active_by_key(&tx, &new_key)?.is_some() {
            return Err(DbError::Duplicate(new_key));
        }

        tx.execute(
            "UPDATE accounts SET is_deleted = 1, last_change_time = ?1 WHERE id = ?2",
            params![changed_at.timestamp_millis(), id],
        )?;
        let new_id = insert_account(&tx, issuer.as_deref(), &account_name, &secret, now(), None)?;

        if let Some(vault) = self.vault() {
            vault.set(new_id, &secret)?;
        }

        if let Err(e) = tx.commit() {
            self.forget_secret(new_id);
            return Err(e.into());
        }

        self.forget_secret(id);
        log::info!(
            "Account renamed: {} -> {} (ID: {} -> {})",
            current.key(), new_key, id, new_id
        );
        Ok(new_id)
    }

    /// Soft delete an account (mark as deleted instead of removing)
    pub fn soft_delete_account(&self, id: i64) -> DbResult<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = load_account(&tx, id)?
            .filter(|account| !account.is_deleted)
            .ok_or_else(|| DbError::NotFound(format!("account {}", id)))?;

        tx.execute(
            "UPDATE accounts SET is_deleted = 1, last_change_time = ?1 WHERE id = ?2",
            params![next_change_time(&current).timestamp_millis(), id],
        )?;

        if let Some(vault) = self.vault() {
            vault.delete(id)?;
        }

        if let Err(e) = tx.commit() {
            self.restore_secret(id, &current.secret);
            return Err(e.into());
        }
        log::info!("Account deleted: {} (ID: {})", current.key(), id);
        Ok(())
    }

    /// Get account by ID (tombstones included)
    pub fn get_account(&self, id: i64) -> DbResult<Option<Account>> {
        let conn = self.get_conn()?;
        load_account(&conn, id)
    }

    /// Get the live account holding a key
    pub fn get_account_by_key(&self, key: &AccountKey) -> DbResult<Option<Account>> {
        let conn = self.get_conn()?;
        find_active_by_key(&conn, key)
    }

    /// Get all accounts that are not tombstoned
    pub fn get_active_accounts(&self) -> DbResult<Vec<Account>> {
        self.query(
            &format!("SELECT {} FROM accounts WHERE is_deleted = 0 ORDER BY id ASC", ACCOUNT_COLUMNS),
            [],
            Account::from_row,
        )
    }

    /// Get accounts that changed since their last sync, tombstones included
    pub fn get_dirty_accounts(&self) -> DbResult<Vec<Account>> {
        self.query(
            &format!(
                "SELECT {} FROM accounts
                 WHERE last_sync_time IS NULL OR last_change_time > last_sync_time
                 ORDER BY id ASC",
                ACCOUNT_COLUMNS
            ),
            [],
            Account::from_row,
        )
    }

    /// Count dirty accounts
    pub fn count_dirty_accounts(&self) -> DbResult<usize> {
        let count: i64 = self.query_row(
            "SELECT COUNT(*) FROM accounts
             WHERE last_sync_time IS NULL OR last_change_time > last_sync_time",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Replace local state with a merged account list in one transaction.
    ///
    /// `baseline` is the dirty set the merge was computed from. Any key with a
    /// row that is dirty now but not exactly as in `baseline` was edited while
    /// the cycle was running; such keys are left untouched so the edit stays
    /// dirty for the next cycle, with a change time after `sync_time`.
    /// Every other row is stamped with `sync_time`,
    /// and live rows whose key is missing from `merged` become tombstones.
    pub fn commit_merged(
        &self,
        merged: &[SyncAccount],
        sync_time: DateTime<Utc>,
        baseline: &[Account],
    ) -> DbResult<CommitSummary> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let rows: Vec<Account> = {
            let mut stmt = tx.prepare(&format!("SELECT {} FROM accounts ORDER BY id ASC", ACCOUNT_COLUMNS))?;
            let rows = stmt
                .query_map([], Account::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let seen: HashMap<i64, DateTime<Utc>> = baseline
            .iter()
            .map(|account| (account.id, account.last_change_time))
            .collect();

        let touched: HashSet<AccountKey> = rows
            .iter()
            .filter(|row| row.is_dirty() && seen.get(&row.id) != Some(&row.last_change_time))
            .map(Account::key)
            .collect();

        // A stamp below a committed row's change time would leave it dirty
        let sync_time = rows
            .iter()
            .filter(|row| !touched.contains(&row.key()))
            .map(|row| row.last_change_time)
            .max()
            .map_or(sync_time, |latest| latest.max(sync_time));
        let sync_millis = sync_time.timestamp_millis();

        let mut summary = CommitSummary::default();
        let mut merged_keys: HashSet<AccountKey> = HashSet::new();
        let mut secret_writes: Vec<(i64, String)> = Vec::new();
        let mut secret_deletes: Vec<i64> = Vec::new();

        for account in merged {
            let key = account.key();

            if touched.contains(&key) {
                log::debug!("Commit: {} changed during sync, leaving it for the next cycle", key);
                summary.skipped += 1;
                merged_keys.insert(key);
                continue;
            }

            if !merged_keys.insert(key.clone()) {
                log::warn!("Commit: duplicate key {} in merged list, keeping the first", key);
                continue;
            }

            if account.secret.trim().is_empty() {
                log::warn!("Commit: {} has no secret, leaving the local row as is", key);
                summary.skipped += 1;
                continue;
            }

            match rows.iter().find(|row| !row.is_deleted && row.key() == key) {
                Some(existing) => {
                    tx.execute(
                        "UPDATE accounts SET issuer = ?1, secret = ?2, last_sync_time = ?3 WHERE id = ?4",
                        params![account.issuer, account.secret, sync_millis, existing.id],
                    )?;
                    if existing.secret != account.secret {
                        summary.updated += 1;
                        secret_writes.push((existing.id, account.secret.clone()));
                    }
                }
                None => {
                    let id = insert_account(
                        &tx,
                        account.issuer.as_deref(),
                        &account.account_name,
                        &account.secret,
                        sync_time,
                        Some(sync_time),
                    )?;
                    summary.inserted += 1;
                    secret_writes.push((id, account.secret.clone()));
                }
            }
            summary.stamped += 1;
        }

        for row in &rows {
            let key = row.key();
            if touched.contains(&key) {
                // The pushed list is now newer than this edit on the server
                // clock; move the edit past it so it wins the next merge
                if row.is_dirty() && row.last_change_time <= sync_time {
                    tx.execute(
                        "UPDATE accounts SET last_change_time = ?1 WHERE id = ?2",
                        params![sync_millis + 1, row.id],
                    )?;
                }
                continue;
            }

            if !row.is_deleted && !merged_keys.contains(&key) {
                tx.execute(
                    "UPDATE accounts SET is_deleted = 1, last_sync_time = ?1 WHERE id = ?2",
                    params![sync_millis, row.id],
                )?;
                summary.deleted += 1;
                summary.stamped += 1;
                secret_deletes.push(row.id);
            } else if row.is_deleted && row.is_dirty() {
                tx.execute(
                    "UPDATE accounts SET last_sync_time = ?1 WHERE id = ?2",
                    params![sync_millis, row.id],
                )?;
                summary.stamped += 1;
            }
        }

        tx.commit()?;

        // The table is the source of truth; the vault only mirrors it
        if let Some(vault) = self.vault() {
            for (id, secret) in &secret_writes {
                if let Err(e) = vault.set(*id, secret) {
                    log::warn!("Failed to mirror secret for account {} into vault: {}", id, e);
                }
            }
            for id in &secret_deletes {
                if let Err(e) = vault.delete(*id) {
                    log::warn!("Failed to remove secret for account {} from vault: {}", id, e);
                }
            }
        }

        log::info!(
            "Merged list committed: {} inserted, {} updated, {} deleted, {} stamped, {} skipped",
            summary.inserted, summary.updated, summary.deleted, summary.stamped, summary.skipped
        );
        Ok(summary)
    }

    /// Physically remove tombstones whose deletion has already been synced
    pub fn purge_synced_tombstones(&self) -> DbResult<usize> {
        let removed = self.execute(
            "DELETE FROM accounts
             WHERE is_deleted = 1
               AND last_sync_time IS NOT NULL
               AND last_change_time <= last_sync_time",
            [],
        )?;

        if removed > 0 {
            log::info!("Purged {} synced tombstones", removed);
        }
        Ok(removed)
    }

    /// Fill live rows without an inline secret from the attached vault.
    ///
    /// A restored row is marked unsynced so its secret reaches the server.
    /// Returns how many rows were restored.
    pub fn restore_missing_secrets(&self) -> DbResult<usize> {
        let vault = match self.vault() {
            Some(vault) => vault.clone(),
            None => return Ok(0),
        };

        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let blank: Vec<Account> = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM accounts WHERE is_deleted = 0 AND TRIM(secret) = '' ORDER BY id ASC",
                ACCOUNT_COLUMNS
            ))?;
            let rows = stmt
                .query_map([], Account::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut restored = 0;
        for account in &blank {
            match vault.get(account.id)? {
                Some(secret) if !secret.trim().is_empty() => {
                    tx.execute(
                        "UPDATE accounts SET secret = ?1, last_change_time = ?2, last_sync_time = NULL WHERE id = ?3",
                        params![secret, next_change_time(account).timestamp_millis(), account.id],
                    )?;
                    restored += 1;
                }
                _ => log::warn!("No secret in vault for account {} (ID: {})", account.key(), account.id),
            }
        }

        tx.commit()?;

        if restored > 0 {
            log::info!("Restored {} account secrets from vault", restored);
        }
        Ok(restored)
    }

    fn restore_secret(&self, id: i64, secret: &str) {
        if let Some(vault) = self.vault() {
            if let Err(e) = vault.set(id, secret) {
                log::warn!("Failed to restore secret for account {} in vault: {}", id, e);
            }
        }
    }

    fn forget_secret(&self, id: i64) {
        if let Some(vault) = self.vault() {
            if let Err(e) = vault.delete(id) {
                log::warn!("Failed to remove secret for account {} from vault: {}", id, e);
            }
        }
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn load_account(conn: &Connection, id: i64) -> DbResult<Option<Account>> {
    let account = conn
        .query_row(
            &format!("SELECT {} FROM accounts WHERE id = ?1", ACCOUNT_COLUMNS),
            [id],
            Account::from_row,
        )
        .optional()?;
    Ok(account)
}

fn find_active_by_key(conn: &Connection, key: &AccountKey) -> DbResult<Option<Account>> {
    let account = conn
        .query_row(
            &format!(
                "SELECT {} FROM accounts
                 WHERE COALESCE(issuer, '') = ?1 AND account_name = ?2 AND is_deleted = 0",
                ACCOUNT_COLUMNS
            ),
            params![key.issuer, key.account_name],
            Account::from_row,
        )
        .optional()?;
    Ok(account)
}

fn insert_account(
    conn: &Connection,
    issuer: Option<&str>,
    account_name: &str,
    secret: &str,
    changed_at: DateTime<Utc>,
    synced_at: Option<DateTime<Utc>>,
) -> DbResult<i64> {
    conn.execute(
        r#"
        INSERT INTO accounts (issuer, account_name, secret, is_deleted, last_change_time, last_sync_time)
        VALUES (?1, ?2, ?3, 0, ?4, ?5)
        "#,
        params![
            issuer,
            account_name,
            secret,
            changed_at.timestamp_millis(),
            synced_at.map(|t| t.timestamp_millis()),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Strictly after both the previous change and the last sync, so the
/// mutation is always visible as dirty
fn next_change_time(account: &Account) -> DateTime<Utc> {
    let step = Duration::milliseconds(1);
    let mut next = now().max(account.last_change_time + step);
    if let Some(synced) = account.last_sync_time {
        next = next.max(synced + step);
    }
    next
}

fn normalize_issuer(issuer: Option<&str>) -> Option<String> {
    issuer
        .map(str::trim)
        .filter(|issuer| !issuer.is_empty())
        .map(str::to_string)
}

fn validate_account_name(name: &str) -> DbResult<()> {
    if name.trim().is_empty() {
        return Err(DbError::Invalid("account name is required".to_string()));
    }
    Ok(())
}

fn validate_secret(secret: &str) -> DbResult<()> {
    if secret.trim().is_empty() {
        return Err(DbError::Invalid("secret is required".to_string()));
    }
    Ok(())
}
