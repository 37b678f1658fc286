//! Database module for the authenticator
//!
//! Provides SQLite storage for TOTP accounts, settings and sync history.
//! Every account mutation runs in its own `BEGIN IMMEDIATE` transaction, so
//! writers are serialized and a failed operation leaves no partial state.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

// Connection pooling
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

use crate::vault::{SecretVault, VaultError};

mod accounts;

pub use accounts::{Account, AccountKey, AccountUpdate, CommitSummary, NewAccount, SyncAccount};

/// Database error types
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Account already exists: {0}")]
    Duplicate(AccountKey),

    #[error("Invalid account: {0}")]
    Invalid(String),

    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Database manager for thread-safe SQLite access
#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool<SqliteConnectionManager>>,
    vault: Option<Arc<dyn SecretVault>>,
}

impl Database {
    /// Open (or create) a database file and bring its schema up to date
    pub fn new(db_path: PathBuf) -> DbResult<Self> {
        log::info!("Opening account database at {}", db_path.display());

        let manager = SqliteConnectionManager::file(&db_path);

        let pool = Pool::builder()
            .max_size(8)
            .min_idle(Some(2))
            .connection_timeout(std::time::Duration::from_secs(10))
            .build(manager)?;

        let conn = pool.get()?;

        conn.execute_batch(r#"
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA temp_store = MEMORY;
        "#)?;

        Self::initialize_schema(&conn)?;
        drop(conn);

        Ok(Self {
            pool: Arc::new(pool),
            vault: None,
        })
    }

    /// Create an in-memory database (for testing)
    ///
    /// Every SQLite `:memory:` connection is its own database, so the pool is
    /// capped at one connection.
    pub fn in_memory() -> DbResult<Self> {
        let manager = SqliteConnectionManager::memory();

        let pool = Pool::builder()
            .max_size(1)
            .build(manager)?;

        let conn = pool.get()?;
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA temp_store = MEMORY;")?;

        Self::initialize_schema(&conn)?;
        drop(conn);

        Ok(Self {
            pool: Arc::new(pool),
            vault: None,
        })
    }

    /// Attach a secret vault that mirrors account secrets.
    ///
    /// Live rows that lost their secret in the legacy migration are restored
    /// from the vault before the database is handed back.
    pub fn with_vault(mut self, vault: Arc<dyn SecretVault>) -> DbResult<Self> {
        self.vault = Some(vault);
        self.restore_missing_secrets()?;
        Ok(self)
    }

    pub(crate) fn vault(&self) -> Option<&Arc<dyn SecretVault>> {
        self.vault.as_ref()
    }

    /// Get a connection from the pool
    #[inline]
    pub fn get_conn(&self) -> DbResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    fn initialize_schema(conn: &Connection) -> DbResult<()> {
        conn.execute_batch(include_str!("schema.sql"))?;
        Self::run_migrations(conn)
    }

    // =========================================================================
    // MIGRATIONS
    // =========================================================================

    /// Run migrations for existing databases
    ///
    /// Early builds stored only `id, issuer, account_name` and kept the secret
    /// in the platform keystore. Those tables gain the inline secret and the
    /// sync bookkeeping columns here. Migrated rows start out synced with a
    /// blank secret, so the server copy replaces them and nothing blank is
    /// pushed; an attached vault can restore them first.
    fn run_migrations(conn: &Connection) -> DbResult<()> {
        let legacy = !has_column(conn, "accounts", "secret")?;

        if legacy {
            log::info!("Running migration: Adding secret column to accounts");
            conn.execute("ALTER TABLE accounts ADD COLUMN secret TEXT NOT NULL DEFAULT ''", [])?;
        }

        if !has_column(conn, "accounts", "is_deleted")? {
            log::info!("Running migration: Adding is_deleted column to accounts");
            conn.execute("ALTER TABLE accounts ADD COLUMN is_deleted INTEGER NOT NULL DEFAULT 0", [])?;
        }

        if !has_column(conn, "accounts", "last_change_time")? {
            log::info!("Running migration: Adding last_change_time column to accounts");
            // ALTER TABLE only accepts constant defaults
            conn.execute("ALTER TABLE accounts ADD COLUMN last_change_time INTEGER NOT NULL DEFAULT 0", [])?;
            conn.execute(
                "UPDATE accounts SET last_change_time = ?1",
                params![now().timestamp_millis()],
            )?;
        }

        if !has_column(conn, "accounts", "last_sync_time")? {
            log::info!("Running migration: Adding last_sync_time column to accounts");
            conn.execute("ALTER TABLE accounts ADD COLUMN last_sync_time INTEGER", [])?;
        }

        if legacy {
            let adopted = conn.execute(
                "UPDATE accounts SET last_sync_time = last_change_time WHERE secret = ''",
                [],
            )?;
            log::info!("Migration: {} legacy accounts waiting for their secret", adopted);
        }

        if !has_index(conn, "idx_accounts_active_key")? {
            // Old builds never enforced key uniqueness; keep the oldest live row
            let collapsed = conn.execute(
                r#"
                UPDATE accounts SET is_deleted = 1, last_sync_time = last_change_time
                WHERE is_deleted = 0 AND id NOT IN (
                    SELECT MIN(id) FROM accounts
                    WHERE is_deleted = 0
                    GROUP BY COALESCE(issuer, ''), account_name
                )
                "#,
                [],
            )?;
            if collapsed > 0 {
                log::warn!("Migration: tombstoned {} duplicate accounts", collapsed);
            }
        }

        conn.execute_batch(r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_accounts_active_key
                ON accounts(COALESCE(issuer, ''), account_name) WHERE is_deleted = 0;

            CREATE INDEX IF NOT EXISTS idx_accounts_sync
                ON accounts(last_change_time, last_sync_time);
        "#)?;

        Ok(())
    }

    // =========================================================================
    // SETTINGS
    // =========================================================================

    /// Get a setting value
    pub fn get_setting<T: serde::de::DeserializeOwned>(&self, key: &str) -> DbResult<Option<T>> {
        let conn = self.get_conn()?;
        let result: Result<String, _> = conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            [key],
            |row| row.get(0),
        );

        match result {
            Ok(json) => {
                let value: T = serde_json::from_str(&json)
                    .map_err(|e| DbError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Set a setting value
    pub fn set_setting<T: Serialize>(&self, key: &str, value: &T) -> DbResult<()> {
        let conn = self.get_conn()?;
        let json = serde_json::to_string(value)
            .map_err(|e| DbError::Serialization(e.to_string()))?;

        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, json],
        )?;

        Ok(())
    }

    // =========================================================================
    // HELPER METHODS (for history module and other internal use)
    // =========================================================================

    /// Execute a SQL statement and return affected rows
    pub fn execute<P>(&self, sql: &str, params: P) -> DbResult<usize>
    where
        P: rusqlite::Params,
    {
        let conn = self.get_conn()?;

        let affected = conn.execute(sql, params)?;
        Ok(affected)
    }

    /// Execute an INSERT statement and return the last inserted row ID
    pub fn execute_insert<P>(&self, sql: &str, params: P) -> DbResult<i64>
    where
        P: rusqlite::Params,
    {
        let conn = self.get_conn()?;

        conn.execute(sql, params)?;
        Ok(conn.last_insert_rowid())
    }

    /// Query database and map results
    pub fn query<T, P, F>(&self, sql: &str, params: P, f: F) -> DbResult<Vec<T>>
    where
        P: rusqlite::Params,
        F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.get_conn()?;

        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, f)?;

        rows.collect::<rusqlite::Result<Vec<T>>>()
            .map_err(DbError::from)
    }

    /// Query single row
    pub fn query_row<T, P, F>(&self, sql: &str, params: P, f: F) -> DbResult<T>
    where
        P: rusqlite::Params,
        F: FnOnce(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.get_conn()?;

        conn.query_row(sql, params, f).map_err(DbError::from)
    }
}

fn has_column(conn: &Connection, table: &str, column: &str) -> DbResult<bool> {
    let found: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM pragma_table_info(?1) WHERE name = ?2",
        params![table, column],
        |row| row.get(0),
    )?;
    Ok(found)
}

fn has_index(conn: &Connection, name: &str) -> DbResult<bool> {
    let found: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'index' AND name = ?1",
        [name],
        |row| row.get(0),
    )?;
    Ok(found)
}

/// Current time truncated to the millisecond precision stored on disk
pub fn now() -> DateTime<Utc> {
    let now = Utc::now();
    Utc.timestamp_millis_opt(now.timestamp_millis())
        .single()
        .unwrap_or(now)
}

/// Decode a millisecond column value
pub(crate) fn millis_to_time(column: usize, millis: i64) -> rusqlite::Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(column, millis))
}
