// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use thiserror::Error;

pub const POLLING_ENABLED_KEY: &str = "polling_enabled";
pub const POLLING_INTERVAL_KEY: &str = "polling_interval";

/// Smallest polling interval a writer may store.
pub const MIN_POLLING_INTERVAL_SECS: u64 = 10;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("Invalid account status: {0}")]
    InvalidStatus(String),
    #[error("Invalid polling settings: {0}")]
    Settings(#[from] SettingsError),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SettingsError {
    #[error("Interval too small (min {MIN_POLLING_INTERVAL_SECS}s): {0}s")]
    IntervalTooSmall(u64),
}

/// Outcome of the most recent fetch for an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Unknown,
    Success,
    Error,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Unknown => "unknown",
            AccountStatus::Success => "success",
            AccountStatus::Error => "error",
        }
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(AccountStatus::Unknown),
            "success" => Ok(AccountStatus::Success),
            "error" => Ok(AccountStatus::Error),
            other => Err(StorageError::InvalidStatus(other.to_string())),
        }
    }
}

/// An account row as seen by the poller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Account {
    pub id: i64,
    pub address: String,
    #[serde(skip_serializing)]
    pub auth_token: String,
    /// `None` when the row has never been given a status.
    pub status: Option<AccountStatus>,
    pub has_new_mail: bool,
    pub last_identifier: Option<String>,
    pub last_polled_at: Option<DateTime<Utc>>,
}

/// The `(has_new_mail, last_mail_identifier)` column group. Always written
/// together so the flag never describes a different message than the
/// identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMarker {
    pub has_new_mail: bool,
    pub identifier: Option<String>,
}

/// Partial update of an account row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountUpdate {
    pub status: AccountStatus,
    /// `None` leaves the marker columns untouched.
    pub marker: Option<MailMarker>,
    pub polled_at: DateTime<Utc>,
}

impl AccountUpdate {
    pub fn status_only(status: AccountStatus, polled_at: DateTime<Utc>) -> Self {
        Self { status, marker: None, polled_at }
    }

    pub fn with_marker(
        status: AccountStatus,
        has_new_mail: bool,
        identifier: Option<String>,
        polled_at: DateTime<Utc>,
    ) -> Self {
        Self {
            status,
            marker: Some(MailMarker { has_new_mail, identifier }),
            polled_at,
        }
    }
}

/// Polling switch and period, re-read by the scheduler every wake tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSettings {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl PollSettings {
    /// Writer-side constructor; rejects intervals below the minimum.
    pub fn new(enabled: bool, interval_secs: u64) -> Result<Self, SettingsError> {
        if interval_secs < MIN_POLLING_INTERVAL_SECS {
            return Err(SettingsError::IntervalTooSmall(interval_secs));
        }
        Ok(Self { enabled, interval_secs })
    }

    /// Reader-side interpretation of the stored strings. Enabled only for
    /// exactly `"1"`; a missing or unparseable interval uses `default_interval`.
    pub fn from_raw(
        enabled: Option<&str>,
        interval: Option<&str>,
        default_interval: u64,
    ) -> Self {
        let interval_secs = match interval {
            None => default_interval,
            Some(raw) => raw.trim().parse::<u64>().unwrap_or_else(|_| {
                warn!(
                    "Unparseable {} '{}', using {}s",
                    POLLING_INTERVAL_KEY, raw, default_interval
                );
                default_interval
            }),
        };
        Self {
            enabled: enabled == Some("1"),
            interval_secs,
        }
    }
}

/// What the polling core needs from account storage.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// All accounts, minus those whose status equals `exclude_status`.
    /// Rows without a status are always returned.
    async fn list_accounts(
        &self,
        exclude_status: Option<AccountStatus>,
    ) -> Result<Vec<Account>, StorageError>;

    async fn get_account(&self, id: i64) -> Result<Option<Account>, StorageError>;

    async fn read_setting(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Apply `update` to row `id`. Returns `false` when the row no longer exists.
    async fn update_account(&self, id: i64, update: &AccountUpdate) -> Result<bool, StorageError>;
}

#[derive(sqlx::FromRow)]
struct AccountRow {
    id: i64,
    email: String,
    auth_code: String,
    status: Option<String>,
    has_new_mail: bool,
    last_mail_identifier: Option<String>,
    last_polled_at: Option<DateTime<Utc>>,
}

impl From<AccountRow> for Account {
    fn from(row: AccountRow) -> Self {
        let status = row.status.as_deref().map(|raw| {
            raw.parse().unwrap_or_else(|e| {
                warn!("Account {}: {}, treating as unknown", row.id, e);
                AccountStatus::Unknown
            })
        });
        Account {
            id: row.id,
            address: row.email,
            auth_token: row.auth_code,
            status,
            has_new_mail: row.has_new_mail,
            last_identifier: row.last_mail_identifier,
            last_polled_at: row.last_polled_at,
        }
    }
}

const ACCOUNT_COLUMNS: &str =
    "id, email, auth_code, status, has_new_mail, last_mail_identifier, last_polled_at";

/// SQLite-backed [`AccountStore`].
#[derive(Debug, Clone)]
pub struct SqliteAccountStore {
    pool: SqlitePool,
}

impl SqliteAccountStore {
    /// Open (creating if needed) the database at `database_url` and run migrations.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        info!("Opening account store: {}", database_url);

        let in_memory = database_url.contains(":memory:");
        if !in_memory {
            let db_path = database_url
                .trim_start_matches("sqlite://")
                .trim_start_matches("sqlite:");
            if let Some(parent) = std::path::Path::new(db_path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
                }
            }
        }

        let options = database_url.parse::<SqliteConnectOptions>()?.create_if_missing(true);
        // Every connection to :memory: is its own database
        let mut pool_options =
            SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 5 });
        if in_memory {
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }
        let pool = pool_options.connect_with(options).await?;

        let store = Self::from_pool(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn write_setting(&self, key: &str, value: &str) -> Result<(), StorageError> {
        sqlx::query("INSERT OR REPLACE INTO system_settings (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn save_poll_settings(&self, settings: &PollSettings) -> Result<(), StorageError> {
        if settings.interval_secs < MIN_POLLING_INTERVAL_SECS {
            return Err(SettingsError::IntervalTooSmall(settings.interval_secs).into());
        }
        let mut tx = self.pool.begin().await?;
        for (key, value) in [
            (POLLING_ENABLED_KEY, if settings.enabled { "1" } else { "0" }.to_string()),
            (POLLING_INTERVAL_KEY, settings.interval_secs.to_string()),
        ] {
            sqlx::query("INSERT OR REPLACE INTO system_settings (key, value) VALUES (?, ?)")
                .bind(key)
                .bind(value)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        info!(
            "Polling settings saved: enabled={}, interval={}s",
            settings.enabled, settings.interval_secs
        );
        Ok(())
    }

    pub async fn insert_account(
        &self,
        address: &str,
        auth_token: &str,
    ) -> Result<i64, StorageError> {
        let result = sqlx::query("INSERT INTO accounts (email, auth_code) VALUES (?, ?)")
            .bind(address)
            .bind(auth_token)
            .execute(&self.pool)
            .await?;
        let id = result.last_insert_rowid();
        debug!("Inserted account {} ({})", id, address);
        Ok(id)
    }

    /// Every account, accounts with unread new mail first.
    pub async fn all_accounts(&self) -> Result<Vec<Account>, StorageError> {
        let rows: Vec<AccountRow> = sqlx::query_as(&format!(
            "SELECT {} FROM accounts ORDER BY has_new_mail DESC, id DESC",
            ACCOUNT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Account::from).collect())
    }
}

#[async_trait]
impl AccountStore for SqliteAccountStore {
    async fn list_accounts(
        &self,
        exclude_status: Option<AccountStatus>,
    ) -> Result<Vec<Account>, StorageError> {
        let rows: Vec<AccountRow> = sqlx::query_as(&format!(
            "SELECT {} FROM accounts \
             WHERE ?1 IS NULL OR status IS NULL OR status != ?1 ORDER BY id",
            ACCOUNT_COLUMNS
        ))
        .bind(exclude_status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Account::from).collect())
    }

    async fn get_account(&self, id: i64) -> Result<Option<Account>, StorageError> {
        let row: Option<AccountRow> =
            sqlx::query_as(&format!("SELECT {} FROM accounts WHERE id = ?", ACCOUNT_COLUMNS))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Account::from))
    }

    async fn read_setting(&self, key: &str) -> Result<Option<String>, StorageError> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM system_settings WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value)
    }

    async fn update_account(
        &self,
        id: i64,
        update: &AccountUpdate,
    ) -> Result<bool, StorageError> {
        // One statement: status, flag and identifier change together or not at all
        let (has_marker, has_new_mail, identifier) = match &update.marker {
            Some(marker) => (true, marker.has_new_mail, marker.identifier.as_deref()),
            None => (false, false, None),
        };

        let result = sqlx::query(
            r#"
            UPDATE accounts SET
                status = ?1,
                has_new_mail = CASE WHEN ?2 THEN ?3 ELSE has_new_mail END,
                last_mail_identifier = CASE WHEN ?2 THEN ?4 ELSE last_mail_identifier END,
                last_polled_at = ?5
            WHERE id = ?6
            "#,
        )
        .bind(update.status.as_str())
        .bind(has_marker)
        .bind(has_new_mail)
        .bind(identifier)
        .bind(update.polled_at)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
