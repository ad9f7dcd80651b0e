//! SQLite-backed tenant record store.
//!
//! Migration is applied inline via `include_str!` on open. Reads and writes go
//! straight through the pool; tenant mutations are low-frequency.

use std::path::Path;

use anyhow::Context;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::debug;

use super::{join_subscriptions, parse_event_column, EventKind, TenantError, TenantRecord};

/// Row shape shared by every `SELECT` in this module.
type TenantRow = (i64, String, String, String, String, String, i64, String);

const SELECT_COLUMNS: &str =
    "SELECT id, name, token, webhook, jid, qrcode, connected, events FROM tenants";

/// Durable tenant storage.
#[derive(Debug, Clone)]
pub struct TenantStore {
    pool: SqlitePool,
}

impl TenantStore {
    /// Open (or create) the tenant database at `path` and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory, database or migration fails.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(3))
            .pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open tenant db at {}", path.display()))?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Wrap an existing pool. The caller is responsible for [`migrate`](Self::migrate).
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Apply the tenant schema. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the migration SQL fails.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        let migration_sql = include_str!("../../migrations/001_tenants.sql");
        sqlx::raw_sql(migration_sql)
            .execute(&self.pool)
            .await
            .context("failed to apply tenant schema migration")?;
        Ok(())
    }

    /// Underlying pool, for diagnostics.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Look up a tenant by auth token.
    ///
    /// # Errors
    ///
    /// Returns [`TenantError::Database`] if the query fails.
    pub async fn find_by_token(&self, token: &str) -> Result<Option<TenantRecord>, TenantError> {
        let row: Option<TenantRow> =
            sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE token = ?1 LIMIT 1"))
                .bind(token)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(into_record))
    }

    /// Look up a tenant by id.
    ///
    /// # Errors
    ///
    /// Returns [`TenantError::Database`] if the query fails.
    pub async fn find_by_id(&self, id: i64) -> Result<Option<TenantRecord>, TenantError> {
        let row: Option<TenantRow> =
            sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE id = ?1 LIMIT 1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(into_record))
    }

    /// All tenants whose persisted `connected` flag is set.
    ///
    /// # Errors
    ///
    /// Returns [`TenantError::Database`] if the query fails.
    pub async fn connected_tenants(&self) -> Result<Vec<TenantRecord>, TenantError> {
        let rows: Vec<TenantRow> =
            sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE connected = 1 ORDER BY id"))
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(into_record).collect())
    }

    /// Persist the network identity assigned by pairing.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails or no row matched.
    pub async fn set_network_identity(&self, id: i64, identity: &str) -> Result<(), TenantError> {
        self.update_text(id, "UPDATE tenants SET jid = ?1 WHERE id = ?2", identity)
            .await
    }

    /// Persist the webhook URL (empty string clears it).
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails or no row matched.
    pub async fn set_webhook(&self, id: i64, url: &str) -> Result<(), TenantError> {
        self.update_text(id, "UPDATE tenants SET webhook = ?1 WHERE id = ?2", url)
            .await
    }

    /// Persist the subscription list.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails or no row matched.
    pub async fn set_events(&self, id: i64, events: &[EventKind]) -> Result<(), TenantError> {
        let column = join_subscriptions(events);
        self.update_text(id, "UPDATE tenants SET events = ?1 WHERE id = ?2", &column)
            .await
    }

    /// Persist the pairing artifact (empty string clears it).
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails or no row matched.
    pub async fn set_pairing_code(&self, id: i64, code: &str) -> Result<(), TenantError> {
        self.update_text(id, "UPDATE tenants SET qrcode = ?1 WHERE id = ?2", code)
            .await
    }

    /// Persist the connection flag.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails or no row matched.
    pub async fn set_connected(&self, id: i64, connected: bool) -> Result<(), TenantError> {
        let result = sqlx::query("UPDATE tenants SET connected = ?1 WHERE id = ?2")
            .bind(i64::from(connected))
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(TenantError::NotFound(id));
        }
        debug!(tenant_id = id, connected, "connection flag persisted");
        Ok(())
    }

    /// Read the current pairing artifact.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the tenant does not exist.
    pub async fn pairing_code(&self, id: i64) -> Result<String, TenantError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT qrcode FROM tenants WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|(code,)| code).ok_or(TenantError::NotFound(id))
    }

    async fn update_text(&self, id: i64, sql: &str, value: &str) -> Result<(), TenantError> {
        let result = sqlx::query(sql)
            .bind(value)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(TenantError::NotFound(id));
        }
        Ok(())
    }
}

fn into_record(row: TenantRow) -> TenantRecord {
    let (id, name, token, webhook_url, jid, pairing_code, connected, events) = row;
    TenantRecord {
        id,
        name,
        token,
        network_identity: (!jid.is_empty()).then_some(jid),
        webhook_url,
        events: parse_event_column(&events),
        connected: connected != 0,
        pairing_code,
    }
}
