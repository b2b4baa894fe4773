//! Store handle: pool setup, migrations, and base data seeding.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use ratiowatch_core::SourceProfile;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use crate::StoreError;

/// Shared handle over one SQLite database. Cloning shares the pool.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens (creating if missing) the database at `database_url` and applies migrations.
    pub async fn open(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        info!(database_url, "store opened");
        Self::migrated(pool).await
    }

    /// Private in-memory database. One pinned connection, since each new
    /// connection to `:memory:` would see an empty database.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::migrated(pool).await
    }

    async fn migrated(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::migrate!("../../migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Opens a transaction holding the write lock from the start. A deferred transaction that
/// reads before writing gets SQLITE_BUSY on the upgrade without waiting on `busy_timeout`.
pub(crate) async fn begin_write(pool: &SqlitePool) -> Result<Transaction<'static, Sqlite>, sqlx::Error> {
    pool.begin_with("BEGIN IMMEDIATE").await
}

impl Store {
    pub async fn close(self) {
        self.pool.close().await;
    }

    /// Upserts every configured source, enabled or not, keyed by code.
    pub async fn register_sources(&self, sources: &[SourceProfile]) -> Result<usize, StoreError> {
        let mut tx = begin_write(&self.pool).await?;
        for source in sources {
            sqlx::query(
                "INSERT INTO sources (code, display_name, url, layout) VALUES (?, ?, ?, ?) \
                 ON CONFLICT (code) DO UPDATE SET \
                 display_name = excluded.display_name, url = excluded.url, layout = excluded.layout",
            )
            .bind(&source.code)
            .bind(&source.display_name)
            .bind(&source.url)
            .bind(source.layout.as_str())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(count = sources.len(), "sources registered");
        Ok(sources.len())
    }

    /// Inserts declared labels with their categories. Existing labels keep their category.
    pub async fn seed_labels<'a, I>(&self, labels: I) -> Result<usize, StoreError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut tx = begin_write(&self.pool).await?;
        let mut inserted = 0;
        for (name, category) in labels {
            let result = sqlx::query(
                "INSERT INTO labels (name, category) VALUES (?, ?) ON CONFLICT (name) DO NOTHING",
            )
            .bind(name)
            .bind(category)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected() as usize;
        }
        tx.commit().await?;
        debug!(inserted, "labels seeded");
        Ok(inserted)
    }

    /// Registered source codes in code order.
    pub async fn source_codes(&self) -> Result<Vec<String>, StoreError> {
        Ok(sqlx::query_scalar::<_, String>("SELECT code FROM sources ORDER BY code")
            .fetch_all(&self.pool)
            .await?)
    }
}

/// Row counts per table, for status output and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EntityCounts {
    pub sources: i64,
    pub units: i64,
    pub sub_units: i64,
    pub labels: i64,
    pub measurements: i64,
    pub sessions: i64,
}

impl Store {
    pub async fn entity_counts(&self) -> Result<EntityCounts, StoreError> {
        let (sources, units, sub_units, labels, measurements, sessions) =
            sqlx::query_as::<_, (i64, i64, i64, i64, i64, i64)>(
                "SELECT (SELECT COUNT(*) FROM sources), (SELECT COUNT(*) FROM units), \
                 (SELECT COUNT(*) FROM sub_units), (SELECT COUNT(*) FROM labels), \
                 (SELECT COUNT(*) FROM measurements), (SELECT COUNT(*) FROM ingestion_sessions)",
            )
            .fetch_one(&self.pool)
            .await?;
        Ok(EntityCounts {
            sources,
            units,
            sub_units,
            labels,
            measurements,
            sessions,
        })
    }
}

/// Fixed-width RFC 3339 (microseconds, `Z`), so text order matches time order.
pub(crate) fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn decode_ts(text: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(text)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| StoreError::Corrupt(format!("timestamp {text:?}: {err}")))
}

pub(crate) fn decode_uuid(text: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(text).map_err(|err| StoreError::Corrupt(format!("session id {text:?}: {err}")))
}

pub(crate) fn decode_count(value: i64) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("count {value} out of range")))
}
