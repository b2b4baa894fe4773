//! Append-only measurement history and its read-side queries.

use chrono::{DateTime, Utc};
use ratiowatch_core::{competition_ratio, IdentityTuple, Measurement, Observation};
use serde::Serialize;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::{begin_write, decode_count, decode_ts, decode_uuid, encode_ts};
use crate::resolver::EntityResolver;
use crate::{Store, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFailure {
    pub index: usize,
    pub sub_unit: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub saved: usize,
    /// Records whose source could not be resolved.
    pub unresolved: usize,
    /// Records lost to a storage error.
    pub failed: usize,
    pub failures: Vec<RecordFailure>,
}

/// Filters for [`SnapshotStore::history`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct MeasurementQuery {
    pub source: Option<String>,
    pub unit: Option<String>,
    pub sub_unit: Option<String>,
    pub label: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

/// A measurement joined with the names of its identity tuple.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasurementRow {
    pub id: i64,
    pub source_code: String,
    pub unit_name: String,
    pub sub_unit_name: String,
    pub sub_unit_is_target: bool,
    pub label: String,
    pub label_category: String,
    pub capacity: u32,
    pub applicants: u32,
    pub ratio: f64,
    pub observed_at: DateTime<Utc>,
    pub session_id: Uuid,
}

#[derive(sqlx::FromRow)]
struct RawMeasurementRow {
    id: i64,
    source_code: String,
    unit_name: String,
    sub_unit_name: String,
    is_target: bool,
    label: String,
    category: String,
    capacity: i64,
    applicants: i64,
    ratio: f64,
    observed_at: String,
    session_id: String,
}

impl TryFrom<RawMeasurementRow> for MeasurementRow {
    type Error = StoreError;

    fn try_from(raw: RawMeasurementRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: raw.id,
            source_code: raw.source_code,
            unit_name: raw.unit_name,
            sub_unit_name: raw.sub_unit_name,
            sub_unit_is_target: raw.is_target,
            label: raw.label,
            label_category: raw.category,
            capacity: decode_count(raw.capacity)?,
            applicants: decode_count(raw.applicants)?,
            ratio: raw.ratio,
            observed_at: decode_ts(&raw.observed_at)?,
            session_id: decode_uuid(&raw.session_id)?,
        })
    }
}

const SELECT_ROWS: &str = "SELECT m.id, s.code AS source_code, u.name AS unit_name, \
     su.name AS sub_unit_name, su.is_target AS is_target, l.name AS label, l.category AS category, \
     m.capacity, m.applicants, m.ratio, m.observed_at, m.session_id \
     FROM measurements m \
     JOIN sources s ON s.id = m.source_id \
     JOIN units u ON u.id = m.unit_id \
     JOIN sub_units su ON su.id = m.sub_unit_id \
     JOIN labels l ON l.id = m.label_id";

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    pool: SqlitePool,
}

impl SnapshotStore {
    pub fn new(store: &Store) -> Self {
        Self {
            pool: store.pool().clone(),
        }
    }

    /// Inserts one immutable row stamped with the current time. Never touches existing rows.
    pub async fn append(
        conn: &mut SqliteConnection,
        identity: &IdentityTuple,
        capacity: u32,
        applicants: u32,
        session_id: Uuid,
    ) -> Result<Measurement, StoreError> {
        let observed_at = Utc::now();
        let id = sqlx::query(
            "INSERT INTO measurements \
             (source_id, unit_id, sub_unit_id, label_id, capacity, applicants, observed_at, session_id) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(identity.source.0)
        .bind(identity.unit.0)
        .bind(identity.sub_unit.0)
        .bind(identity.label.0)
        .bind(i64::from(capacity))
        .bind(i64::from(applicants))
        .bind(encode_ts(observed_at))
        .bind(session_id.to_string())
        .execute(&mut *conn)
        .await?
        .last_insert_rowid();

        Ok(Measurement {
            id,
            identity: *identity,
            capacity,
            applicants,
            observed_at,
            session_id,
        })
    }

    /// Resolves and appends each observation in its own transaction. A failing record is
    /// counted and logged; the rest of the batch still goes in.
    pub async fn save_batch(&self, session_id: Uuid, observations: &[Observation]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for (index, observation) in observations.iter().enumerate() {
            match self.save_one(session_id, observation).await {
                Ok(measurement) => {
                    debug!(
                        id = measurement.id,
                        sub_unit = %observation.sub_unit_name,
                        label = %observation.label,
                        ratio = measurement.ratio(),
                        "measurement appended"
                    );
                    outcome.saved += 1;
                }
                Err(err) => {
                    warn!(
                        %session_id,
                        index,
                        sub_unit = %observation.sub_unit_name,
                        error = %err,
                        "record not saved"
                    );
                    match &err {
                        StoreError::UnknownSource(_) => outcome.unresolved += 1,
                        _ => outcome.failed += 1,
                    }
                    outcome.failures.push(RecordFailure {
                        index,
                        sub_unit: observation.sub_unit_name.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        outcome
    }

    async fn save_one(&self, session_id: Uuid, observation: &Observation) -> Result<Measurement, StoreError> {
        let mut tx = begin_write(&self.pool).await?;
        let identity = EntityResolver::new(&mut *tx).resolve(observation).await?;
        let measurement = Self::append(
            &mut *tx,
            &identity,
            observation.capacity,
            observation.applicants,
            session_id,
        )
        .await?;
        tx.commit().await?;
        Ok(measurement)
    }

    /// Matching rows in observation order.
    pub async fn history(&self, query: &MeasurementQuery) -> Result<Vec<MeasurementRow>, StoreError> {
        let mut builder = QueryBuilder::<Sqlite>::new(SELECT_ROWS);
        builder.push(" WHERE 1 = 1");
        if let Some(source) = &query.source {
            builder.push(" AND s.code = ").push_bind(source.clone());
        }
        if let Some(unit) = &query.unit {
            builder.push(" AND u.name = ").push_bind(unit.clone());
        }
        if let Some(sub_unit) = &query.sub_unit {
            builder.push(" AND su.name = ").push_bind(sub_unit.clone());
        }
        if let Some(label) = &query.label {
            builder.push(" AND l.name = ").push_bind(label.clone());
        }
        if let Some(since) = query.since {
            builder.push(" AND m.observed_at >= ").push_bind(encode_ts(since));
        }
        if let Some(until) = query.until {
            builder.push(" AND m.observed_at < ").push_bind(encode_ts(until));
        }
        builder.push(" ORDER BY m.observed_at, m.id");

        builder
            .build_query_as::<RawMeasurementRow>()
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(MeasurementRow::try_from)
            .collect()
    }

    /// Newest row per identity tuple.
    pub async fn latest_measurements(&self) -> Result<Vec<MeasurementRow>, StoreError> {
        let sql = format!(
            "{SELECT_ROWS} WHERE m.id IN \
             (SELECT MAX(id) FROM measurements GROUP BY source_id, unit_id, sub_unit_id, label_id) \
             ORDER BY s.code, u.name, su.name, l.name"
        );
        sqlx::query_as::<_, RawMeasurementRow>(&sql)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(MeasurementRow::try_from)
            .collect()
    }

    pub async fn count_for_session(&self, session_id: Uuid) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM measurements WHERE session_id = ?")
            .bind(session_id.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

impl MeasurementRow {
    /// Recomputed from the counts; always equal to the stored `ratio` column.
    pub fn derived_ratio(&self) -> f64 {
        competition_ratio(self.capacity, self.applicants)
    }
}
