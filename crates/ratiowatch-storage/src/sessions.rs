//! Ingestion session lifecycle: one RUNNING row per attempt, finalized exactly once.

use chrono::{DateTime, Utc};
use ratiowatch_core::{IngestionSession, SessionStatus};
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{decode_count, decode_ts, decode_uuid, encode_ts};
use crate::resolver::EntityResolver;
use crate::{Store, StoreError};

#[derive(sqlx::FromRow)]
struct RawSession {
    id: String,
    source_code: String,
    started_at: String,
    finished_at: Option<String>,
    status: String,
    records_collected: i64,
    error_message: Option<String>,
}

impl TryFrom<RawSession> for IngestionSession {
    type Error = StoreError;

    fn try_from(raw: RawSession) -> Result<Self, Self::Error> {
        Ok(Self {
            id: decode_uuid(&raw.id)?,
            source_code: raw.source_code,
            started_at: decode_ts(&raw.started_at)?,
            finished_at: raw.finished_at.as_deref().map(decode_ts).transpose()?,
            status: raw.status.parse()?,
            records_collected: decode_count(raw.records_collected)?,
            error_message: raw.error_message,
        })
    }
}

const SELECT_SESSIONS: &str = "SELECT i.id, s.code AS source_code, i.started_at, i.finished_at, \
     i.status, i.records_collected, i.error_message \
     FROM ingestion_sessions i JOIN sources s ON s.id = i.source_id";

#[derive(Debug, Clone)]
pub struct SessionTracker {
    pool: SqlitePool,
}

impl SessionTracker {
    pub fn new(store: &Store) -> Self {
        Self {
            pool: store.pool().clone(),
        }
    }

    /// Opens a RUNNING session for a registered source.
    pub async fn begin(&self, source_code: &str) -> Result<Uuid, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let source = EntityResolver::new(&mut *conn).source_id(source_code).await?;
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO ingestion_sessions (id, source_id, started_at, status) VALUES (?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(source.0)
        .bind(encode_ts(Utc::now()))
        .bind(SessionStatus::Running.as_str())
        .execute(&mut *conn)
        .await?;
        info!(session_id = %id, source_code, "session started");
        Ok(id)
    }

    pub async fn complete(&self, id: Uuid, records: u32) -> Result<IngestionSession, StoreError> {
        self.finalize(id, SessionStatus::Completed, records, None).await
    }

    pub async fn fail(&self, id: Uuid, detail: &str) -> Result<IngestionSession, StoreError> {
        self.finalize(id, SessionStatus::Failed, 0, Some(detail)).await
    }

    async fn finalize(
        &self,
        id: Uuid,
        status: SessionStatus,
        records: u32,
        detail: Option<&str>,
    ) -> Result<IngestionSession, StoreError> {
        debug_assert!(SessionStatus::Running.can_transition_to(status));
        let updated = sqlx::query(
            "UPDATE ingestion_sessions \
             SET finished_at = ?, status = ?, records_collected = ?, error_message = ? \
             WHERE id = ? AND status = 'RUNNING'",
        )
        .bind(encode_ts(Utc::now()))
        .bind(status.as_str())
        .bind(i64::from(records))
        .bind(detail)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return match self.get(id).await? {
                Some(existing) => {
                    warn!(session_id = %id, current = %existing.status, requested = %status, "session already finalized");
                    Err(StoreError::SessionAlreadyFinalized {
                        id,
                        status: existing.status,
                    })
                }
                None => Err(StoreError::UnknownSession(id)),
            };
        }

        let session = self.get(id).await?.ok_or(StoreError::UnknownSession(id))?;
        info!(
            session_id = %id,
            source_code = %session.source_code,
            status = %session.status,
            records = session.records_collected,
            "session finalized"
        );
        Ok(session)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<IngestionSession>, StoreError> {
        let sql = format!("{SELECT_SESSIONS} WHERE i.id = ?");
        sqlx::query_as::<_, RawSession>(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .map(IngestionSession::try_from)
            .transpose()
    }

    /// Sessions for one source, newest first, optionally only those started at or after `since`.
    pub async fn sessions_for_source(
        &self,
        source_code: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<IngestionSession>, StoreError> {
        let sql = format!(
            "{SELECT_SESSIONS} WHERE s.code = ? AND (? IS NULL OR i.started_at >= ?) \
             ORDER BY i.started_at DESC, i.rowid DESC"
        );
        let since = since.map(encode_ts);
        sqlx::query_as::<_, RawSession>(&sql)
            .bind(source_code)
            .bind(since.clone())
            .bind(since)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(IngestionSession::try_from)
            .collect()
    }

    /// Most recent sessions across all sources.
    pub async fn recent(&self, limit: u32) -> Result<Vec<IngestionSession>, StoreError> {
        let sql = format!("{SELECT_SESSIONS} ORDER BY i.started_at DESC, i.rowid DESC LIMIT ?");
        sqlx::query_as::<_, RawSession>(&sql)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(IngestionSession::try_from)
            .collect()
    }

    /// Every session in start order.
    pub async fn all(&self) -> Result<Vec<IngestionSession>, StoreError> {
        let sql = format!("{SELECT_SESSIONS} ORDER BY i.started_at, i.rowid");
        sqlx::query_as::<_, RawSession>(&sql)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(IngestionSession::try_from)
            .collect()
    }
}
