use adpulse_core::blocking::{BlockingEvent, BlockingKind, EventFilter, Severity};
use adpulse_core::error::AppError;
use adpulse_core::traits::EventStore;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

/// Durable store for blocking events in PostgreSQL.
#[derive(Clone)]
pub struct BlockingEventRepository {
    pool: Pool<Postgres>,
}

impl BlockingEventRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, event: &BlockingEvent) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO blocking_events
                (id, occurred_at, kind, severity, retry_after_seconds,
                 user_agent, source_ip, subject_id, message)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(event.id)
        .bind(event.timestamp)
        .bind(event.kind.as_str())
        .bind(event.severity.as_str())
        .bind(event.retry_after_seconds)
        .bind(&event.user_agent)
        .bind(&event.source_ip)
        .bind(&event.subject_id)
        .bind(&event.message)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    /// Events matching `filter`, oldest first.
    pub async fn find(&self, filter: &EventFilter) -> Result<Vec<BlockingEvent>, AppError> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT id, occurred_at, kind, severity, retry_after_seconds,
                   user_agent, source_ip, subject_id, message
            FROM blocking_events
            WHERE ($1::timestamptz IS NULL OR occurred_at >= $1)
              AND ($2::timestamptz IS NULL OR occurred_at < $2)
              AND ($3::text IS NULL OR kind = $3)
            ORDER BY occurred_at ASC
            "#,
        )
        .bind(filter.since)
        .bind(filter.before)
        .bind(filter.kind.map(|k| k.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Delete events matching `filter`. Returns the number removed.
    pub async fn delete_many(&self, filter: &EventFilter) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            DELETE FROM blocking_events
            WHERE ($1::timestamptz IS NULL OR occurred_at >= $1)
              AND ($2::timestamptz IS NULL OR occurred_at < $2)
              AND ($3::text IS NULL OR kind = $3)
            "#,
        )
        .bind(filter.since)
        .bind(filter.before)
        .bind(filter.kind.map(|k| k.as_str()))
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected())
    }
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct EventRow {
    id: Uuid,
    occurred_at: DateTime<Utc>,
    kind: String,
    severity: String,
    retry_after_seconds: Option<f64>,
    user_agent: Option<String>,
    source_ip: Option<String>,
    subject_id: Option<String>,
    message: Option<String>,
}

impl TryFrom<EventRow> for BlockingEvent {
    type Error = AppError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let kind: BlockingKind = row.kind.parse().map_err(AppError::DatabaseError)?;
        let severity: Severity = row.severity.parse().map_err(AppError::DatabaseError)?;
        Ok(BlockingEvent {
            id: row.id,
            timestamp: row.occurred_at,
            kind,
            severity,
            retry_after_seconds: row.retry_after_seconds,
            user_agent: row.user_agent,
            source_ip: row.source_ip,
            subject_id: row.subject_id,
            message: row.message,
        })
    }
}

// -- Trait implementation --

impl EventStore for BlockingEventRepository {
    async fn insert(&self, event: &BlockingEvent) -> Result<(), AppError> {
        BlockingEventRepository::insert(self, event).await
    }

    async fn find(&self, filter: &EventFilter) -> Result<Vec<BlockingEvent>, AppError> {
        BlockingEventRepository::find(self, filter).await
    }

    async fn delete_many(&self, filter: &EventFilter) -> Result<u64, AppError> {
        BlockingEventRepository::delete_many(self, filter).await
    }
}
