use super::{Alarm, AlarmFilter, AlarmStore};
use crate::batch::{Channel, SourceId};
use crate::error::StoreError;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder, Transaction};

const UNIQUE_VIOLATION: &str = "23505";

#[derive(Clone, Debug)]
pub struct PgAlarmStore {
    pool: PgPool,
    serializable: bool,
}

#[derive(Debug, FromRow)]
struct AlarmRow {
    timestamp_created: DateTime<Utc>,
    score: f64,
    segment_begin: DateTime<Utc>,
    segment_end: DateTime<Utc>,
    source_id: String,
    channel_kind: String,
}

impl TryFrom<AlarmRow> for Alarm {
    type Error = StoreError;

    fn try_from(row: AlarmRow) -> Result<Self, Self::Error> {
        let source_id = SourceId::parse(&row.source_id)
            .map_err(|err| StoreError::Backend(format!("stored alarm row: {err}")))?;
        let channel = row
            .channel_kind
            .parse::<Channel>()
            .map_err(|err| StoreError::Backend(format!("stored alarm row: {err}")))?;
        Ok(Alarm {
            timestamp_created: row.timestamp_created,
            score: row.score,
            segment_begin: row.segment_begin,
            segment_end: row.segment_end,
            source_id,
            channel,
        })
    }
}

impl PgAlarmStore {
    pub fn new(pool: PgPool, serializable: bool) -> Self {
        Self { pool, serializable }
    }

    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        serializable: bool,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(map_sqlx_error)?;
        Ok(Self::new(pool, serializable))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        tracing::info!("ensuring health_alarms schema");
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS health_alarms (
                id bigserial primary key,
                timestamp_created timestamptz not null,
                score double precision not null,
                segment_begin timestamptz not null,
                segment_end timestamptz not null,
                source_id text not null,
                channel_kind text not null,
                UNIQUE (source_id, channel_kind, segment_begin, segment_end)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS health_alarms_created_idx ON health_alarms (timestamp_created, id)",
        )
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn begin(&self, read_only: bool) -> Result<Transaction<'static, Postgres>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let statement = match (self.serializable, read_only) {
            (true, true) => Some("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE READ ONLY"),
            (true, false) => Some("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE"),
            (false, true) => Some("SET TRANSACTION READ ONLY"),
            (false, false) => None,
        };
        if let Some(statement) = statement {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
        }
        Ok(tx)
    }
}

#[tonic::async_trait]
impl AlarmStore for PgAlarmStore {
    async fn insert(&self, alarm: &Alarm) -> Result<(), StoreError> {
        // Dropping the transaction on any early return rolls it back.
        let mut tx = self.begin(false).await?;
        let result = sqlx::query(
            r#"
            INSERT INTO health_alarms
                (timestamp_created, score, segment_begin, segment_end, source_id, channel_kind)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(alarm.timestamp_created)
        .bind(alarm.score)
        .bind(alarm.segment_begin)
        .bind(alarm.segment_end)
        .bind(alarm.source_id.as_str())
        .bind(alarm.channel.as_str())
        .execute(&mut *tx)
        .await;

        if let Err(err) = result {
            if is_unique_violation(&err) {
                return Err(alarm.duplicate_error());
            }
            return Err(map_sqlx_error(err));
        }

        tx.commit().await.map_err(|err| {
            if is_unique_violation(&err) {
                alarm.duplicate_error()
            } else {
                map_sqlx_error(err)
            }
        })
    }

    async fn query(&self, filter: &AlarmFilter) -> Result<Vec<Alarm>, StoreError> {
        let mut tx = self.begin(true).await?;

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT timestamp_created, score, segment_begin, segment_end, source_id, channel_kind \
             FROM health_alarms WHERE timestamp_created >= ",
        );
        builder.push_bind(filter.since);
        if let Some(source_id) = &filter.source_id {
            builder
                .push(" AND source_id = ")
                .push_bind(source_id.as_str().to_string());
        }
        if let Some(channel) = filter.channel {
            builder.push(" AND channel_kind = ").push_bind(channel.as_str());
        }
        builder.push(" ORDER BY timestamp_created ASC, id ASC");

        let rows: Vec<AlarmRow> = builder
            .build_query_as::<AlarmRow>()
            .fetch_all(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        tx.commit().await.map_err(map_sqlx_error)?;

        rows.into_iter().map(Alarm::try_from).collect()
    }

    async fn close(&self) {
        if self.pool.is_closed() {
            tracing::debug!("alarm store pool already closed");
            return;
        }
        self.pool.close().await;
        tracing::info!("alarm store pool closed");
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION))
}

fn is_transient_sqlstate(code: &str) -> bool {
    matches!(code, "40001" | "40P01")
        || code.starts_with("08")
        || code.starts_with("53")
        || code.starts_with("57P")
}

fn map_sqlx_error(err: sqlx::Error) -> StoreError {
    let transient = match &err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| is_transient_sqlstate(&code))
            .unwrap_or(false),
        _ => false,
    };
    if transient {
        StoreError::StorageUnavailable(err.to_string())
    } else {
        StoreError::Backend(err.to_string())
    }
}
