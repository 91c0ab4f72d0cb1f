//! Postgres-backed record ledger.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;

use relay_core::{ExecutionRecord, RecordId, RecordState, RetryPolicy, SagaStep, WorkKind};
use relay_engine::{Ledger, LedgerError};

/// Record persistence on Postgres.
///
/// `save` is a plain upsert on the primary key. The archive move is a single
/// `DELETE .. RETURNING` feeding an `INSERT`, so a record is never visible in
/// both tables and never lost between them.
///
/// The engine's [`Ledger`] trait is synchronous; this implementation owns a
/// current-thread tokio runtime and bridges every call with `block_on`. The
/// runtime is shared by all callers, which serializes driver work but keeps
/// the engine free of async plumbing.
pub struct PostgresLedger {
    pool: PgPool,
    rt: tokio::runtime::Runtime,
}

impl PostgresLedger {
    pub fn new(pool: PgPool) -> Result<Self, LedgerError> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| LedgerError::Storage(format!("failed to build runtime: {e}")))?;
        Ok(Self { pool, rt })
    }

    /// Connect to `url`, apply the schema, and return a ready ledger.
    pub fn connect(url: &str, max_connections: u32) -> Result<Self, LedgerError> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| LedgerError::Storage(format!("failed to build runtime: {e}")))?;
        let pool = rt
            .block_on(async {
                let pool = PgPoolOptions::new()
                    .max_connections(max_connections)
                    .connect(url)
                    .await?;
                crate::schema::apply(&pool).await?;
                Ok::<_, sqlx::Error>(pool)
            })
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self { pool, rt })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl Ledger for PostgresLedger {
    #[instrument(skip(self, record), fields(record_id = %record.id, state = %record.state), err)]
    fn save(&self, record: &ExecutionRecord) -> Result<(), LedgerError> {
        let policy = serde_json::to_value(&record.policy)
            .map_err(|e| LedgerError::Storage(format!("failed to serialize policy: {e}")))?;
        let processes = serde_json::to_value(&record.processes)
            .map_err(|e| LedgerError::Storage(format!("failed to serialize processes: {e}")))?;

        self.rt.block_on(async {
            sqlx::query(
                r#"
                INSERT INTO work_record (
                    id, kind, work_type, payload, svc_name,
                    created_at, schedule_at, expire_at, state,
                    try_limit, tried_count, last_try_time, next_try_time,
                    result, error, policy, processes
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
                ON CONFLICT (id) DO UPDATE SET
                    state = EXCLUDED.state,
                    tried_count = EXCLUDED.tried_count,
                    last_try_time = EXCLUDED.last_try_time,
                    next_try_time = EXCLUDED.next_try_time,
                    result = EXCLUDED.result,
                    error = EXCLUDED.error,
                    processes = EXCLUDED.processes
                "#,
            )
            .bind(record.id.0)
            .bind(record.kind.as_str())
            .bind(&record.work_type)
            .bind(&record.payload)
            .bind(&record.svc_name)
            .bind(record.created_at)
            .bind(record.schedule_at)
            .bind(record.expire_at)
            .bind(record.state.as_str())
            .bind(record.try_limit as i32)
            .bind(record.tried_count as i32)
            .bind(record.last_try_time)
            .bind(record.next_try_time)
            .bind(&record.result)
            .bind(&record.error)
            .bind(&policy)
            .bind(&processes)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("save", e))?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(record_id = %id), err)]
    fn get_by_id(&self, id: RecordId) -> Result<Option<ExecutionRecord>, LedgerError> {
        self.rt.block_on(async {
            let row = sqlx::query(&format!("SELECT {COLUMNS} FROM work_record WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("get_by_id", e))?;
            row.map(|row| {
                WorkRecordRow::from_row(&row)
                    .map_err(|e| map_sqlx_error("get_by_id", e))
                    .and_then(ExecutionRecord::try_from)
            })
            .transpose()
        })
    }

    #[instrument(skip(self), fields(svc_name, kind = %kind, limit), err)]
    fn get_by_next_try_time(
        &self,
        svc_name: &str,
        kind: WorkKind,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, LedgerError> {
        self.rt.block_on(async {
            let rows = sqlx::query(&format!(
                r#"
                SELECT {COLUMNS} FROM work_record
                WHERE svc_name = $1
                  AND kind = $2
                  AND state IN ('init', 'executing', 'delivering', 'exception')
                  AND next_try_time < $3
                ORDER BY next_try_time ASC
                LIMIT $4
                "#
            ))
            .bind(svc_name)
            .bind(kind.as_str())
            .bind(before)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_by_next_try_time", e))?;

            rows.iter()
                .map(|row| {
                    WorkRecordRow::from_row(row)
                        .map_err(|e| map_sqlx_error("get_by_next_try_time", e))
                        .and_then(ExecutionRecord::try_from)
                })
                .collect()
        })
    }

    #[instrument(skip(self), fields(svc_name, kind = %kind, limit), err)]
    fn archive_by_expire_at(
        &self,
        svc_name: &str,
        kind: WorkKind,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<usize, LedgerError> {
        self.rt.block_on(async {
            let result = sqlx::query(
                r#"
                WITH moved AS (
                    DELETE FROM work_record
                    WHERE id IN (
                        SELECT id FROM work_record
                        WHERE svc_name = $1
                          AND kind = $2
                          AND state NOT IN ('init', 'executing', 'delivering', 'exception')
                          AND expire_at < $3
                        ORDER BY expire_at ASC
                        LIMIT $4
                    )
                    RETURNING *
                )
                INSERT INTO archived_work_record SELECT * FROM moved
                "#,
            )
            .bind(svc_name)
            .bind(kind.as_str())
            .bind(before)
            .bind(limit as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("archive_by_expire_at", e))?;
            Ok(result.rows_affected() as usize)
        })
    }
}

const COLUMNS: &str = "id, kind, work_type, payload, svc_name, created_at, schedule_at, \
     expire_at, state, try_limit, tried_count, last_try_time, next_try_time, \
     result, error, policy, processes";

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LedgerError {
    match err {
        sqlx::Error::Database(db_err) => LedgerError::Storage(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            LedgerError::Storage(format!("connection pool closed in {operation}"))
        }
        _ => LedgerError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

#[derive(Debug)]
struct WorkRecordRow {
    id: uuid::Uuid,
    kind: String,
    work_type: String,
    payload: serde_json::Value,
    svc_name: String,
    created_at: DateTime<Utc>,
    schedule_at: DateTime<Utc>,
    expire_at: DateTime<Utc>,
    state: String,
    try_limit: i32,
    tried_count: i32,
    last_try_time: DateTime<Utc>,
    next_try_time: DateTime<Utc>,
    result: Option<serde_json::Value>,
    error: Option<String>,
    policy: serde_json::Value,
    processes: serde_json::Value,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for WorkRecordRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(WorkRecordRow {
            id: row.try_get("id")?,
            kind: row.try_get("kind")?,
            work_type: row.try_get("work_type")?,
            payload: row.try_get("payload")?,
            svc_name: row.try_get("svc_name")?,
            created_at: row.try_get("created_at")?,
            schedule_at: row.try_get("schedule_at")?,
            expire_at: row.try_get("expire_at")?,
            state: row.try_get("state")?,
            try_limit: row.try_get("try_limit")?,
            tried_count: row.try_get("tried_count")?,
            last_try_time: row.try_get("last_try_time")?,
            next_try_time: row.try_get("next_try_time")?,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
            policy: row.try_get("policy")?,
            processes: row.try_get("processes")?,
        })
    }
}

impl TryFrom<WorkRecordRow> for ExecutionRecord {
    type Error = LedgerError;

    fn try_from(row: WorkRecordRow) -> Result<Self, LedgerError> {
        let kind = WorkKind::parse(&row.kind)
            .ok_or_else(|| LedgerError::Storage(format!("unknown kind '{}'", row.kind)))?;
        let state = RecordState::parse(&row.state)
            .ok_or_else(|| LedgerError::Storage(format!("unknown state '{}'", row.state)))?;
        let policy: RetryPolicy = serde_json::from_value(row.policy)
            .map_err(|e| LedgerError::Storage(format!("failed to deserialize policy: {e}")))?;
        let processes: Vec<SagaStep> = serde_json::from_value(row.processes)
            .map_err(|e| LedgerError::Storage(format!("failed to deserialize processes: {e}")))?;
        Ok(ExecutionRecord {
            id: RecordId(row.id),
            kind,
            work_type: row.work_type,
            payload: row.payload,
            svc_name: row.svc_name,
            created_at: row.created_at,
            schedule_at: row.schedule_at,
            expire_at: row.expire_at,
            state,
            try_limit: row.try_limit as u32,
            tried_count: row.tried_count as u32,
            last_try_time: row.last_try_time,
            next_try_time: row.next_try_time,
            result: row.result,
            error: row.error,
            policy,
            processes,
        })
    }
}
