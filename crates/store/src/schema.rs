//! Table definitions.
//!
//! Apply these statements once at deployment time (or run
//! [`apply`](crate::schema::apply) on startup; every statement is
//! idempotent). Saga steps are embedded in the record row as JSONB because
//! steps are only ever read and written through their parent record.
//!
//! The live `work_record` table stays small (terminal records migrate out)
//! and is left unpartitioned. The archive grows without bound, so
//! `archived_work_record` is declaratively partitioned by `expire_at`
//! month; [`add_archive_partition`] creates a month's partition ahead of
//! time, and a `DEFAULT` partition catches rows for months nobody
//! provisioned.

use sqlx::PgPool;

/// Live records, one row per event/request/saga.
pub const CREATE_WORK_RECORD: &str = r#"
CREATE TABLE IF NOT EXISTS work_record (
    id            UUID PRIMARY KEY,
    kind          TEXT NOT NULL,
    work_type     TEXT NOT NULL,
    payload       JSONB NOT NULL,
    svc_name      TEXT NOT NULL,
    created_at    TIMESTAMPTZ NOT NULL,
    schedule_at   TIMESTAMPTZ NOT NULL,
    expire_at     TIMESTAMPTZ NOT NULL,
    state         TEXT NOT NULL,
    try_limit     INTEGER NOT NULL,
    tried_count   INTEGER NOT NULL,
    last_try_time TIMESTAMPTZ NOT NULL,
    next_try_time TIMESTAMPTZ NOT NULL,
    result        JSONB,
    error         TEXT,
    policy        JSONB NOT NULL,
    processes     JSONB NOT NULL
)
"#;

/// The compensation sweep's scan path.
pub const CREATE_WORK_RECORD_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_work_record_next_try
    ON work_record (svc_name, kind, next_try_time)
"#;

/// Archived records; identical column shape, range-partitioned by month of
/// `expire_at`. The partition key must be part of the primary key.
pub const CREATE_ARCHIVED_WORK_RECORD: &str = r#"
CREATE TABLE IF NOT EXISTS archived_work_record (
    id            UUID NOT NULL,
    kind          TEXT NOT NULL,
    work_type     TEXT NOT NULL,
    payload       JSONB NOT NULL,
    svc_name      TEXT NOT NULL,
    created_at    TIMESTAMPTZ NOT NULL,
    schedule_at   TIMESTAMPTZ NOT NULL,
    expire_at     TIMESTAMPTZ NOT NULL,
    state         TEXT NOT NULL,
    try_limit     INTEGER NOT NULL,
    tried_count   INTEGER NOT NULL,
    last_try_time TIMESTAMPTZ NOT NULL,
    next_try_time TIMESTAMPTZ NOT NULL,
    result        JSONB,
    error         TEXT,
    policy        JSONB NOT NULL,
    processes     JSONB NOT NULL,
    PRIMARY KEY (id, expire_at)
) PARTITION BY RANGE (expire_at)
"#;

/// Catch-all partition so archive moves never fail for an unprovisioned
/// month.
pub const CREATE_ARCHIVED_WORK_RECORD_DEFAULT: &str = r#"
CREATE TABLE IF NOT EXISTS archived_work_record_default
    PARTITION OF archived_work_record DEFAULT
"#;

/// Lease rows for the distributed lock, one per key.
pub const CREATE_WORK_LOCK: &str = r#"
CREATE TABLE IF NOT EXISTS work_lock (
    name      TEXT PRIMARY KEY,
    owner     TEXT NOT NULL,
    lock_at   TIMESTAMPTZ NOT NULL,
    unlock_at TIMESTAMPTZ NOT NULL
)
"#;

/// Create all tables and indexes if they do not exist yet.
pub async fn apply(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in [
        CREATE_WORK_RECORD,
        CREATE_WORK_RECORD_INDEX,
        CREATE_ARCHIVED_WORK_RECORD,
        CREATE_ARCHIVED_WORK_RECORD_DEFAULT,
        CREATE_WORK_LOCK,
    ] {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

/// DDL for one monthly archive partition, covering `expire_at` values in
/// `[year-month-01, first of the following month)`.
pub fn archive_partition_ddl(year: i32, month: u32) -> String {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    format!(
        "CREATE TABLE IF NOT EXISTS archived_work_record_y{year:04}m{month:02} \
         PARTITION OF archived_work_record \
         FOR VALUES FROM ('{year:04}-{month:02}-01') TO ('{next_year:04}-{next_month:02}-01')"
    )
}

/// Provision the archive partition for one month. Wire this to a periodic
/// deployment job (run it a month or two ahead); months without a dedicated
/// partition land in the default partition instead.
pub async fn add_archive_partition(
    pool: &PgPool,
    year: i32,
    month: u32,
) -> Result<(), sqlx::Error> {
    sqlx::query(&archive_partition_ddl(year, month))
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_ddl_covers_one_month() {
        let ddl = archive_partition_ddl(2026, 8);
        assert!(ddl.contains("archived_work_record_y2026m08"));
        assert!(ddl.contains("FROM ('2026-08-01') TO ('2026-09-01')"));
    }

    #[test]
    fn partition_ddl_rolls_over_the_year() {
        let ddl = archive_partition_ddl(2026, 12);
        assert!(ddl.contains("archived_work_record_y2026m12"));
        assert!(ddl.contains("FROM ('2026-12-01') TO ('2027-01-01')"));
    }
}
