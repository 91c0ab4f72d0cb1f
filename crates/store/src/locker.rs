//! Postgres-backed distributed lock.

use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use tracing::{debug, instrument};

use relay_engine::Locker;

/// Lease rows in the `work_lock` table, one per key.
///
/// Acquisition is check-then-insert: a key with no row (or only an expired
/// lease) gets inserted or updated conditionally. Two instances racing on a
/// brand-new key can both pass the check; the primary key rejects the losing
/// insert and that acquire reports failure, which callers already treat as
/// "someone else has it".
pub struct PostgresLocker {
    pool: PgPool,
    rt: tokio::runtime::Runtime,
}

impl PostgresLocker {
    pub fn new(pool: PgPool) -> Result<Self, sqlx::Error> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(sqlx::Error::Io)?;
        Ok(Self { pool, rt })
    }
}

impl Locker for PostgresLocker {
    #[instrument(skip(self), fields(key, owner))]
    fn acquire(&self, key: &str, owner: &str, ttl: Duration) -> bool {
        let now = Utc::now();
        let unlock_at = now + chrono::Duration::from_std(ttl).unwrap_or_default();

        self.rt.block_on(async {
            let existing: Option<i64> =
                match sqlx::query_scalar("SELECT COUNT(*) FROM work_lock WHERE name = $1")
                    .bind(key)
                    .fetch_optional(&self.pool)
                    .await
                {
                    Ok(count) => count,
                    Err(err) => {
                        debug!(key, error = %err, "lock lookup failed");
                        return false;
                    }
                };

            if existing.unwrap_or(0) == 0 {
                let inserted = sqlx::query(
                    r#"
                    INSERT INTO work_lock (name, owner, lock_at, unlock_at)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (name) DO NOTHING
                    "#,
                )
                .bind(key)
                .bind(owner)
                .bind(now)
                .bind(unlock_at)
                .execute(&self.pool)
                .await;
                return match inserted {
                    Ok(result) => result.rows_affected() == 1,
                    Err(err) => {
                        debug!(key, error = %err, "lock insert failed");
                        false
                    }
                };
            }

            // Steal an expired lease or reenter our own.
            let updated = sqlx::query(
                r#"
                UPDATE work_lock
                SET owner = $2, lock_at = $3, unlock_at = $4
                WHERE name = $1 AND (unlock_at < $3 OR owner = $2)
                "#,
            )
            .bind(key)
            .bind(owner)
            .bind(now)
            .bind(unlock_at)
            .execute(&self.pool)
            .await;
            match updated {
                Ok(result) => result.rows_affected() == 1,
                Err(err) => {
                    debug!(key, error = %err, "lock update failed");
                    false
                }
            }
        })
    }

    #[instrument(skip(self), fields(key, owner))]
    fn release(&self, key: &str, owner: &str) -> bool {
        let now = Utc::now();
        self.rt.block_on(async {
            let updated = sqlx::query(
                r#"
                UPDATE work_lock
                SET unlock_at = $3
                WHERE name = $1 AND owner = $2 AND unlock_at > $3
                "#,
            )
            .bind(key)
            .bind(owner)
            .bind(now)
            .execute(&self.pool)
            .await;
            match updated {
                Ok(result) => result.rows_affected() == 1,
                Err(err) => {
                    debug!(key, error = %err, "lock release failed");
                    false
                }
            }
        })
    }
}
