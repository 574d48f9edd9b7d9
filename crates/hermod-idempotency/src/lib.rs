//! SQLite-backed [`IdempotencyStore`] (spec.md §4.9, §6).
//!
//! Single table `smtp_idempotency(key TEXT PRIMARY KEY, status INTEGER,
//! first_seen_at, last_update)`. `claim` is an `INSERT … ON CONFLICT(key) DO
//! NOTHING` whose reported row count tells the caller whether it actually
//! won the race — at-most-one caller observes `true` per key, matching the
//! schema auto-create / claim discipline spec.md §8 requires of the SQL
//! sinks' `verifiedTables` cache, applied here to idempotency keys instead
//! of table names.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hermod_core::{IdempotencyRecord, IdempotencyStatus, IdempotencyStore};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::debug;

pub struct SqliteIdempotencyStore {
    pool: SqlitePool,
}

impl SqliteIdempotencyStore {
    /// Open (creating if absent) a SQLite idempotency store at `path`, and
    /// ensure the `smtp_idempotency` table exists.
    pub async fn open(path: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new().max_connections(4).connect_with(options).await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS smtp_idempotency (
                key TEXT PRIMARY KEY,
                status INTEGER NOT NULL,
                first_seen_at TEXT NOT NULL,
                last_update TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }

    #[cfg(test)]
    async fn in_memory() -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect("sqlite::memory:")
            .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS smtp_idempotency (
                key TEXT PRIMARY KEY,
                status INTEGER NOT NULL,
                first_seen_at TEXT NOT NULL,
                last_update TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl IdempotencyStore for SqliteIdempotencyStore {
    async fn claim(&self, key: &str) -> anyhow::Result<bool> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            INSERT INTO smtp_idempotency (key, status, first_seen_at, last_update)
            VALUES (?1, ?2, ?3, ?3)
            ON CONFLICT(key) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(IdempotencyStatus::Claimed as i32)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let claimed = result.rows_affected() == 1;
        debug!(key, claimed, "idempotency claim");
        Ok(claimed)
    }

    async fn mark_sent(&self, key: &str) -> anyhow::Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"UPDATE smtp_idempotency SET status = ?1, last_update = ?2 WHERE key = ?3"#,
        )
        .bind(IdempotencyStatus::Sent as i32)
        .bind(&now)
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<IdempotencyRecord>> {
        let row = sqlx::query(
            r#"SELECT key, status, first_seen_at, last_update FROM smtp_idempotency WHERE key = ?1"#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            None => None,
            Some(row) => {
                let status: i32 = row.try_get("status")?;
                let status = if status == IdempotencyStatus::Sent as i32 {
                    IdempotencyStatus::Sent
                } else {
                    IdempotencyStatus::Claimed
                };
                let first_seen_at: String = row.try_get("first_seen_at")?;
                let last_update: String = row.try_get("last_update")?;
                Some(IdempotencyRecord {
                    key: row.try_get("key")?,
                    status,
                    first_seen_at: chrono::DateTime::parse_from_rfc3339(&first_seen_at)?
                        .with_timezone(&Utc),
                    last_update: chrono::DateTime::parse_from_rfc3339(&last_update)?
                        .with_timezone(&Utc),
                })
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn claim_is_at_most_once_per_key() {
        let store = SqliteIdempotencyStore::in_memory().await.unwrap();
        assert!(store.claim("m1").await.unwrap());
        assert!(!store.claim("m1").await.unwrap());
    }

    #[tokio::test]
    async fn mark_sent_transitions_status() {
        let store = SqliteIdempotencyStore::in_memory().await.unwrap();
        store.claim("m1").await.unwrap();
        store.mark_sent("m1").await.unwrap();
        let record = store.get("m1").await.unwrap().unwrap();
        assert_eq!(record.status, IdempotencyStatus::Sent);
    }

    #[tokio::test]
    async fn concurrent_claims_yield_exactly_one_winner() {
        let store = std::sync::Arc::new(SqliteIdempotencyStore::in_memory().await.unwrap());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.claim("shared").await.unwrap() }));
        }
        let mut wins = 0;
        for h in handles {
            if h.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }
}
