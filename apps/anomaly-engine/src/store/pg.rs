use super::{SeriesStore, StoreError, TxOp, TxOutcome, Watched};
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;

/// Postgres-backed store. Each write stamps the row with a fresh value from a sequence, which
/// is the version a watcher compares against at commit time.
#[derive(Clone)]
pub struct PgSeriesStore {
    pool: PgPool,
}

pub async fn build_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(8))
        .connect(database_url)
        .await
        .with_context(|| format!("failed to connect series store at {database_url}"))
}

impl PgSeriesStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query("CREATE SEQUENCE IF NOT EXISTS series_store_version_seq")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS series_store (
                key text primary key,
                value bytea not null,
                version bigint not null
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS series_index (
                index_name text not null,
                member text not null,
                primary key (index_name, member)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Serializes writers of one key until the surrounding transaction ends.
async fn lock_key(tx: &mut Transaction<'_, Postgres>, key: &str) -> Result<(), StoreError> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(key)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn upsert(
    tx: &mut Transaction<'_, Postgres>,
    key: &str,
    value: Vec<u8>,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO series_store (key, value, version)
        VALUES ($1, $2, nextval('series_store_version_seq'))
        ON CONFLICT (key) DO UPDATE
        SET value = EXCLUDED.value, version = EXCLUDED.version
        "#,
    )
    .bind(key)
    .bind(value)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl SeriesStore for PgSeriesStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let value: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT value FROM series_store WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        lock_key(&mut tx, key).await?;
        upsert(&mut tx, key, value).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn append(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        lock_key(&mut tx, key).await?;
        sqlx::query(
            r#"
            INSERT INTO series_store (key, value, version)
            VALUES ($1, $2, nextval('series_store_version_seq'))
            ON CONFLICT (key) DO UPDATE
            SET value = series_store.value || EXCLUDED.value, version = EXCLUDED.version
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn add_member(&self, index: &str, member: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO series_index (index_name, member)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(index)
        .bind(member)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn members(&self, index: &str) -> Result<Vec<String>, StoreError> {
        let members: Vec<String> = sqlx::query_scalar(
            "SELECT member FROM series_index WHERE index_name = $1 ORDER BY member ASC",
        )
        .bind(index)
        .fetch_all(&self.pool)
        .await?;
        Ok(members)
    }

    async fn watch(&self, key: &str) -> Result<Watched, StoreError> {
        let row: Option<(Vec<u8>, i64)> =
            sqlx::query_as("SELECT value, version FROM series_store WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(match row {
            Some((value, version)) => Watched::new(key, Some(value), Some(version)),
            None => Watched::new(key, None, None),
        })
    }

    async fn exec(&self, guard: &Watched, ops: Vec<TxOp>) -> Result<TxOutcome, StoreError> {
        let mut keys: Vec<&str> = ops
            .iter()
            .filter_map(|op| match op {
                TxOp::Set { key, .. } | TxOp::Delete { key } => Some(key.as_str()),
                TxOp::RemoveMember { .. } => None,
            })
            .chain(std::iter::once(guard.key.as_str()))
            .collect();
        keys.sort_unstable();
        keys.dedup();

        let mut tx = self.pool.begin().await?;
        // a missing key has no row to lock, so writers also serialize on the key's advisory lock
        for key in keys {
            lock_key(&mut tx, key).await?;
        }
        let current: Option<i64> =
            sqlx::query_scalar("SELECT version FROM series_store WHERE key = $1 FOR UPDATE")
                .bind(&guard.key)
                .fetch_optional(&mut *tx)
                .await?;
        if current != guard.version() {
            tx.rollback().await?;
            return Ok(TxOutcome::Conflict);
        }

        for op in ops {
            match op {
                TxOp::Set { key, value } => upsert(&mut tx, &key, value).await?,
                TxOp::Delete { key } => {
                    sqlx::query("DELETE FROM series_store WHERE key = $1")
                        .bind(key)
                        .execute(&mut *tx)
                        .await?;
                }
                TxOp::RemoveMember { index, member } => {
                    sqlx::query("DELETE FROM series_index WHERE index_name = $1 AND member = $2")
                        .bind(index)
                        .bind(member)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(TxOutcome::Committed)
    }
}
