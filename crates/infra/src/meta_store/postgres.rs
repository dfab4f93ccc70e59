//! Postgres-backed metadata store.
//!
//! Records live in a single table:
//!
//! ```sql
//! CREATE TABLE meta_records (
//!     key     TEXT PRIMARY KEY,
//!     value   JSONB,
//!     version BIGINT NOT NULL
//! );
//! ```
//!
//! A deleted key keeps its row with a `NULL` value so the next incarnation
//! continues its version sequence.
//!
//! ## Error Mapping
//!
//! | Situation | MetaStoreError |
//! |-----------|----------------|
//! | Version predicate matched no row | `Conflict` |
//! | Unique violation (`23505`) on insert race | `Conflict` |
//! | Any other SQLx error | `Storage` |
//!
//! ## Blocking
//!
//! The orchestrator core is synchronous. Each call drives its query on the
//! runtime handle given at construction via `block_on`, so callers must be
//! plain OS threads, never tasks running on that runtime.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::runtime::Handle;
use tracing::instrument;

use segforge_core::ExpectedVersion;

use super::key::MetaKey;
use super::r#trait::{MetaStore, MetaStoreError, MetaWrite, VersionedValue};

#[derive(Debug, Clone)]
pub struct PostgresMetaStore {
    pool: Arc<PgPool>,
    handle: Handle,
}

impl PostgresMetaStore {
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            handle,
        }
    }

    /// Create the backing table if missing.
    pub fn ensure_schema(&self) -> Result<(), MetaStoreError> {
        let pool = self.pool.clone();
        self.handle.block_on(async move {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS meta_records (
                    key     TEXT PRIMARY KEY,
                    value   JSONB,
                    version BIGINT NOT NULL
                )
                "#,
            )
            .execute(&*pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
            sqlx::query("ALTER TABLE meta_records ALTER COLUMN value DROP NOT NULL")
                .execute(&*pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
            Ok(())
        })
    }
}

impl MetaStore for PostgresMetaStore {
    #[instrument(skip(self), fields(key = %key), err)]
    fn read(&self, key: &MetaKey) -> Result<Option<VersionedValue>, MetaStoreError> {
        let pool = self.pool.clone();
        let key = key.as_str().to_string();
        self.handle.block_on(async move {
            let row = sqlx::query(
                "SELECT value, version FROM meta_records WHERE key = $1 AND value IS NOT NULL",
            )
                .bind(&key)
                .fetch_optional(&*pool)
                .await
                .map_err(|e| map_sqlx_error("read", e))?;
            row.map(|r| versioned_from_row(&r)).transpose()
        })
    }

    #[instrument(skip(self), err)]
    fn scan(&self, prefix: &str) -> Result<Vec<(MetaKey, VersionedValue)>, MetaStoreError> {
        let pool = self.pool.clone();
        let prefix = prefix.to_string();
        self.handle.block_on(async move {
            // left() avoids LIKE wildcards hidden in project or model names.
            let rows = sqlx::query(
                r#"
                SELECT key, value, version
                FROM meta_records
                WHERE left(key, length($1)) = $1 AND value IS NOT NULL
                ORDER BY key ASC
                "#,
            )
            .bind(&prefix)
            .fetch_all(&*pool)
            .await
            .map_err(|e| map_sqlx_error("scan", e))?;

            let mut out = Vec::with_capacity(rows.len());
            for row in rows {
                let key: String = row
                    .try_get("key")
                    .map_err(|e| MetaStoreError::Storage(format!("failed to decode key: {e}")))?;
                out.push((MetaKey::from_raw(key), versioned_from_row(&row)?));
            }
            Ok(out)
        })
    }

    #[instrument(skip(self, writes), fields(batch = writes.len()), err)]
    fn commit(&self, writes: Vec<MetaWrite>) -> Result<Vec<u64>, MetaStoreError> {
        let mut seen = std::collections::BTreeSet::new();
        if let Some(dup) = writes.iter().find(|w| !seen.insert(&w.key)) {
            return Err(MetaStoreError::Storage(format!(
                "key {} written twice in one batch",
                dup.key
            )));
        }

        let pool = self.pool.clone();
        self.handle.block_on(async move {
            let mut tx = pool
                .begin()
                .await
                .map_err(|e| map_sqlx_error("begin", e))?;

            let mut versions = Vec::with_capacity(writes.len());
            for w in &writes {
                versions.push(apply_write(&mut tx, w).await?);
            }

            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit", e))?;
            Ok(versions)
        })
    }
}

async fn apply_write(
    tx: &mut Transaction<'_, Postgres>,
    w: &MetaWrite,
) -> Result<u64, MetaStoreError> {
    let key = w.key.as_str();
    let applied: Option<i64> = match (&w.value, w.expected) {
        (Some(value), ExpectedVersion::Any) => sqlx::query_scalar(
            r#"
            INSERT INTO meta_records (key, value, version) VALUES ($1, $2, 1)
            ON CONFLICT (key) DO UPDATE
                SET value = EXCLUDED.value, version = meta_records.version + 1
            RETURNING version
            "#,
        )
        .bind(key)
        .bind(value)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("upsert", e))?,

        (Some(value), ExpectedVersion::Exact(0)) => sqlx::query_scalar(
            r#"
            INSERT INTO meta_records (key, value, version) VALUES ($1, $2, 1)
            ON CONFLICT (key) DO UPDATE
                SET value = EXCLUDED.value, version = meta_records.version + 1
                WHERE meta_records.value IS NULL
            RETURNING version
            "#,
        )
        .bind(key)
        .bind(value)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert", e))?,

        (Some(value), ExpectedVersion::Exact(v)) => sqlx::query_scalar(
            r#"
            UPDATE meta_records SET value = $2, version = version + 1
            WHERE key = $1 AND version = $3 AND value IS NOT NULL
            RETURNING version
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(v as i64)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("update", e))?,

        (None, ExpectedVersion::Exact(0)) => {
            // Nothing to delete; only a live record is a conflict.
            let live = live_version(tx, key).await?;
            if live.is_none() { Some(0) } else { None }
        }

        (None, expected) => {
            let deleted = match expected {
                ExpectedVersion::Any => sqlx::query(
                    r#"
                    UPDATE meta_records SET value = NULL, version = version + 1
                    WHERE key = $1 AND value IS NOT NULL
                    "#,
                )
                .bind(key)
                .execute(&mut **tx)
                .await,
                ExpectedVersion::Exact(v) => sqlx::query(
                    r#"
                    UPDATE meta_records SET value = NULL, version = version + 1
                    WHERE key = $1 AND version = $2 AND value IS NOT NULL
                    "#,
                )
                .bind(key)
                .bind(v as i64)
                .execute(&mut **tx)
                .await,
            }
            .map_err(|e| map_sqlx_error("delete", e))?;

            let ok = matches!(expected, ExpectedVersion::Any) || deleted.rows_affected() == 1;
            if ok { Some(0) } else { None }
        }
    };

    match applied {
        Some(version) => Ok(version as u64),
        None => Err(MetaStoreError::Conflict {
            key: w.key.clone(),
            expected: w.expected,
            actual: live_version(tx, key).await?.unwrap_or(0) as u64,
        }),
    }
}

async fn live_version(
    tx: &mut Transaction<'_, Postgres>,
    key: &str,
) -> Result<Option<i64>, MetaStoreError> {
    sqlx::query_scalar("SELECT version FROM meta_records WHERE key = $1 AND value IS NOT NULL")
        .bind(key)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("read_version", e))
}

fn versioned_from_row(row: &sqlx::postgres::PgRow) -> Result<VersionedValue, MetaStoreError> {
    let value: JsonValue = row
        .try_get("value")
        .map_err(|e| MetaStoreError::Storage(format!("failed to decode value: {e}")))?;
    let version: i64 = row
        .try_get("version")
        .map_err(|e| MetaStoreError::Storage(format!("failed to decode version: {e}")))?;
    Ok(VersionedValue {
        value,
        version: version as u64,
    })
}

fn map_sqlx_error(operation: &str, e: sqlx::Error) -> MetaStoreError {
    if let sqlx::Error::Database(db) = &e {
        if db.code().as_deref() == Some("23505") {
            return MetaStoreError::Conflict {
                key: MetaKey::from_raw(format!("<{operation}>")),
                expected: ExpectedVersion::ABSENT,
                actual: 1,
            };
        }
    }
    MetaStoreError::Storage(format!("{operation}: {e}"))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    /// Connects to `SEGFORGE_TEST_DATABASE_URL`; the test is a no-op without it.
    fn connect() -> Option<(tokio::runtime::Runtime, PostgresMetaStore)> {
        let url = std::env::var("SEGFORGE_TEST_DATABASE_URL").ok()?;
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .ok()?;
        let pool = rt.block_on(PgPool::connect(&url)).ok()?;
        let store = PostgresMetaStore::new(pool, rt.handle().clone());
        store.ensure_schema().ok()?;
        Some((rt, store))
    }

    #[test]
    fn compare_and_set_against_postgres() {
        let Some((_rt, store)) = connect() else {
            return;
        };
        let key = MetaKey::from_raw(format!("/pg_test/{}/execute/job", uuid::Uuid::now_v7()));

        let v1 = store
            .write_if_version(&key, json!({"n": 1}), ExpectedVersion::ABSENT)
            .unwrap();
        assert_eq!(v1, 1);

        let err = store
            .write_if_version(&key, json!({"n": 2}), ExpectedVersion::ABSENT)
            .unwrap_err();
        assert!(err.is_conflict());

        let v2 = store
            .write_if_version(&key, json!({"n": 2}), ExpectedVersion::Exact(1))
            .unwrap();
        assert_eq!(v2, 2);
        assert_eq!(store.read(&key).unwrap().unwrap().value, json!({"n": 2}));

        let prefix = key.as_str().trim_end_matches("job");
        assert_eq!(store.scan(prefix).unwrap().len(), 1);

        store
            .commit(vec![MetaWrite::delete(key.clone(), ExpectedVersion::Exact(2))])
            .unwrap();
        assert!(store.read(&key).unwrap().is_none());
        assert!(store.scan(prefix).unwrap().is_empty());

        // Same contract as the in-memory store.
        store
            .commit(vec![MetaWrite::delete(key.clone(), ExpectedVersion::ABSENT)])
            .unwrap();
        let v3 = store
            .write_if_version(&key, json!({"n": 3}), ExpectedVersion::ABSENT)
            .unwrap();
        assert_eq!(v3, 4);
        let err = store
            .write_if_version(&key, json!("stale"), ExpectedVersion::Exact(2))
            .unwrap_err();
        assert!(err.is_conflict());
        let err = store
            .commit(vec![MetaWrite::delete(key, ExpectedVersion::ABSENT)])
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn duplicate_keys_are_rejected_before_touching_the_database() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap();
        let pool = {
            let _enter = rt.enter();
            PgPool::connect_lazy("postgres://segforge@localhost/unused").unwrap()
        };
        let store = PostgresMetaStore::new(pool, rt.handle().clone());
        let key = MetaKey::from_raw("/pg_test/dup");
        let err = store
            .commit(vec![
                MetaWrite::put(key.clone(), json!(1), ExpectedVersion::Any),
                MetaWrite::put(key, json!(2), ExpectedVersion::Any),
            ])
            .unwrap_err();
        assert_eq!(err.code(), "STORAGE_FAILURE");
    }
}
