//! Relational backend storing each snapshot as one JSON text column

use super::predicate::Predicate;
use super::{is_unique_violation, row_exists, to_millis, ProviderRegistry, SqlState};
use crate::config::PoolTuning;
use crate::storage::{resolve_identifier, retention_cutoff, SnapshotStore};
use crate::{codec, Result, Snapshot, StoreError};
use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::{debug, info, warn};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS stats_blob (
        id TEXT PRIMARY KEY,
        instance TEXT NOT NULL,
        window_start BIGINT NOT NULL,
        window_end BIGINT NOT NULL,
        payload TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS stats_blob_window_start_idx ON stats_blob (window_start)",
    "CREATE INDEX IF NOT EXISTS stats_blob_instance_idx ON stats_blob (instance)",
];

/// One row per snapshot in `stats_blob`
///
/// The payload is the same versioned JSON document the flat-file backend
/// writes, uncompressed so reporting queries can read it directly.
#[derive(Debug)]
pub struct BlobSqlStore {
    sql: SqlState,
}

impl BlobSqlStore {
    pub fn new() -> Self {
        Self::with_tuning(PoolTuning::default())
    }

    pub fn with_tuning(tuning: PoolTuning) -> Self {
        Self::with_registry(ProviderRegistry::default(), tuning)
    }

    /// Use a custom set of connection providers
    pub fn with_registry(registry: ProviderRegistry, tuning: PoolTuning) -> Self {
        Self {
            sql: SqlState::new(registry, tuning, SCHEMA),
        }
    }
}

impl Default for BlobSqlStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotStore for BlobSqlStore {
    fn setup(&self, init_param: &str) -> Result<()> {
        self.sql.setup(init_param, "blob")
    }

    fn is_ready(&self) -> bool {
        self.sql.is_ready()
    }

    fn save(&self, snapshot: &Snapshot, identifier: Option<&str>) -> Result<String> {
        let pool = self.sql.pool()?;
        snapshot.validate()?;
        let id = resolve_identifier(identifier)?;
        let payload = codec::to_json(snapshot)?;

        pool.block_on(async {
            // the insert goes first so SQLite takes the write lock up front
            let mut tx = pool
                .pool()
                .begin()
                .await
                .map_err(|e| StoreError::write(format!("Failed to begin transaction: {e}")))?;

            let inserted = sqlx::query(
                "INSERT INTO stats_blob (id, instance, window_start, window_end, payload)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(id.as_str())
            .bind(snapshot.instance_tag())
            .bind(to_millis(snapshot.window_start()))
            .bind(to_millis(snapshot.window_end()))
            .bind(payload.as_str())
            .execute(&mut *tx)
            .await;

            if let Err(e) = inserted {
                drop(tx);
                return Err(if is_unique_violation(&e) || row_exists(pool, "stats_blob", &id).await {
                    StoreError::DuplicateIdentifier(id.clone())
                } else {
                    StoreError::write(format!("Failed to insert snapshot {id}: {e}"))
                });
            }

            tx.commit()
                .await
                .map_err(|e| StoreError::write(format!("Failed to commit snapshot {id}: {e}")))
        })?;

        debug!(id = %id, instance = %snapshot.instance_tag(), size = payload.len(), "saved snapshot row");
        Ok(id)
    }

    fn find(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        name_filter: Option<&str>,
        instance_tag: Option<&str>,
    ) -> Result<Vec<String>> {
        let pool = self.sql.pool()?;
        if from > to {
            return Ok(Vec::new());
        }

        let predicate = Predicate::new().overlapping(from, to).instance(instance_tag);
        let columns = if name_filter.is_some() { "id, payload" } else { "id" };
        let sql = format!(
            "SELECT {columns} FROM stats_blob {} ORDER BY window_start DESC, id ASC",
            predicate.sql()
        );

        let rows = pool
            .block_on(predicate.bind(sqlx::query(&sql)).fetch_all(pool.pool()))
            .map_err(|e| StoreError::read(format!("Failed to query snapshots: {e}")))?;

        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row
                .try_get("id")
                .map_err(|e| StoreError::read(format!("Failed to decode snapshot row: {e}")))?;
            if let Some(wanted) = name_filter {
                let payload: String = row
                    .try_get("payload")
                    .map_err(|e| StoreError::read(format!("Failed to decode snapshot row: {e}")))?;
                match codec::from_json(payload.as_bytes()) {
                    Ok(snapshot) if snapshot.root().contains_name(wanted) => {}
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(id = %id, error = %e, "skipping unreadable snapshot");
                        continue;
                    }
                }
            }
            ids.push(id);
        }
        Ok(ids)
    }

    fn load(&self, identifier: &str) -> Result<Snapshot> {
        let pool = self.sql.pool()?;
        let row = pool
            .block_on(
                sqlx::query("SELECT payload FROM stats_blob WHERE id = $1")
                    .bind(identifier)
                    .fetch_optional(pool.pool()),
            )
            .map_err(|e| StoreError::read(format!("Failed to load snapshot {identifier}: {e}")))?
            .ok_or_else(|| StoreError::not_found(identifier))?;

        let payload: String = row
            .try_get("payload")
            .map_err(|e| StoreError::corrupt(format!("Unreadable payload for {identifier}: {e}")))?;
        codec::from_json(payload.as_bytes())
    }

    fn cleanup(&self, retention_days: u32, instance_tag: Option<&str>) -> Result<usize> {
        let pool = self.sql.pool()?;
        let cutoff = retention_cutoff(retention_days);
        let predicate = Predicate::new().ended_before(cutoff).instance(instance_tag);
        let sql = format!("DELETE FROM stats_blob {}", predicate.sql());

        let result = pool
            .block_on(predicate.bind(sqlx::query(&sql)).execute(pool.pool()))
            .map_err(|e| StoreError::write(format!("Failed to delete expired snapshots: {e}")))?;

        let removed = result.rows_affected() as usize;
        info!(removed, retention_days, cutoff = %cutoff, "blob cleanup finished");
        Ok(removed)
    }

    fn instances(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<String>> {
        let pool = self.sql.pool()?;
        if from > to {
            return Ok(Vec::new());
        }
        let predicate = Predicate::new().overlapping(from, to);
        let sql = format!("SELECT DISTINCT instance FROM stats_blob {}", predicate.sql());

        let rows = pool
            .block_on(predicate.bind(sqlx::query(&sql)).fetch_all(pool.pool()))
            .map_err(|e| StoreError::read(format!("Failed to query instances: {e}")))?;

        let mut tags = rows
            .iter()
            .map(|row| row.try_get::<String, _>("instance"))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| StoreError::read(format!("Failed to decode instance: {e}")))?;
        // byte order, independent of the database collation
        tags.sort();
        Ok(tags)
    }
}
