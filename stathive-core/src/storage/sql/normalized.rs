//! Relational backend storing one row per tree node
//!
//! `stats_group` holds the snapshot window and instance; `stats_node` holds
//! the nodes, linked to their group and parent. Trees can be queried by node
//! name without decoding any payload.

use super::predicate::Predicate;
use super::records::{flatten, rebuild_tree, NodeRecord};
use super::{
    from_millis, is_unique_violation, placeholders, row_exists, to_millis, ProviderRegistry, SqlState,
    DELETE_CHUNK,
};
use crate::config::PoolTuning;
use crate::storage::{resolve_identifier, retention_cutoff, SnapshotStore};
use crate::{Result, Snapshot, StatNode, StoreError};
use chrono::{DateTime, Utc};
use sqlx::any::AnyRow;
use sqlx::Row;
use std::collections::BTreeMap;
use tracing::{debug, info};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS stats_group (
        id TEXT PRIMARY KEY,
        instance TEXT NOT NULL,
        window_start BIGINT NOT NULL,
        window_end BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS stats_node (
        node_id TEXT PRIMARY KEY,
        group_id TEXT NOT NULL,
        parent_id TEXT NULL,
        name TEXT NOT NULL,
        count BIGINT NOT NULL,
        error_count BIGINT NOT NULL,
        min_duration_ms BIGINT NOT NULL,
        max_duration_ms BIGINT NOT NULL,
        total_duration_ms BIGINT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS stats_group_window_start_idx ON stats_group (window_start)",
    "CREATE INDEX IF NOT EXISTS stats_group_instance_idx ON stats_group (instance)",
    "CREATE INDEX IF NOT EXISTS stats_node_group_idx ON stats_node (group_id)",
    "CREATE INDEX IF NOT EXISTS stats_node_name_idx ON stats_node (name)",
];

const NODE_COLUMNS: usize = 9;
const INSERT_CHUNK: usize = 100;

/// Group row plus node rows per snapshot
#[derive(Debug)]
pub struct NormalizedSqlStore {
    sql: SqlState,
}

impl NormalizedSqlStore {
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

impl Default for NormalizedSqlStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Node record with counters converted to `BIGINT`
struct NodeRow {
    record: NodeRecord,
    counters: [i64; 5],
}

impl NodeRow {
    fn new(record: NodeRecord) -> Result<Self> {
        let counter = |value: u64, column: &str| {
            i64::try_from(value).map_err(|_| {
                StoreError::invalid(format!("{column} of '{}' exceeds the BIGINT range", record.name))
            })
        };
        let counters = [
            counter(record.count, "count")?,
            counter(record.error_count, "error_count")?,
            counter(record.min_duration_ms, "min_duration_ms")?,
            counter(record.max_duration_ms, "max_duration_ms")?,
            counter(record.total_duration_ms, "total_duration_ms")?,
        ];
        Ok(Self { record, counters })
    }
}

fn column<T>(row: &AnyRow, name: &str) -> Result<T>
where
    T: for<'r> sqlx::Decode<'r, sqlx::Any> + sqlx::Type<sqlx::Any>,
{
    row.try_get(name)
        .map_err(|e| StoreError::corrupt(format!("Unreadable column {name}: {e}")))
}

fn counter(row: &AnyRow, name: &str) -> Result<u64> {
    let value: Option<i64> = column(row, name)?;
    let value = value.ok_or_else(|| StoreError::corrupt(format!("{name} is null")))?;
    u64::try_from(value).map_err(|_| StoreError::corrupt(format!("{name} is negative: {value}")))
}

/// Node half of a `stats_group LEFT JOIN stats_node` row, `None` without nodes
fn node_record(row: &AnyRow) -> Result<Option<NodeRecord>> {
    let node_id: Option<String> = column(row, "node_id")?;
    let Some(node_id) = node_id else {
        return Ok(None);
    };
    let name: Option<String> = column(row, "name")?;
    Ok(Some(NodeRecord {
        node_id,
        parent_id: column(row, "parent_id")?,
        name: name.ok_or_else(|| StoreError::corrupt("node name is null"))?,
        count: counter(row, "count")?,
        error_count: counter(row, "error_count")?,
        min_duration_ms: counter(row, "min_duration_ms")?,
        max_duration_ms: counter(row, "max_duration_ms")?,
        total_duration_ms: counter(row, "total_duration_ms")?,
    }))
}

impl SnapshotStore for NormalizedSqlStore {
    fn setup(&self, init_param: &str) -> Result<()> {
        self.sql.setup(init_param, "normalized")
    }

    fn is_ready(&self) -> bool {
        self.sql.is_ready()
    }

    fn save(&self, snapshot: &Snapshot, identifier: Option<&str>) -> Result<String> {
        let pool = self.sql.pool()?;
        snapshot.validate()?;
        let id = resolve_identifier(identifier)?;
        let rows = flatten(snapshot.root())
            .into_iter()
            .map(NodeRow::new)
            .collect::<Result<Vec<_>>>()?;

        pool.block_on(async {
            let mut tx = pool
                .pool()
                .begin()
                .await
                .map_err(|e| StoreError::write(format!("Failed to begin transaction: {e}")))?;

            let inserted = sqlx::query(
                "INSERT INTO stats_group (id, instance, window_start, window_end) VALUES ($1, $2, $3, $4)",
            )
            .bind(id.as_str())
            .bind(snapshot.instance_tag())
            .bind(to_millis(snapshot.window_start()))
            .bind(to_millis(snapshot.window_end()))
            .execute(&mut *tx)
            .await;

            if let Err(e) = inserted {
                drop(tx);
                return Err(if is_unique_violation(&e) || row_exists(pool, "stats_group", &id).await {
                    StoreError::DuplicateIdentifier(id.clone())
                } else {
                    StoreError::write(format!("Failed to insert snapshot {id}: {e}"))
                });
            }

            for chunk in rows.chunks(INSERT_CHUNK) {
                let values = (0..chunk.len())
                    .map(|i| format!("({})", placeholders(i * NODE_COLUMNS + 1, NODE_COLUMNS)))
                    .collect::<Vec<_>>()
                    .join(", ");
                let sql = format!(
                    "INSERT INTO stats_node (node_id, group_id, parent_id, name, count, error_count,
                     min_duration_ms, max_duration_ms, total_duration_ms) VALUES {values}"
                );

                let mut query = sqlx::query(&sql);
                for row in chunk {
                    query = query
                        .bind(row.record.node_id.as_str())
                        .bind(id.as_str())
                        .bind(row.record.parent_id.as_deref())
                        .bind(row.record.name.as_str());
                    for value in row.counters {
                        query = query.bind(value);
                    }
                }
                query
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| StoreError::write(format!("Failed to insert nodes of {id}: {e}")))?;
            }

            tx.commit()
                .await
                .map_err(|e| StoreError::write(format!("Failed to commit snapshot {id}: {e}")))
        })?;

        debug!(id = %id, instance = %snapshot.instance_tag(), nodes = rows.len(), "saved snapshot group");
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

        let mut predicate = Predicate::on("g").overlapping(from, to).instance(instance_tag);
        let (select, join) = match name_filter {
            None => ("SELECT g.id", ""),
            Some(name) => {
                predicate = predicate.equals("n.name", name);
                (
                    "SELECT DISTINCT g.id, g.window_start",
                    "JOIN stats_node n ON n.group_id = g.id",
                )
            }
        };
        let sql = format!(
            "{select} FROM stats_group g {join} {} ORDER BY g.window_start DESC, g.id ASC",
            predicate.sql()
        );

        let rows = pool
            .block_on(predicate.bind(sqlx::query(&sql)).fetch_all(pool.pool()))
            .map_err(|e| StoreError::read(format!("Failed to query snapshots: {e}")))?;

        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("id")
                    .map_err(|e| StoreError::read(format!("Failed to decode snapshot row: {e}")))
            })
            .collect()
    }

    fn load(&self, identifier: &str) -> Result<Snapshot> {
        let pool = self.sql.pool()?;
        // one statement, so a concurrent cleanup is seen entirely or not at all
        let rows = pool
            .block_on(
                sqlx::query(
                    "SELECT g.instance, g.window_start, g.window_end,
                            n.node_id, n.parent_id, n.name, n.count, n.error_count,
                            n.min_duration_ms, n.max_duration_ms, n.total_duration_ms
                     FROM stats_group g LEFT JOIN stats_node n ON n.group_id = g.id
                     WHERE g.id = $1",
                )
                .bind(identifier)
                .fetch_all(pool.pool()),
            )
            .map_err(|e| StoreError::read(format!("Failed to load snapshot {identifier}: {e}")))?;

        let first = rows.first().ok_or_else(|| StoreError::not_found(identifier))?;
        let instance: String = column(first, "instance")?;
        let window_start = from_millis(column(first, "window_start")?)?;
        let window_end = from_millis(column(first, "window_end")?)?;

        let records = rows
            .iter()
            .filter_map(|row| node_record(row).transpose())
            .collect::<Result<Vec<_>>>()?;
        let root = rebuild_tree(&records)
            .map_err(|e| StoreError::corrupt(format!("snapshot {identifier}: {e}")))?;

        Snapshot::new(root, window_start, window_end, instance)
            .map_err(|e| StoreError::corrupt(format!("snapshot {identifier}: {e}")))
    }

    fn cleanup(&self, retention_days: u32, instance_tag: Option<&str>) -> Result<usize> {
        let pool = self.sql.pool()?;
        let cutoff = retention_cutoff(retention_days);
        let predicate = Predicate::new().ended_before(cutoff).instance(instance_tag);
        let sql = format!("DELETE FROM stats_group {} RETURNING id", predicate.sql());

        let removed = pool.block_on(async {
            let mut tx = pool
                .pool()
                .begin()
                .await
                .map_err(|e| StoreError::write(format!("Failed to begin transaction: {e}")))?;

            let ids = predicate
                .bind(sqlx::query(&sql))
                .fetch_all(&mut *tx)
                .await
                .map_err(|e| StoreError::write(format!("Failed to delete expired groups: {e}")))?
                .iter()
                .map(|row| row.try_get::<String, _>("id"))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| StoreError::write(format!("Failed to decode deleted group id: {e}")))?;

            for chunk in ids.chunks(DELETE_CHUNK) {
                let sql = format!(
                    "DELETE FROM stats_node WHERE group_id IN ({})",
                    placeholders(1, chunk.len())
                );
                let mut query = sqlx::query(&sql);
                for id in chunk {
                    query = query.bind(id.as_str());
                }
                query
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| StoreError::write(format!("Failed to delete expired nodes: {e}")))?;
            }

            tx.commit()
                .await
                .map_err(|e| StoreError::write(format!("Failed to commit cleanup: {e}")))?;
            Ok::<_, StoreError>(ids.len())
        })?;

        info!(removed, retention_days, cutoff = %cutoff, "normalized cleanup finished");
        Ok(removed)
    }

    fn instances(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<String>> {
        let pool = self.sql.pool()?;
        if from > to {
            return Ok(Vec::new());
        }
        let predicate = Predicate::new().overlapping(from, to);
        let sql = format!("SELECT DISTINCT instance FROM stats_group {}", predicate.sql());

        let rows = pool
            .block_on(predicate.bind(sqlx::query(&sql)).fetch_all(pool.pool()))
            .map_err(|e| StoreError::read(format!("Failed to query instances: {e}")))?;

        let mut tags = rows
            .iter()
            .map(|row| row.try_get::<String, _>("instance"))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| StoreError::read(format!("Failed to decode instance: {e}")))?;
        tags.sort();
        Ok(tags)
    }

    fn load_details(
        &self,
        name: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        instance_tag: Option<&str>,
    ) -> Result<Option<StatNode>> {
        let pool = self.sql.pool()?;
        if from > to {
            return Ok(None);
        }

        // only trees holding the name are read, in one statement
        let predicate = Predicate::on("g")
            .overlapping(from, to)
            .instance(instance_tag)
            .equals("m.name", name);
        let sql = format!(
            "SELECT n.group_id, n.node_id, n.parent_id, n.name, n.count, n.error_count,
                    n.min_duration_ms, n.max_duration_ms, n.total_duration_ms
             FROM stats_node n
             WHERE n.group_id IN (
                 SELECT g.id FROM stats_group g JOIN stats_node m ON m.group_id = g.id {}
             )",
            predicate.sql()
        );

        let rows = pool
            .block_on(predicate.bind(sqlx::query(&sql)).fetch_all(pool.pool()))
            .map_err(|e| StoreError::read(format!("Failed to query details of '{name}': {e}")))?;

        let mut groups: BTreeMap<String, Vec<NodeRecord>> = BTreeMap::new();
        for row in &rows {
            let group_id: String = column(row, "group_id")?;
            if let Some(record) = node_record(row)? {
                groups.entry(group_id).or_default().push(record);
            }
        }

        let trees = groups
            .iter()
            .map(|(group_id, records)| {
                rebuild_tree(records).map_err(|e| StoreError::corrupt(format!("snapshot {group_id}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(name = %name, snapshots = trees.len(), nodes = rows.len(), "loaded node details");
        Ok(StatNode::merge_named(
            name,
            trees.iter().flat_map(|root| root.nodes_named(name)),
        ))
    }
}
