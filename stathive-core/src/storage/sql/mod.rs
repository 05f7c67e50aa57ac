/*!
Relational snapshot backends.

Two layouts share the connection plumbing in this module:

- [`BlobSqlStore`]: one `stats_blob` row per snapshot, the JSON document in a
  text column
- [`NormalizedSqlStore`]: one `stats_group` row per snapshot plus one
  `stats_node` row per tree node

Timestamps are stored as epoch milliseconds in `BIGINT` columns so the same
statements run on Postgres and SQLite.
*/

pub mod blob;
pub mod normalized;
pub mod predicate;
pub mod provider;
pub mod records;

pub use blob::BlobSqlStore;
pub use normalized::NormalizedSqlStore;
pub use provider::{ConnectionProvider, PostgresProvider, ProviderRegistry, SqlPool, SqliteProvider, Vendor};

use super::StoreState;
use crate::config::PoolTuning;
use crate::{Result, StoreError};
use chrono::{DateTime, Utc};
use tracing::info;

/// Pool lifecycle and schema bootstrap shared by both layouts
#[derive(Debug)]
pub(crate) struct SqlState {
    state: StoreState<SqlPool>,
    registry: ProviderRegistry,
    tuning: PoolTuning,
    schema: &'static [&'static str],
}

impl SqlState {
    pub(crate) fn new(registry: ProviderRegistry, tuning: PoolTuning, schema: &'static [&'static str]) -> Self {
        Self {
            state: StoreState::new(),
            registry,
            tuning,
            schema,
        }
    }

    pub(crate) fn pool(&self) -> Result<&SqlPool> {
        self.state.get()
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    pub(crate) fn setup(&self, init_param: &str, layout: &str) -> Result<()> {
        self.state.setup(
            init_param,
            |url| {
                self.tuning.validate()?;
                let pool = self.registry.resolve(url, &self.tuning).ok_or_else(|| {
                    StoreError::configuration(format!(
                        "no connection provider available for '{}'",
                        url.split("://").next().unwrap_or(url)
                    ))
                })?;
                self.create_schema(&pool)?;
                info!(vendor = %pool.vendor(), layout, "relational snapshot store ready");
                Ok(pool)
            },
            |pool| self.create_schema(pool),
        )
    }

    fn create_schema(&self, pool: &SqlPool) -> Result<()> {
        pool.block_on(async {
            for statement in self.schema {
                sqlx::query(*statement)
                    .execute(pool.pool())
                    .await
                    .map_err(|e| StoreError::configuration(format!("Failed to create schema: {e}")))?;
            }
            Ok::<_, StoreError>(())
        })
    }
}

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::corrupt(format!("timestamp {millis} is out of range")))
}

pub(crate) fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Whether `table` holds a row with primary key `id`
pub(crate) async fn row_exists(pool: &SqlPool, table: &str, id: &str) -> bool {
    let sql = format!("SELECT id FROM {table} WHERE id = $1");
    matches!(
        sqlx::query(&sql).bind(id).fetch_optional(pool.pool()).await,
        Ok(Some(_))
    )
}

/// Rows per `IN (...)` list when deleting by id
pub(crate) const DELETE_CHUNK: usize = 500;

/// `$first, $first+1, ...` for `count` values
pub(crate) fn placeholders(first: usize, count: usize) -> String {
    (first..first + count)
        .map(|n| format!("${n}"))
        .collect::<Vec<_>>()
        .join(", ")
}
