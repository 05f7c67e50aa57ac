/*!
# Stathive Core

Storage engine for periodic snapshots of call-statistics trees.

An instrumentation layer produces a [`Snapshot`]: a tree of [`StatNode`]
counters covering a time window for one instance. This crate persists those
snapshots and lets callers find, load, aggregate and age them out through
one contract, [`SnapshotStore`], with interchangeable backends:

- [`GzipFileStore`]: one gzip-compressed JSON file per snapshot
- `BlobSqlStore`: one database row per snapshot (feature `sql`)
- `NormalizedSqlStore`: one database row per tree node (feature `sql`)

The relational backends connect to PostgreSQL or SQLite, chosen by the
connection string prefix.

## Usage

```rust,no_run
use stathive_core::{Backend, Snapshot, SnapshotStore, StatNode, StoreConfig};
use chrono::{Duration, Utc};

let store = Backend::from_config(&StoreConfig::from_uri("file:/var/lib/stathive")?)?;

let mut root = StatNode::new("root");
root.child_or_insert("GET /orders").record(42, false);

let end = Utc::now();
let snapshot = Snapshot::new(root, end - Duration::minutes(5), end, "web-1")?;
let id = store.save(&snapshot, None)?;

let recent = store.find(end - Duration::hours(1), end, Some("GET /orders"), None)?;
assert!(recent.contains(&id));

// retention, usually run from a scheduler
store.cleanup(30, None)?;
# Ok::<(), stathive_core::StoreError>(())
```
*/

pub mod codec;
pub mod compression;
pub mod config;
pub mod error;
pub mod model;
pub mod observability;
pub mod storage;


pub use compression::{CompressionAdapter, GzipCompressor, NoCompression};
pub use config::{BackendKind, PoolTuning, StoreConfig};
pub use error::{Result, StoreError};
pub use model::{Snapshot, StatNode};
pub use observability::{init_default_observability, init_observability};
pub use storage::{Backend, GzipFileStore, SnapshotStore};

#[cfg(feature = "sql")]
pub use storage::sql::{
    BlobSqlStore, ConnectionProvider, NormalizedSqlStore, PostgresProvider, ProviderRegistry, SqlPool,
    SqliteProvider, Vendor,
};
