/*!
Storage backends for snapshot persistence.

This module defines the storage contract (port) every backend implements and
the [`Backend`] enum that picks one of them at runtime from a
[`StoreConfig`]. The engine is independent of where snapshots live: files on
disk, one row per snapshot, or one row per tree node.

Every backend follows the same lifecycle. A fresh instance is
*unconfigured*; `setup` moves it to *ready*, and every other operation fails
with [`StoreError::NotReady`] until then.
*/

pub mod file;
#[cfg(feature = "sql")]
pub mod sql;

use crate::config::{BackendKind, StoreConfig};
use crate::{GzipCompressor, Result, Snapshot, StatNode, StoreError};
use chrono::{DateTime, Duration, Utc};
use std::sync::{Mutex, OnceLock};
use tracing::{debug, warn};

pub use file::GzipFileStore;
#[cfg(feature = "sql")]
pub use sql::{BlobSqlStore, NormalizedSqlStore};

/// Longest identifier a caller may supply
pub const MAX_IDENTIFIER_LEN: usize = 128;

/// Storage contract shared by all snapshot backends
///
/// Implementations are safe to call concurrently from several threads. A
/// snapshot becomes visible to `find`/`load`/`cleanup` atomically, once
/// `save` has returned.
pub trait SnapshotStore: Send + Sync {
    /// One-time configuration
    ///
    /// # Arguments
    /// * `init_param` - Directory path or connection URL, depending on the backend
    ///
    /// Calling it again with the same parameter re-validates the backend
    /// without duplicating state; a different parameter is rejected.
    fn setup(&self, init_param: &str) -> Result<()>;

    /// True once `setup` has succeeded
    fn is_ready(&self) -> bool;

    /// Persist a snapshot under `identifier`, or a generated one
    ///
    /// # Returns
    /// The identifier the snapshot is stored under
    ///
    /// # Errors
    /// * `StoreError::DuplicateIdentifier` - The identifier is already taken; nothing is overwritten
    /// * `StoreError::InvalidSnapshot` - The snapshot breaks a model invariant
    /// * `StoreError::StorageWrite` - The write failed; nothing became visible
    fn save(&self, snapshot: &Snapshot, identifier: Option<&str>) -> Result<String>;

    /// Identifiers of snapshots whose window overlaps `[from, to]`
    ///
    /// Newest `window_start` first. `instance_tag` must match exactly when
    /// given; `name_filter` keeps snapshots holding a node with that name.
    fn find(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        name_filter: Option<&str>,
        instance_tag: Option<&str>,
    ) -> Result<Vec<String>>;

    /// Rehydrate a stored snapshot
    ///
    /// # Errors
    /// * `StoreError::NotFound` - No snapshot carries this identifier
    fn load(&self, identifier: &str) -> Result<Snapshot>;

    /// Delete snapshots whose window ended more than `retention_days` ago
    ///
    /// # Returns
    /// Number of snapshots removed (zero is not an error)
    fn cleanup(&self, retention_days: u32, instance_tag: Option<&str>) -> Result<usize>;

    /// Distinct instance tags with a snapshot overlapping `[from, to]`, sorted
    fn instances(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<String>>;

    /// Merge every snapshot matching the range and tag into one tree
    ///
    /// With `top_level_only` the result keeps the root and its direct
    /// children only.
    fn load_aggregated(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        instance_tag: Option<&str>,
        top_level_only: bool,
    ) -> Result<Option<Snapshot>> {
        let ids = self.find(from, to, None, instance_tag)?;
        let merged = Snapshot::merge_all(&load_all(self, &ids)?);
        Ok(if top_level_only {
            merged.map(|snapshot| snapshot.top_level())
        } else {
            merged
        })
    }

    /// Merge every node named `name` across the matching snapshots
    ///
    /// Counters of all such nodes add up and their subtrees merge by name.
    /// `None` when no matching snapshot holds a node with that name.
    fn load_details(
        &self,
        name: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        instance_tag: Option<&str>,
    ) -> Result<Option<StatNode>> {
        let ids = self.find(from, to, Some(name), instance_tag)?;
        let snapshots = load_all(self, &ids)?;
        Ok(StatNode::merge_named(
            name,
            snapshots.iter().flat_map(|snapshot| snapshot.root().nodes_named(name)),
        ))
    }
}

/// Load `ids`, skipping snapshots a concurrent cleanup removed after `find`
fn load_all<S: SnapshotStore + ?Sized>(store: &S, ids: &[String]) -> Result<Vec<Snapshot>> {
    let mut snapshots = Vec::with_capacity(ids.len());
    for id in ids {
        match store.load(id) {
            Ok(snapshot) => snapshots.push(snapshot),
            Err(StoreError::NotFound(_)) => debug!(id = %id, "snapshot vanished before load"),
            Err(e) => return Err(e),
        }
    }
    Ok(snapshots)
}

/// Unconfigured/ready lifecycle shared by the backends
///
/// Holds the backend's ready state (directory, pool, ...) once `setup` has
/// produced it. Setup calls are serialized; reads never block.
#[derive(Debug)]
pub struct StoreState<T> {
    ready: OnceLock<Ready<T>>,
    setup_lock: Mutex<()>,
}

#[derive(Debug)]
struct Ready<T> {
    init_param: String,
    inner: T,
}

impl<T> StoreState<T> {
    pub fn new() -> Self {
        Self {
            ready: OnceLock::new(),
            setup_lock: Mutex::new(()),
        }
    }

    /// Ready state, or `NotReady` before a successful setup
    pub fn get(&self) -> Result<&T> {
        self.ready
            .get()
            .map(|ready| &ready.inner)
            .ok_or(StoreError::NotReady)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.get().is_some()
    }

    /// Run `init` on the first call, `revalidate` on repeated calls
    ///
    /// A failed `init` leaves the state unconfigured.
    pub fn setup<I, V>(&self, init_param: &str, init: I, revalidate: V) -> Result<()>
    where
        I: FnOnce(&str) -> Result<T>,
        V: FnOnce(&T) -> Result<()>,
    {
        let init_param = init_param.trim();
        let _guard = self
            .setup_lock
            .lock()
            .map_err(|_| StoreError::configuration("setup lock poisoned by a panicking setup"))?;

        if let Some(ready) = self.ready.get() {
            if ready.init_param != init_param {
                return Err(StoreError::configuration(format!(
                    "already configured with '{}', refusing '{}'",
                    ready.init_param, init_param
                )));
            }
            debug!(init_param = %init_param, "re-validating configured store");
            return revalidate(&ready.inner);
        }

        let inner = init(init_param)?;
        // cannot already be set: we hold the setup lock
        let _ = self.ready.set(Ready {
            init_param: init_param.to_string(),
            inner,
        });
        Ok(())
    }
}

impl<T> Default for StoreState<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Caller-supplied identifier, checked, or a fresh UUID v4
pub fn resolve_identifier(identifier: Option<&str>) -> Result<String> {
    match identifier {
        None => Ok(uuid::Uuid::new_v4().to_string()),
        Some(id) => {
            if id.is_empty() || id.trim() != id {
                return Err(StoreError::invalid(format!(
                    "identifier '{id}' is empty or has surrounding whitespace"
                )));
            }
            if id.len() > MAX_IDENTIFIER_LEN {
                return Err(StoreError::invalid(format!(
                    "identifier is {} bytes long, limit is {MAX_IDENTIFIER_LEN}",
                    id.len()
                )));
            }
            if id.chars().any(char::is_control) {
                return Err(StoreError::invalid("identifier contains control characters"));
            }
            Ok(id.to_string())
        }
    }
}

/// Oldest `window_end` that survives a cleanup run started now
///
/// Retentions reaching past the earliest representable instant keep
/// everything.
pub fn retention_cutoff(retention_days: u32) -> DateTime<Utc> {
    Utc::now()
        .checked_sub_signed(Duration::days(i64::from(retention_days)))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// A snapshot store chosen at runtime
///
/// # Example
/// ```rust,no_run
/// use stathive_core::{Backend, SnapshotStore, StoreConfig};
///
/// let store = Backend::from_config(&StoreConfig::from_uri("file:/var/lib/stathive")?)?;
/// let removed = store.cleanup(30, None)?;
/// # Ok::<(), stathive_core::StoreError>(())
/// ```
pub enum Backend {
    File(GzipFileStore),
    #[cfg(feature = "sql")]
    SqlBlob(BlobSqlStore),
    #[cfg(feature = "sql")]
    SqlNormalized(NormalizedSqlStore),
}

impl Backend {
    /// Build an unconfigured backend of the configured kind
    pub fn new(config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        match config.backend {
            BackendKind::File => {
                let compressor = config
                    .compression_level
                    .map(GzipCompressor::with_level)
                    .unwrap_or_default();
                Ok(Backend::File(GzipFileStore::with_compressor(compressor)))
            }
            #[cfg(feature = "sql")]
            BackendKind::SqlBlob => Ok(Backend::SqlBlob(BlobSqlStore::with_tuning(config.pool.clone()))),
            #[cfg(feature = "sql")]
            BackendKind::SqlNormalized => Ok(Backend::SqlNormalized(NormalizedSqlStore::with_tuning(
                config.pool.clone(),
            ))),
            #[cfg(not(feature = "sql"))]
            other => Err(StoreError::configuration(format!(
                "{other} backend requires the 'sql' feature"
            ))),
        }
    }

    /// Build the configured backend and run `setup` with its init parameter
    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        let backend = Self::new(config)?;
        backend.setup(&config.init_param)?;
        Ok(backend)
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::File(_) => BackendKind::File,
            #[cfg(feature = "sql")]
            Backend::SqlBlob(_) => BackendKind::SqlBlob,
            #[cfg(feature = "sql")]
            Backend::SqlNormalized(_) => BackendKind::SqlNormalized,
        }
    }

    fn store(&self) -> &dyn SnapshotStore {
        match self {
            Backend::File(store) => store,
            #[cfg(feature = "sql")]
            Backend::SqlBlob(store) => store,
            #[cfg(feature = "sql")]
            Backend::SqlNormalized(store) => store,
        }
    }

    fn observe<T>(&self, operation: &'static str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        #[cfg(feature = "metrics")]
        let timer = crate::observability::OperationTimer::start(self.kind().as_str(), operation);

        let result = f();

        #[cfg(feature = "metrics")]
        timer.finish(result.as_ref().err());

        if let Err(e) = &result {
            warn!(backend = %self.kind(), operation, error = %e, "storage operation failed");
        }
        result
    }
}

impl SnapshotStore for Backend {
    fn setup(&self, init_param: &str) -> Result<()> {
        self.observe("setup", || self.store().setup(init_param))
    }

    fn is_ready(&self) -> bool {
        self.store().is_ready()
    }

    fn save(&self, snapshot: &Snapshot, identifier: Option<&str>) -> Result<String> {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = crate::observability::StoreMetrics::global() {
            metrics.record_snapshot_nodes(snapshot.root().node_count());
        }

        self.observe("save", || self.store().save(snapshot, identifier))
    }

    fn find(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        name_filter: Option<&str>,
        instance_tag: Option<&str>,
    ) -> Result<Vec<String>> {
        self.observe("find", || self.store().find(from, to, name_filter, instance_tag))
    }

    fn load(&self, identifier: &str) -> Result<Snapshot> {
        self.observe("load", || self.store().load(identifier))
    }

    fn cleanup(&self, retention_days: u32, instance_tag: Option<&str>) -> Result<usize> {
        self.observe("cleanup", || self.store().cleanup(retention_days, instance_tag))
    }

    fn instances(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<String>> {
        self.observe("instances", || self.store().instances(from, to))
    }

    fn load_aggregated(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        instance_tag: Option<&str>,
        top_level_only: bool,
    ) -> Result<Option<Snapshot>> {
        self.observe("load_aggregated", || {
            self.store().load_aggregated(from, to, instance_tag, top_level_only)
        })
    }

    fn load_details(
        &self,
        name: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        instance_tag: Option<&str>,
    ) -> Result<Option<StatNode>> {
        self.observe("load_details", || self.store().load_details(name, from, to, instance_tag))
    }
}
