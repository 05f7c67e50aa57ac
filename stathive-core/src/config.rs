//! Configuration for backend selection and connection-pool tuning
//!
//! A store is described by a backend kind plus a backend-specific init
//! parameter (a directory for the flat-file backend, a connection URL for the
//! relational backends). Both can be written as one `<kind>:<init_param>`
//! string, e.g. `file:/var/lib/stathive` or `sql-blob:postgres://db/stats`.

use crate::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Environment variable read by [`StoreConfig::from_env`]
pub const STORE_ENV_VAR: &str = "STATHIVE_STORE";

/// Enumeration of supported storage backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// One gzip-compressed JSON file per snapshot
    File,
    /// One database row per snapshot holding the JSON document
    SqlBlob,
    /// One group row per snapshot plus one row per tree node
    SqlNormalized,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::File => "file",
            BackendKind::SqlBlob => "sql-blob",
            BackendKind::SqlNormalized => "sql-normalized",
        }
    }

    pub fn is_relational(&self) -> bool {
        !matches!(self, BackendKind::File)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" | "gzip" => Ok(BackendKind::File),
            "sql-blob" | "blob" => Ok(BackendKind::SqlBlob),
            "sql-normalized" | "normalized" => Ok(BackendKind::SqlNormalized),
            other => Err(StoreError::configuration(format!(
                "unknown storage backend '{other}' (expected file, sql-blob or sql-normalized)"
            ))),
        }
    }
}

/// Connection-pool settings for the relational backends
///
/// The defaults fit the workload: a write every few minutes, occasional
/// bursts of reads, long idle stretches in between.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolTuning {
    pub max_connections: u32,
    pub min_connections: u32,
    /// Idle connections are closed after this long
    #[serde(with = "duration_secs")]
    pub idle_timeout: Duration,
    /// How long an operation may wait for a pooled connection
    #[serde(with = "duration_secs")]
    pub acquire_timeout: Duration,
    /// Server-side limit for a single statement
    #[serde(with = "duration_secs")]
    pub statement_timeout: Duration,
    pub test_before_acquire: bool,
}

impl Default for PoolTuning {
    fn default() -> Self {
        Self {
            max_connections: 5,
            min_connections: 0,
            idle_timeout: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(60 * 60),
            statement_timeout: Duration::from_secs(5 * 60),
            test_before_acquire: true,
        }
    }
}

impl PoolTuning {
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(StoreError::configuration("pool needs at least one connection"));
        }
        if self.min_connections > self.max_connections {
            return Err(StoreError::configuration(format!(
                "min_connections {} exceeds max_connections {}",
                self.min_connections, self.max_connections
            )));
        }
        if self.acquire_timeout.is_zero() {
            return Err(StoreError::configuration("acquire_timeout must be positive"));
        }
        Ok(())
    }
}

/// Configuration structure for a snapshot store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// The storage backend to use
    pub backend: BackendKind,
    /// Directory path or connection URL, handed to `setup`
    pub init_param: String,
    /// Pool settings, only used by relational backends
    #[serde(default)]
    pub pool: PoolTuning,
    /// Gzip level for the flat-file backend (defaults to 6)
    #[serde(default)]
    pub compression_level: Option<u32>,
}

impl StoreConfig {
    fn with_backend(backend: BackendKind, init_param: impl Into<String>) -> Self {
        Self {
            backend,
            init_param: init_param.into(),
            pool: PoolTuning::default(),
            compression_level: None,
        }
    }

    /// Flat-file storage rooted at `dir`
    pub fn file(dir: impl Into<String>) -> Self {
        Self::with_backend(BackendKind::File, dir)
    }

    /// Blob-per-snapshot relational storage
    pub fn sql_blob(url: impl Into<String>) -> Self {
        Self::with_backend(BackendKind::SqlBlob, url)
    }

    /// Row-per-node relational storage
    pub fn sql_normalized(url: impl Into<String>) -> Self {
        Self::with_backend(BackendKind::SqlNormalized, url)
    }

    /// Parse a `<kind>:<init_param>` string
    ///
    /// The kind ends at the first `:`, so URLs in the init parameter keep
    /// their own colons.
    pub fn from_uri(uri: &str) -> Result<Self> {
        let (kind, init_param) = uri.split_once(':').ok_or_else(|| {
            StoreError::configuration(format!(
                "store URI '{uri}' must look like <kind>:<init_param>"
            ))
        })?;
        let config = Self::with_backend(kind.parse()?, init_param.trim());
        config.validate()?;
        Ok(config)
    }

    /// Read the store URI from the `STATHIVE_STORE` environment variable
    pub fn from_env() -> Result<Self> {
        let uri = std::env::var(STORE_ENV_VAR).map_err(|_| {
            StoreError::configuration(format!("{STORE_ENV_VAR} is not set"))
        })?;
        Self::from_uri(&uri)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.init_param.trim().is_empty() {
            return Err(StoreError::configuration(format!(
                "{} backend requires a non-blank init parameter",
                self.backend
            )));
        }
        if self.backend.is_relational() {
            self.pool.validate()?;
        }
        Ok(())
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_aliases() {
        assert_eq!("gzip".parse::<BackendKind>().unwrap(), BackendKind::File);
        assert_eq!("BLOB".parse::<BackendKind>().unwrap(), BackendKind::SqlBlob);
        assert_eq!(
            "sql-normalized".parse::<BackendKind>().unwrap(),
            BackendKind::SqlNormalized
        );
        assert!("mongo".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_from_uri_file() {
        let config = StoreConfig::from_uri("file:/var/lib/stathive").unwrap();
        assert_eq!(config.backend, BackendKind::File);
        assert_eq!(config.init_param, "/var/lib/stathive");
    }

    #[test]
    fn test_from_uri_keeps_url_colons() {
        let config = StoreConfig::from_uri("sql-blob:postgres://user:pw@db:5432/stats").unwrap();
        assert_eq!(config.backend, BackendKind::SqlBlob);
        assert_eq!(config.init_param, "postgres://user:pw@db:5432/stats");
    }

    #[test]
    fn test_from_uri_rejects_malformed() {
        assert!(StoreConfig::from_uri("no-colon-here").is_err());
        assert!(StoreConfig::from_uri("file:").is_err());
        let err = StoreConfig::from_uri("ftp:/tmp").unwrap_err();
        assert!(err.to_string().contains("unknown storage backend"));
    }

    #[test]
    fn test_pool_defaults_fit_idle_workload() {
        let pool = PoolTuning::default();
        assert_eq!(pool.idle_timeout, Duration::from_secs(30));
        assert_eq!(pool.acquire_timeout, Duration::from_secs(3600));
        assert_eq!(pool.statement_timeout, Duration::from_secs(300));
        assert_eq!(pool.min_connections, 0);
        assert!(pool.validate().is_ok());
    }

    #[test]
    fn test_validate_pool_bounds() {
        let mut config = StoreConfig::sql_normalized("sqlite://stats.db");
        config.pool.max_connections = 0;
        assert!(config.validate().is_err());

        config.pool.max_connections = 2;
        config.pool.min_connections = 3;
        assert!(config.validate().is_err());

        // pool settings are ignored by the file backend
        let mut file = StoreConfig::file("/tmp/stats");
        file.pool.max_connections = 0;
        assert!(file.validate().is_ok());
    }

    #[test]
    fn test_config_serde_uses_seconds() {
        let config = StoreConfig::sql_blob("postgres://db/stats");
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["backend"], "sql-blob");
        assert_eq!(json["pool"]["idle_timeout"], 30);

        let parsed: StoreConfig =
            serde_json::from_str(r#"{"backend":"file","init_param":"/data"}"#).unwrap();
        assert_eq!(parsed.pool, PoolTuning::default());
        assert_eq!(parsed.compression_level, None);
    }
}
