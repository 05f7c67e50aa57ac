/*!
Error types for the Stathive storage engine.
*/

use thiserror::Error;

/// Result type used throughout the Stathive core.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during snapshot storage operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Malformed init parameter or a backend that cannot initialize
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Operation attempted before a successful `setup`
    #[error("Storage is not ready: setup has not completed")]
    NotReady,

    /// I/O or SQL failure while writing (save, cleanup)
    #[error("Storage write error: {0}")]
    StorageWrite(String),

    /// I/O or SQL failure while reading (find, load)
    #[error("Storage read error: {0}")]
    StorageRead(String),

    /// Unknown snapshot identifier
    #[error("Snapshot not found: {0}")]
    NotFound(String),

    /// Persisted data cannot be turned back into a snapshot
    #[error("Corrupt snapshot data: {0}")]
    CorruptData(String),

    /// A snapshot with this identifier is already stored
    #[error("Snapshot identifier already exists: {0}")]
    DuplicateIdentifier(String),

    /// Snapshot or identifier violates a model invariant
    #[error("Invalid snapshot: {0}")]
    InvalidSnapshot(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Compression/decompression errors
    #[error("Compression error: {0}")]
    Compression(String),
}

impl StoreError {
    /// Create a new configuration error
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a new write error
    pub fn write<S: Into<String>>(msg: S) -> Self {
        Self::StorageWrite(msg.into())
    }

    /// Create a new read error
    pub fn read<S: Into<String>>(msg: S) -> Self {
        Self::StorageRead(msg.into())
    }

    /// Create a new not found error
    pub fn not_found<S: Into<String>>(id: S) -> Self {
        Self::NotFound(id.into())
    }

    /// Create a new corrupt data error
    pub fn corrupt<S: Into<String>>(msg: S) -> Self {
        Self::CorruptData(msg.into())
    }

    /// Create a new invalid snapshot error
    pub fn invalid<S: Into<String>>(msg: S) -> Self {
        Self::InvalidSnapshot(msg.into())
    }

    /// Create a new compression error
    pub fn compression<S: Into<String>>(msg: S) -> Self {
        Self::Compression(msg.into())
    }

    /// Short, stable label for the error kind (used as a metrics label)
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::NotReady => "not_ready",
            Self::StorageWrite(_) => "storage_write",
            Self::StorageRead(_) => "storage_read",
            Self::NotFound(_) => "not_found",
            Self::CorruptData(_) => "corrupt_data",
            Self::DuplicateIdentifier(_) => "duplicate_identifier",
            Self::InvalidSnapshot(_) => "invalid_snapshot",
            Self::Json(_) => "json",
            Self::Compression(_) => "compression",
        }
    }
}
