/*!
Serialized form of a snapshot.

Every backend stores the same self-describing JSON document:

```json
{"format_version": 1, "snapshot": {"root": {...}, "window_start": "...", "window_end": "...", "instance_tag": "..."}}
```

The flat-file backend additionally gzip-compresses it, so a stored file can be
inspected with `zcat <file> | jq`.
*/

use crate::{compression::CompressionAdapter, Result, Snapshot, StoreError};
use serde::{Deserialize, Serialize};

/// Current document format version
pub const FORMAT_VERSION: u8 = 1;

#[derive(Serialize)]
struct DocumentRef<'a> {
    format_version: u8,
    snapshot: &'a Snapshot,
}

#[derive(Deserialize)]
struct Document {
    format_version: u8,
    snapshot: Snapshot,
}

/// Serialize a snapshot into the versioned JSON document
pub fn to_json(snapshot: &Snapshot) -> Result<String> {
    let doc = DocumentRef {
        format_version: FORMAT_VERSION,
        snapshot,
    };
    Ok(serde_json::to_string(&doc)?)
}

/// Parse a versioned JSON document and check the snapshot invariants
///
/// Anything that does not decode into a valid snapshot is reported as
/// [`StoreError::CorruptData`].
pub fn from_json(json: &[u8]) -> Result<Snapshot> {
    let doc: Document = serde_json::from_slice(json)
        .map_err(|e| StoreError::corrupt(format!("undecodable snapshot document: {e}")))?;

    if doc.format_version != FORMAT_VERSION {
        return Err(StoreError::corrupt(format!(
            "unsupported snapshot format version: {} (current: {})",
            doc.format_version, FORMAT_VERSION
        )));
    }

    doc.snapshot
        .validate()
        .map_err(|e| StoreError::corrupt(e.to_string()))?;
    Ok(doc.snapshot)
}

/// Pairs the JSON document with a compression adapter
///
/// # Example
/// ```rust
/// use stathive_core::{codec::SnapshotCodec, GzipCompressor, Snapshot, StatNode};
/// use chrono::Utc;
///
/// let codec = SnapshotCodec::new(GzipCompressor::new());
/// let now = Utc::now();
/// let snapshot = Snapshot::new(StatNode::new("root"), now, now, "host-1")?;
/// let bytes = codec.encode(&snapshot)?;
/// assert_eq!(codec.decode(&bytes)?, snapshot);
/// # Ok::<(), stathive_core::StoreError>(())
/// ```
#[derive(Debug, Clone)]
pub struct SnapshotCodec<C: CompressionAdapter> {
    compressor: C,
}

impl<C: CompressionAdapter> SnapshotCodec<C> {
    pub fn new(compressor: C) -> Self {
        Self { compressor }
    }

    /// Serialize and compress
    pub fn encode(&self, snapshot: &Snapshot) -> Result<Vec<u8>> {
        let json = to_json(snapshot)?;
        self.compressor.compress(json.as_bytes())
    }

    /// Decompress and deserialize
    pub fn decode(&self, bytes: &[u8]) -> Result<Snapshot> {
        let json = self
            .compressor
            .decompress(bytes)
            .map_err(|e| StoreError::corrupt(e.to_string()))?;
        from_json(&json)
    }

    pub fn algorithm_name(&self) -> &str {
        self.compressor.algorithm_name()
    }
}
