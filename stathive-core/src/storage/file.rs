/*!
Flat-file snapshot backend.

Every snapshot is one gzip-compressed JSON document in a single directory.
The window, instance tag and identifier are encoded in the file name, so
`find`, `instances` and `cleanup` work from a directory listing and only
open files when a name filter asks for tree contents:

```text
stats_20220301100000000_20220301100500000_web-1_5b0c...json.gz
```
*/

use super::{resolve_identifier, retention_cutoff, SnapshotStore, StoreState};
use crate::codec::SnapshotCodec;
use crate::{GzipCompressor, Result, Snapshot, StoreError};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const PREFIX: &str = "stats_";
const SUFFIX: &str = ".json.gz";
const TIMESTAMP_LEN: usize = 17;

/// Metadata carried by a snapshot file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileName {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub instance_tag: String,
    pub identifier: String,
}

impl FileName {
    pub fn for_snapshot(snapshot: &Snapshot, identifier: &str) -> Self {
        Self {
            window_start: snapshot.window_start(),
            window_end: snapshot.window_end(),
            instance_tag: snapshot.instance_tag().to_string(),
            identifier: identifier.to_string(),
        }
    }

    /// Render `stats_<start>_<end>_<tag>_<id>.json.gz`
    pub fn build(&self) -> String {
        format!(
            "{PREFIX}{}_{}_{}_{}{SUFFIX}",
            format_timestamp(self.window_start),
            format_timestamp(self.window_end),
            percent_encode(&self.instance_tag),
            percent_encode(&self.identifier),
        )
    }

    /// Parse a file name, `None` for anything this backend did not write
    pub fn parse(name: &str) -> Option<Self> {
        let body = name.strip_prefix(PREFIX)?.strip_suffix(SUFFIX)?;
        let mut parts = body.split('_');
        let start = parse_timestamp(parts.next()?)?;
        let end = parse_timestamp(parts.next()?)?;
        let tag = percent_decode(parts.next()?)?;
        let identifier = percent_decode(parts.next()?)?;
        if parts.next().is_some() || identifier.is_empty() || start > end {
            return None;
        }
        Some(Self {
            window_start: start,
            window_end: end,
            instance_tag: tag,
            identifier,
        })
    }

    fn overlaps(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        self.window_start <= to && self.window_end >= from
    }

    fn has_tag(&self, instance_tag: Option<&str>) -> bool {
        instance_tag.map_or(true, |tag| self.instance_tag == tag)
    }
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y%m%d%H%M%S%3f").to_string()
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if s.len() != TIMESTAMP_LEN || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let (seconds, millis) = s.split_at(TIMESTAMP_LEN - 3);
    let naive = NaiveDateTime::parse_from_str(seconds, "%Y%m%d%H%M%S").ok()?;
    let millis: i64 = millis.parse().ok()?;
    Some(naive.and_utc() + Duration::milliseconds(millis))
}

/// Escape everything but ASCII alphanumerics and `-`
fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

fn percent_decode(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = s.get(i + 1..i + 3)?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
                i += 3;
            }
            b if b.is_ascii_alphanumeric() || b == b'-' => {
                out.push(b);
                i += 1;
            }
            _ => return None,
        }
    }
    String::from_utf8(out).ok()
}

/// Gzip flat-file storage
///
/// Identifiers are unique across windows and tags, which a file name alone
/// cannot enforce, so every `save` lists the directory first. Save cost grows
/// with the number of stored files; large stores belong in a SQL backend or
/// need a short retention.
///
/// # Example
/// ```rust,no_run
/// use stathive_core::{GzipFileStore, Snapshot, SnapshotStore, StatNode};
/// use chrono::Utc;
///
/// let store = GzipFileStore::new();
/// store.setup("/var/lib/stathive")?;
///
/// let now = Utc::now();
/// let snapshot = Snapshot::new(StatNode::new("root"), now, now, "web-1")?;
/// let id = store.save(&snapshot, None)?;
/// assert_eq!(store.load(&id)?, snapshot);
/// # Ok::<(), stathive_core::StoreError>(())
/// ```
#[derive(Debug)]
pub struct GzipFileStore {
    state: StoreState<PathBuf>,
    codec: SnapshotCodec<GzipCompressor>,
}

impl GzipFileStore {
    pub fn new() -> Self {
        Self::with_compressor(GzipCompressor::new())
    }

    pub fn with_compressor(compressor: GzipCompressor) -> Self {
        Self {
            state: StoreState::new(),
            codec: SnapshotCodec::new(compressor),
        }
    }

    /// Directory the store writes to, once set up
    pub fn dir(&self) -> Result<&Path> {
        self.state.get().map(PathBuf::as_path)
    }

    /// Parse every snapshot file name in `dir`
    fn scan(dir: &Path) -> io::Result<Vec<(FileName, PathBuf)>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let parsed = entry.file_name().to_str().and_then(FileName::parse);
            match parsed {
                Some(name) => found.push((name, path)),
                None => debug!(path = %path.display(), "skipping foreign file"),
            }
        }
        Ok(found)
    }

    fn read(&self, path: &Path, identifier: &str) -> Result<Snapshot> {
        let bytes = fs::read(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StoreError::not_found(identifier),
            _ => StoreError::read(format!("Failed to read snapshot {}: {e}", path.display())),
        })?;
        self.codec.decode(&bytes)
    }
}

impl Default for GzipFileStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Create `dir` if needed and prove it accepts new files
fn prepare_dir(dir: &Path) -> Result<()> {
    if dir.exists() && !dir.is_dir() {
        return Err(StoreError::configuration(format!(
            "{} exists and is not a directory",
            dir.display()
        )));
    }
    fs::create_dir_all(dir).map_err(|e| {
        StoreError::configuration(format!("Failed to create directory {}: {e}", dir.display()))
    })?;
    tempfile::Builder::new()
        .prefix(".stathive-probe")
        .tempfile_in(dir)
        .map_err(|e| {
            StoreError::configuration(format!("Directory {} is not writable: {e}", dir.display()))
        })?;
    Ok(())
}

impl SnapshotStore for GzipFileStore {
    fn setup(&self, init_param: &str) -> Result<()> {
        self.state.setup(
            init_param,
            |dir| {
                if dir.is_empty() {
                    return Err(StoreError::configuration("snapshot directory must not be blank"));
                }
                let dir = PathBuf::from(dir);
                prepare_dir(&dir)?;
                info!(dir = %dir.display(), "flat-file snapshot store ready");
                Ok(dir)
            },
            |dir| prepare_dir(dir),
        )
    }

    fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    fn save(&self, snapshot: &Snapshot, identifier: Option<&str>) -> Result<String> {
        let dir = self.state.get()?;
        snapshot.validate()?;
        let identifier = resolve_identifier(identifier)?;

        // the final name differs per window, so no-clobber alone misses reuse
        let existing = Self::scan(dir)
            .map_err(|e| StoreError::write(format!("Failed to list {}: {e}", dir.display())))?;
        if existing.iter().any(|(name, _)| name.identifier == identifier) {
            return Err(StoreError::DuplicateIdentifier(identifier));
        }

        let bytes = self.codec.encode(snapshot)?;
        let target = dir.join(FileName::for_snapshot(snapshot, &identifier).build());

        let mut tmp = tempfile::Builder::new()
            .prefix(".stats-")
            .suffix(".tmp")
            .tempfile_in(dir)
            .map_err(|e| StoreError::write(format!("Failed to create temp file: {e}")))?;
        tmp.write_all(&bytes)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| StoreError::write(format!("Failed to write snapshot: {e}")))?;
        tmp.persist_noclobber(&target).map_err(|e| match e.error.kind() {
            io::ErrorKind::AlreadyExists => StoreError::DuplicateIdentifier(identifier.clone()),
            _ => StoreError::write(format!(
                "Failed to move snapshot into {}: {}",
                target.display(),
                e.error
            )),
        })?;

        debug!(
            id = %identifier,
            instance = %snapshot.instance_tag(),
            size = bytes.len(),
            "saved snapshot file"
        );
        Ok(identifier)
    }

    fn find(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        name_filter: Option<&str>,
        instance_tag: Option<&str>,
    ) -> Result<Vec<String>> {
        let dir = self.state.get()?;
        if from > to {
            return Ok(Vec::new());
        }

        let candidates: Vec<(FileName, PathBuf)> = Self::scan(dir)
            .map_err(|e| StoreError::read(format!("Failed to list {}: {e}", dir.display())))?
            .into_iter()
            .filter(|(name, _)| name.overlaps(from, to) && name.has_tag(instance_tag))
            .collect();

        let mut matches: Vec<FileName> = match name_filter {
            None => candidates.into_iter().map(|(name, _)| name).collect(),
            Some(wanted) => candidates
                .into_par_iter()
                .filter_map(|(name, path)| match self.read(&path, &name.identifier) {
                    Ok(snapshot) => snapshot.root().contains_name(wanted).then_some(name),
                    Err(StoreError::NotFound(_)) => None,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "skipping unreadable snapshot");
                        None
                    }
                })
                .collect(),
        };

        matches.sort_by(|a, b| {
            b.window_start
                .cmp(&a.window_start)
                .then_with(|| a.identifier.cmp(&b.identifier))
        });
        Ok(matches.into_iter().map(|name| name.identifier).collect())
    }

    fn load(&self, identifier: &str) -> Result<Snapshot> {
        let dir = self.state.get()?;
        let (_, path) = Self::scan(dir)
            .map_err(|e| StoreError::read(format!("Failed to list {}: {e}", dir.display())))?
            .into_iter()
            .find(|(name, _)| name.identifier == identifier)
            .ok_or_else(|| StoreError::not_found(identifier))?;
        self.read(&path, identifier)
    }

    fn cleanup(&self, retention_days: u32, instance_tag: Option<&str>) -> Result<usize> {
        let dir = self.state.get()?;
        let cutoff = retention_cutoff(retention_days);

        let expired = Self::scan(dir)
            .map_err(|e| StoreError::write(format!("Failed to list {}: {e}", dir.display())))?
            .into_iter()
            .filter(|(name, _)| name.window_end < cutoff && name.has_tag(instance_tag));

        let mut removed = 0;
        for (name, path) in expired {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(id = %name.identifier, path = %path.display(), error = %e, "failed to delete expired snapshot")
                }
            }
        }

        info!(removed, retention_days, cutoff = %cutoff, "flat-file cleanup finished");
        Ok(removed)
    }

    fn instances(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<String>> {
        let dir = self.state.get()?;
        if from > to {
            return Ok(Vec::new());
        }
        let tags: BTreeSet<String> = Self::scan(dir)
            .map_err(|e| StoreError::read(format!("Failed to list {}: {e}", dir.display())))?
            .into_iter()
            .filter(|(name, _)| name.overlaps(from, to))
            .map(|(name, _)| name.instance_tag)
            .collect();
        Ok(tags.into_iter().collect())
    }
}
