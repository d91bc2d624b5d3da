//! Layered snapshot model.
//!
//! A snapshot is an immutable view of a stage's output filesystem. It is a
//! stack of delta layers over the stage's base, shared by reference between
//! snapshots so a derived stage stores only what it changed.
//!
//! Paths inside layers are absolute, `/`-separated, without a trailing slash.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Hex-encoded SHA256 fingerprint.
pub type Fingerprint = String;

/// Compute the hex SHA256 digest of a byte slice.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Leading fingerprint chars, for logs and listings.
pub fn short_fingerprint(fingerprint: &str) -> &str {
    &fingerprint[..fingerprint.len().min(12)]
}

/// A file, directory, or symlink captured in a layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Unix mode bits (permissions only, not the file type)
    pub mode: u32,
    /// Node kind and content
    pub kind: FileKind,
    /// Recorded ownership (`user` or `user:group`), if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FileKind {
    /// Regular file, content addressed by blob digest
    File { digest: String, size: u64 },
    /// Directory
    Dir,
    /// Symbolic link, target stored verbatim
    Symlink { target: String },
}

impl FileEntry {
    pub fn is_dir(&self) -> bool {
        matches!(self.kind, FileKind::Dir)
    }

    pub fn size(&self) -> u64 {
        match self.kind {
            FileKind::File { size, .. } => size,
            _ => 0,
        }
    }
}

/// One delta layer: entries added or replaced, plus paths removed relative
/// to the layers below.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub entries: BTreeMap<String, FileEntry>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub removed: BTreeSet<String>,
}

impl Layer {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.removed.is_empty()
    }

    /// Total size of regular file content in this layer.
    pub fn total_file_size(&self) -> u64 {
        self.entries.values().map(|e| e.size()).sum()
    }
}

/// An immutable stage output: the fingerprint that identifies it and the
/// layer stack that produces its filesystem.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub fingerprint: Fingerprint,
    /// Name of the stage (or base) that produced this snapshot
    pub stage_name: String,
    pub created_at: DateTime<Utc>,
    /// Fingerprint of the snapshot this one layers on top of
    pub parent: Option<Fingerprint>,
    /// Layers from oldest to newest; later layers win
    pub layers: Vec<Arc<Layer>>,
}

impl Snapshot {
    /// A snapshot with no content (the `scratch` base).
    pub fn empty(stage_name: &str, fingerprint: Fingerprint) -> Self {
        Self {
            fingerprint,
            stage_name: stage_name.to_string(),
            created_at: Utc::now(),
            parent: None,
            layers: Vec::new(),
        }
    }

    /// A root snapshot made of a single layer (imported base content).
    pub fn from_layer(stage_name: &str, fingerprint: Fingerprint, layer: Layer) -> Self {
        Self {
            fingerprint,
            stage_name: stage_name.to_string(),
            created_at: Utc::now(),
            parent: None,
            layers: vec![Arc::new(layer)],
        }
    }

    /// Derive a new snapshot from a parent by appending one delta layer.
    ///
    /// Parent layers are shared by reference, not copied.
    pub fn derive(parent: &Snapshot, stage_name: &str, fingerprint: Fingerprint, layer: Layer) -> Self {
        let mut layers = parent.layers.clone();
        layers.push(Arc::new(layer));
        Self {
            fingerprint,
            stage_name: stage_name.to_string(),
            created_at: Utc::now(),
            parent: Some(parent.fingerprint.clone()),
            layers,
        }
    }

    /// The delta layer this snapshot added on top of its parent.
    pub fn top_layer(&self) -> Layer {
        self.layers
            .last()
            .map(|l| l.as_ref().clone())
            .unwrap_or_default()
    }

    /// Flatten the layer stack into the effective filesystem view.
    ///
    /// Layers apply in order: a removal drops the path and everything under
    /// it, an entry replaces whatever an earlier layer had at that path.
    pub fn resolve(&self) -> BTreeMap<String, FileEntry> {
        let mut view: BTreeMap<String, FileEntry> = BTreeMap::new();

        for layer in &self.layers {
            for removed in &layer.removed {
                let prefix = format!("{}/", removed);
                view.retain(|path, _| path != removed && !path.starts_with(&prefix));
            }
            for (path, entry) in &layer.entries {
                view.insert(path.clone(), entry.clone());
            }
        }

        view
    }

    /// Total size of regular file content across the effective view.
    pub fn total_size(&self) -> u64 {
        self.resolve().values().map(|e| e.size()).sum()
    }

    pub fn entry_count(&self) -> usize {
        self.resolve().len()
    }
}

/// Persisted form of a snapshot: the delta layer plus a parent link.
///
/// Loading a manifest walks the parent chain to rebuild the full stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub fingerprint: Fingerprint,
    pub stage_name: String,
    pub created_at: DateTime<Utc>,
    /// Updated on every cache hit; drives least-recently-used eviction
    #[serde(default)]
    pub last_accessed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parent: Option<Fingerprint>,
    pub layer: Layer,
}

impl SnapshotManifest {
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        Self {
            fingerprint: snapshot.fingerprint.clone(),
            stage_name: snapshot.stage_name.clone(),
            created_at: snapshot.created_at,
            last_accessed: None,
            parent: snapshot.parent.clone(),
            layer: snapshot.top_layer(),
        }
    }
}

/// Normalize a snapshot path: absolute, `/`-separated, no trailing slash.
///
/// `.` and empty segments are dropped; `..` pops one segment and never
/// escapes the root.
pub fn normalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }

    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(digest: &str, size: u64) -> FileEntry {
        FileEntry {
            mode: 0o644,
            kind: FileKind::File { digest: digest.to_string(), size },
            owner: None,
        }
    }

    fn dir() -> FileEntry {
        FileEntry { mode: 0o755, kind: FileKind::Dir, owner: None }
    }

    #[test]
    fn test_sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_resolve_later_layer_wins() {
        let mut lower = Layer::default();
        lower.entries.insert("/etc/motd".to_string(), file("old", 3));

        let mut upper = Layer::default();
        upper.entries.insert("/etc/motd".to_string(), file("new", 5));

        let base = Snapshot::from_layer("base", "fp1".to_string(), lower);
        let derived = Snapshot::derive(&base, "next", "fp2".to_string(), upper);

        let view = derived.resolve();
        assert_eq!(view.len(), 1);
        match &view["/etc/motd"].kind {
            FileKind::File { digest, size } => {
                assert_eq!(digest, "new");
                assert_eq!(*size, 5);
            }
            other => panic!("Expected file, got {:?}", other),
        }
    }

    #[test]
    fn test_resolve_removal_drops_subtree() {
        let mut lower = Layer::default();
        lower.entries.insert("/app".to_string(), dir());
        lower.entries.insert("/app/bin".to_string(), dir());
        lower.entries.insert("/app/bin/tool".to_string(), file("t", 10));
        lower.entries.insert("/apple".to_string(), file("a", 1));

        let mut upper = Layer::default();
        upper.removed.insert("/app".to_string());

        let base = Snapshot::from_layer("base", "fp1".to_string(), lower);
        let derived = Snapshot::derive(&base, "next", "fp2".to_string(), upper);

        let view = derived.resolve();
        // /apple shares the prefix string but is not under /app
        assert_eq!(view.len(), 1);
        assert!(view.contains_key("/apple"));
    }

    #[test]
    fn test_resolve_remove_then_readd_in_same_layer() {
        let mut lower = Layer::default();
        lower.entries.insert("/data".to_string(), file("v1", 2));

        let mut upper = Layer::default();
        upper.removed.insert("/data".to_string());
        upper.entries.insert("/data".to_string(), file("v2", 4));

        let base = Snapshot::from_layer("base", "fp1".to_string(), lower);
        let derived = Snapshot::derive(&base, "next", "fp2".to_string(), upper);

        let view = derived.resolve();
        match &view["/data"].kind {
            FileKind::File { digest, .. } => assert_eq!(digest, "v2"),
            other => panic!("Expected file, got {:?}", other),
        }
    }

    #[test]
    fn test_derive_shares_parent_layers() {
        let mut lower = Layer::default();
        lower.entries.insert("/one".to_string(), file("1", 1));

        let base = Snapshot::from_layer("base", "fp1".to_string(), lower);
        let derived = Snapshot::derive(&base, "next", "fp2".to_string(), Layer::default());

        assert_eq!(derived.layers.len(), 2);
        assert!(Arc::ptr_eq(&base.layers[0], &derived.layers[0]));
        assert_eq!(derived.parent.as_deref(), Some("fp1"));
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/app/bin/"), "/app/bin");
        assert_eq!(normalize_path("app//bin"), "/app/bin");
        assert_eq!(normalize_path("/app/./bin"), "/app/bin");
        assert_eq!(normalize_path("/app/../etc"), "/etc");
        assert_eq!(normalize_path("/../.."), "/");
        assert_eq!(normalize_path("/"), "/");
    }

    #[test]
    fn test_empty_snapshot_has_no_entries() {
        let snap = Snapshot::empty("scratch", "fp0".to_string());
        assert!(snap.resolve().is_empty());
        assert_eq!(snap.total_size(), 0);
    }
}
