//! On-disk snapshot store.
//!
//! Two halves under one root:
//!
//! ```text
//! store/
//! ├── blobs/
//! │   └── sha256/
//! │       ├── a1/
//! │       │   └── a1b2c3...   # file content, named by digest
//! │       └── ...
//! └── snapshots/
//!     └── <fingerprint>.json  # snapshot manifest (delta layer + parent link)
//! ```
//!
//! Blobs are content addressed, so identical file content is stored once no
//! matter how many snapshots reference it. Manifests chain through `parent`
//! fingerprints; looking up a snapshot walks the chain to rebuild its layers.

use crate::builder::snapshot::{sha256_hex, FileKind, Fingerprint, Snapshot, SnapshotManifest};
use chrono::Utc;
use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

/// Error type for store operations.
///
/// Callers on the build path treat any of these as a cache miss; only the
/// cache management commands surface them.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to serialize/deserialize manifest: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid fingerprint: {0}")]
    InvalidFingerprint(String),

    #[error("Corrupt store entry {fingerprint}: {reason}")]
    Corrupt { fingerprint: String, reason: String },

    #[error("Store directory not accessible: {0}")]
    StoreDirectory(String),
}

/// Aggregate store usage, for `cache stats`.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub snapshots: usize,
    pub blobs: usize,
    pub blob_bytes: u64,
}

/// What a prune pass removed.
#[derive(Debug, Clone, Default)]
pub struct PruneReport {
    pub snapshots_removed: usize,
    pub blobs_removed: usize,
}

/// Content-addressed snapshot store.
pub struct SnapshotStore {
    blobs_dir: PathBuf,
    snapshots_dir: PathBuf,
    /// Digests known to exist on disk, to skip repeat stat calls
    known_blobs: Mutex<HashSet<String>>,
}

impl SnapshotStore {
    /// Open (and create if needed) a store under `store_dir`.
    pub fn open(store_dir: &Path) -> Result<Self, CacheError> {
        let blobs_dir = store_dir.join("blobs").join("sha256");
        let snapshots_dir = store_dir.join("snapshots");

        fs::create_dir_all(&blobs_dir).map_err(|e| {
            CacheError::StoreDirectory(format!("Failed to create {}: {}", blobs_dir.display(), e))
        })?;
        fs::create_dir_all(&snapshots_dir).map_err(|e| {
            CacheError::StoreDirectory(format!(
                "Failed to create {}: {}",
                snapshots_dir.display(),
                e
            ))
        })?;

        Ok(Self { blobs_dir, snapshots_dir, known_blobs: Mutex::new(HashSet::new()) })
    }

    /// Store a blob and return its digest.
    ///
    /// Already-present content is a no-op; the write itself goes through a
    /// temporary file so a crash never leaves a partial blob under its
    /// final name.
    pub fn store_blob(&self, data: &[u8]) -> Result<String, CacheError> {
        let digest = sha256_hex(data);

        if self.blob_exists(&digest) {
            debug!(digest = %digest, "Blob already exists");
            return Ok(digest);
        }

        let blob_path = self.blob_path(&digest);
        if let Some(parent) = blob_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = blob_path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&tmp_path, &blob_path)?;

        self.mark_known(&digest);
        debug!(digest = %digest, size = data.len(), "Stored new blob");

        Ok(digest)
    }

    /// Retrieve a blob by digest, verifying its content on the way out.
    pub fn read_blob(&self, digest: &str) -> Result<Vec<u8>, CacheError> {
        let data = fs::read(self.blob_path(digest))?;

        if sha256_hex(&data) != digest {
            return Err(CacheError::Corrupt {
                fingerprint: digest.to_string(),
                reason: "blob content does not match its digest".to_string(),
            });
        }

        Ok(data)
    }

    /// Check whether a blob exists.
    pub fn blob_exists(&self, digest: &str) -> bool {
        if let Ok(known) = self.known_blobs.lock() {
            if known.contains(digest) {
                return true;
            }
        }

        let exists = self.blob_path(digest).exists();
        if exists {
            self.mark_known(digest);
        }
        exists
    }

    /// Persist a snapshot's delta layer as a manifest under its fingerprint.
    ///
    /// The parent chain must already be stored; the build always stores
    /// snapshots bottom-up so this holds.
    pub fn store(&self, snapshot: &Snapshot) -> Result<(), CacheError> {
        Self::validate_fingerprint(&snapshot.fingerprint)?;

        let manifest = SnapshotManifest::from_snapshot(snapshot);
        self.write_manifest(&manifest)?;

        info!(
            fingerprint = %snapshot.fingerprint,
            stage = %snapshot.stage_name,
            entries = manifest.layer.entries.len(),
            "Stored snapshot manifest"
        );
        Ok(())
    }

    /// Look up a snapshot by fingerprint, rebuilding its layer stack from
    /// the manifest chain.
    ///
    /// A missing manifest for the requested fingerprint is a clean miss
    /// (`Ok(None)`). A broken chain under it is [`CacheError::Corrupt`].
    /// A hit refreshes the manifest's access time for LRU eviction.
    pub fn lookup(&self, fingerprint: &str) -> Result<Option<Snapshot>, CacheError> {
        if !self.snapshot_path(fingerprint).exists() {
            return Ok(None);
        }

        // Collect manifests newest-first, then stack layers oldest-first.
        let mut chain: Vec<SnapshotManifest> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut current = Some(fingerprint.to_string());

        while let Some(fp) = current {
            if !seen.insert(fp.clone()) {
                return Err(CacheError::Corrupt {
                    fingerprint: fingerprint.to_string(),
                    reason: format!("manifest chain loops at {}", fp),
                });
            }

            let manifest = self.read_manifest(&fp)?.ok_or_else(|| CacheError::Corrupt {
                fingerprint: fingerprint.to_string(),
                reason: format!("missing parent manifest {}", fp),
            })?;
            current = manifest.parent.clone();
            chain.push(manifest);
        }

        let mut touched = chain[0].clone();
        touched.last_accessed = Some(Utc::now());
        if let Err(err) = self.write_manifest(&touched) {
            debug!(fingerprint = %fingerprint, error = %err, "Could not refresh access time");
        }

        let top = &chain[0];
        let mut snapshot = Snapshot {
            fingerprint: top.fingerprint.clone(),
            stage_name: top.stage_name.clone(),
            created_at: top.created_at,
            parent: top.parent.clone(),
            layers: Vec::with_capacity(chain.len()),
        };
        for manifest in chain.iter().rev() {
            snapshot.layers.push(std::sync::Arc::new(manifest.layer.clone()));
        }

        debug!(fingerprint = %fingerprint, layers = snapshot.layers.len(), "Loaded snapshot");
        Ok(Some(snapshot))
    }

    /// Check whether a snapshot manifest exists.
    pub fn has_snapshot(&self, fingerprint: &str) -> bool {
        self.snapshot_path(fingerprint).exists()
    }

    /// Remove one snapshot manifest. Returns whether it existed.
    ///
    /// Blobs stay behind until the next garbage collection.
    pub fn remove(&self, fingerprint: &str) -> Result<bool, CacheError> {
        let path = self.snapshot_path(fingerprint);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path)?;
        debug!(fingerprint = %fingerprint, "Removed snapshot manifest");
        Ok(true)
    }

    /// Remove every snapshot and blob.
    pub fn clear(&self) -> Result<(), CacheError> {
        for entry in fs::read_dir(&self.snapshots_dir)? {
            let path = entry?.path();
            if path.is_file() {
                fs::remove_file(path)?;
            }
        }
        for subdir in fs::read_dir(&self.blobs_dir)? {
            let path = subdir?.path();
            if path.is_dir() {
                fs::remove_dir_all(path)?;
            }
        }

        if let Ok(mut known) = self.known_blobs.lock() {
            known.clear();
        }

        info!("Cleared snapshot store");
        Ok(())
    }

    /// Aggregate usage counters.
    pub fn stats(&self) -> Result<StoreStats, CacheError> {
        let mut stats = StoreStats::default();

        for entry in fs::read_dir(&self.snapshots_dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                stats.snapshots += 1;
            }
        }

        for subdir in fs::read_dir(&self.blobs_dir)? {
            let subdir = subdir?;
            if !subdir.path().is_dir() {
                continue;
            }
            for blob in fs::read_dir(subdir.path())? {
                let blob = blob?;
                if blob.path().is_file() {
                    stats.blobs += 1;
                    if let Ok(meta) = blob.metadata() {
                        stats.blob_bytes += meta.len();
                    }
                }
            }
        }

        Ok(stats)
    }

    /// All stored snapshot fingerprints.
    pub fn list_snapshots(&self) -> Result<Vec<Fingerprint>, CacheError> {
        let mut fingerprints = Vec::new();

        for entry in fs::read_dir(&self.snapshots_dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    fingerprints.push(stem.to_string());
                }
            }
        }

        fingerprints.sort();
        Ok(fingerprints)
    }

    /// Evict least-recently-used snapshots until blob usage fits under
    /// `max_bytes`.
    ///
    /// Only chain tips are evicted, so surviving snapshots always keep
    /// their full parent chains loadable.
    pub fn prune(&self, max_bytes: u64) -> Result<PruneReport, CacheError> {
        let mut report = PruneReport::default();

        loop {
            if self.stats()?.blob_bytes <= max_bytes {
                break;
            }

            let manifests = self.read_all_manifests()?;
            let parents: HashSet<String> =
                manifests.iter().filter_map(|m| m.parent.clone()).collect();

            let mut tips: Vec<&SnapshotManifest> = manifests
                .iter()
                .filter(|m| !parents.contains(&m.fingerprint))
                .collect();
            if tips.is_empty() {
                break;
            }
            tips.sort_by_key(|m| m.last_accessed.unwrap_or(m.created_at));

            let victim = tips[0];
            info!(
                fingerprint = %victim.fingerprint,
                stage = %victim.stage_name,
                "Evicting least-recently-used snapshot"
            );
            if self.remove(&victim.fingerprint)? {
                report.snapshots_removed += 1;
            }
            report.blobs_removed += self.gc_blobs()?;
        }

        if report.snapshots_removed > 0 {
            info!(
                snapshots = report.snapshots_removed,
                blobs = report.blobs_removed,
                "Pruned snapshot store"
            );
        }
        Ok(report)
    }

    /// Remove blobs not referenced by any stored manifest.
    ///
    /// Returns the number of blobs removed.
    pub fn gc_blobs(&self) -> Result<usize, CacheError> {
        let mut referenced: HashSet<String> = HashSet::new();
        for manifest in self.read_all_manifests()? {
            for entry in manifest.layer.entries.values() {
                if let FileKind::File { digest, .. } = &entry.kind {
                    referenced.insert(digest.clone());
                }
            }
        }

        let mut removed = 0;
        for subdir in fs::read_dir(&self.blobs_dir)? {
            let subdir = subdir?;
            if !subdir.path().is_dir() {
                continue;
            }
            for blob in fs::read_dir(subdir.path())? {
                let path = blob?.path();
                if let Some(digest) = path.file_name().and_then(|n| n.to_str()) {
                    if !referenced.contains(digest) {
                        fs::remove_file(&path)?;
                        if let Ok(mut known) = self.known_blobs.lock() {
                            known.remove(digest);
                        }
                        removed += 1;
                    }
                }
            }
        }

        if removed > 0 {
            debug!(removed, "Garbage collected unreferenced blobs");
        }
        Ok(removed)
    }

    fn read_manifest(&self, fingerprint: &str) -> Result<Option<SnapshotManifest>, CacheError> {
        let path = self.snapshot_path(fingerprint);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&fs::read_to_string(path)?)?))
    }

    fn read_all_manifests(&self) -> Result<Vec<SnapshotManifest>, CacheError> {
        let mut manifests = Vec::new();
        for fingerprint in self.list_snapshots()? {
            if let Some(manifest) = self.read_manifest(&fingerprint)? {
                manifests.push(manifest);
            }
        }
        Ok(manifests)
    }

    fn write_manifest(&self, manifest: &SnapshotManifest) -> Result<(), CacheError> {
        let path = self.snapshot_path(&manifest.fingerprint);
        let json = serde_json::to_string_pretty(manifest)?;

        let tmp_path = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        fs::write(&tmp_path, json)?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    fn mark_known(&self, digest: &str) {
        if let Ok(mut known) = self.known_blobs.lock() {
            known.insert(digest.to_string());
        }
    }

    fn validate_fingerprint(fingerprint: &str) -> Result<(), CacheError> {
        if fingerprint.is_empty() || !fingerprint.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CacheError::InvalidFingerprint(fingerprint.to_string()));
        }
        Ok(())
    }

    /// First two hex chars pick the subdirectory, keeping directory fanout
    /// manageable.
    fn blob_path(&self, digest: &str) -> PathBuf {
        let subdir = &digest[..2.min(digest.len())];
        self.blobs_dir.join(subdir).join(digest)
    }

    fn snapshot_path(&self, fingerprint: &str) -> PathBuf {
        self.snapshots_dir.join(format!("{}.json", fingerprint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::snapshot::{FileEntry, Layer};
    use tempfile::TempDir;

    fn layer_with(store: &SnapshotStore, path: &str, content: &[u8]) -> Layer {
        let digest = store.store_blob(content).unwrap();
        let mut layer = Layer::default();
        layer.entries.insert(
            path.to_string(),
            FileEntry {
                mode: 0o644,
                kind: FileKind::File { digest, size: content.len() as u64 },
                owner: None,
            },
        );
        layer
    }

    #[test]
    fn test_store_and_read_blob() {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::open(temp.path()).unwrap();

        let digest = store.store_blob(b"hello").unwrap();
        let digest2 = store.store_blob(b"hello").unwrap();
        assert_eq!(digest, digest2);

        assert_eq!(store.read_blob(&digest).unwrap(), b"hello");
        assert_eq!(store.stats().unwrap().blobs, 1);
    }

    #[test]
    fn test_read_blob_detects_corruption() {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::open(temp.path()).unwrap();

        let digest = store.store_blob(b"original").unwrap();
        fs::write(store.blob_path(&digest), b"tampered").unwrap();

        assert!(matches!(
            store.read_blob(&digest),
            Err(CacheError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_store_and_lookup_chain() {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::open(temp.path()).unwrap();

        let base = Snapshot::from_layer(
            "base",
            "aa11".to_string(),
            layer_with(&store, "/one", b"1"),
        );
        let derived = Snapshot::derive(
            &base,
            "app",
            "bb22".to_string(),
            layer_with(&store, "/two", b"2"),
        );

        store.store(&base).unwrap();
        store.store(&derived).unwrap();

        let loaded = store.lookup("bb22").unwrap().unwrap();
        assert_eq!(loaded.stage_name, "app");
        assert_eq!(loaded.layers.len(), 2);
        assert_eq!(loaded.created_at, derived.created_at);

        let view = loaded.resolve();
        assert!(view.contains_key("/one"));
        assert!(view.contains_key("/two"));
    }

    #[test]
    fn test_lookup_missing_is_clean_miss() {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::open(temp.path()).unwrap();

        assert!(store.lookup("dead").unwrap().is_none());
    }

    #[test]
    fn test_lookup_with_missing_parent_is_corrupt() {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::open(temp.path()).unwrap();

        let base = Snapshot::from_layer("base", "aa11".to_string(), Layer::default());
        let derived = Snapshot::derive(&base, "app", "bb22".to_string(), Layer::default());

        store.store(&derived).unwrap();
        // base never stored

        assert!(matches!(
            store.lookup("bb22"),
            Err(CacheError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_remove() {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::open(temp.path()).unwrap();

        let snap = Snapshot::from_layer("base", "aa11".to_string(), Layer::default());
        store.store(&snap).unwrap();

        assert!(store.has_snapshot("aa11"));
        assert!(store.remove("aa11").unwrap());
        assert!(!store.has_snapshot("aa11"));
        assert!(!store.remove("aa11").unwrap());
    }

    #[test]
    fn test_invalid_fingerprint_rejected() {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::open(temp.path()).unwrap();

        let snap = Snapshot::from_layer("base", "not hex!".to_string(), Layer::default());
        assert!(matches!(
            store.store(&snap),
            Err(CacheError::InvalidFingerprint(_))
        ));
    }

    #[test]
    fn test_clear() {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::open(temp.path()).unwrap();

        store.store_blob(b"data").unwrap();
        let snap = Snapshot::from_layer("base", "aa11".to_string(), Layer::default());
        store.store(&snap).unwrap();

        store.clear().unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.snapshots, 0);
        assert_eq!(stats.blobs, 0);
    }

    #[test]
    fn test_prune_evicts_lru_tip_and_gcs_blobs() {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::open(temp.path()).unwrap();

        let old = Snapshot::from_layer(
            "old",
            "aa11".to_string(),
            layer_with(&store, "/old", &[0u8; 1024]),
        );
        let fresh = Snapshot::from_layer(
            "fresh",
            "bb22".to_string(),
            layer_with(&store, "/fresh", &[1u8; 1024]),
        );
        store.store(&old).unwrap();
        store.store(&fresh).unwrap();

        // Touch "fresh" so "old" becomes the LRU victim
        store.lookup("bb22").unwrap().unwrap();

        let report = store.prune(1024).unwrap();
        assert_eq!(report.snapshots_removed, 1);
        assert_eq!(report.blobs_removed, 1);

        assert!(!store.has_snapshot("aa11"));
        assert!(store.has_snapshot("bb22"));
        assert!(store.stats().unwrap().blob_bytes <= 1024);
    }

    #[test]
    fn test_prune_never_breaks_chains() {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::open(temp.path()).unwrap();

        let base = Snapshot::from_layer(
            "base",
            "aa11".to_string(),
            layer_with(&store, "/base", &[0u8; 2048]),
        );
        let derived = Snapshot::derive(
            &base,
            "app",
            "bb22".to_string(),
            layer_with(&store, "/app", &[1u8; 512]),
        );
        store.store(&base).unwrap();
        store.store(&derived).unwrap();

        // Under pressure, the tip goes first even though the parent is
        // older and larger
        let report = store.prune(2048).unwrap();
        assert_eq!(report.snapshots_removed, 1);
        assert!(store.has_snapshot("aa11"));
        assert!(!store.has_snapshot("bb22"));
        assert!(store.lookup("aa11").unwrap().is_some());
    }
}
