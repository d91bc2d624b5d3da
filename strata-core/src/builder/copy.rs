//! Cross-stage copy resolution.
//!
//! Copies path subsets out of a completed stage's snapshot into the working
//! root of the stage being executed. Runs between that stage's other
//! instructions, so later commands see the copied files. Mode bits are
//! preserved, symlink targets are recreated verbatim, and ownership
//! overrides are recorded for the frozen layer (the files on disk keep the
//! build user).

use crate::builder::executor::{BuildError, BuildResult};
use crate::builder::snapshot::{normalize_path, FileEntry, FileKind, Snapshot};
use crate::builder::store::SnapshotStore;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

/// Write one snapshot entry to its on-disk location under `root`.
pub(crate) fn write_entry(
    root: &Path,
    store: &SnapshotStore,
    target: &str,
    entry: &FileEntry,
) -> BuildResult<()> {
    let disk = root.join(target.trim_start_matches('/'));
    if let Some(parent) = disk.parent() {
        fs::create_dir_all(parent).map_err(|e| BuildError::io(parent, e))?;
    }

    match &entry.kind {
        FileKind::Dir => {
            fs::create_dir_all(&disk).map_err(|e| BuildError::io(&disk, e))?;
            fs::set_permissions(&disk, fs::Permissions::from_mode(entry.mode))
                .map_err(|e| BuildError::io(&disk, e))?;
        }
        FileKind::File { digest, .. } => {
            let data = store.read_blob(digest)?;
            fs::write(&disk, data).map_err(|e| BuildError::io(&disk, e))?;
            fs::set_permissions(&disk, fs::Permissions::from_mode(entry.mode))
                .map_err(|e| BuildError::io(&disk, e))?;
        }
        FileKind::Symlink { target: link } => {
            if disk.symlink_metadata().is_ok() {
                fs::remove_file(&disk).map_err(|e| BuildError::io(&disk, e))?;
            }
            std::os::unix::fs::symlink(link, &disk).map_err(|e| BuildError::io(&disk, e))?;
        }
    }

    Ok(())
}

/// Materialize a full resolved view under `root`.
///
/// Directories first so mode bits on them survive child creation.
pub(crate) fn write_view(
    root: &Path,
    store: &SnapshotStore,
    view: &BTreeMap<String, FileEntry>,
) -> BuildResult<()> {
    for (path, entry) in view {
        write_entry(root, store, path, entry)?;
    }
    Ok(())
}

/// Read a directory tree back into snapshot entries, storing file content
/// in the blob store on the way. The inverse of [`write_view`].
///
/// Symlinks are captured by target, never followed. Ownership is left
/// unset; callers layer recorded overrides on top.
pub(crate) fn scan_dir(
    root: &Path,
    store: &SnapshotStore,
) -> BuildResult<BTreeMap<String, FileEntry>> {
    let mut entries = BTreeMap::new();

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| {
            let path = e
                .path()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| root.to_path_buf());
            match e.into_io_error() {
                Some(io) => BuildError::io(path, io),
                None => BuildError::Internal {
                    message: format!("walking {}", root.display()),
                },
            }
        })?;

        if entry.path() == root {
            continue;
        }

        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|_| BuildError::Internal {
                message: format!("entry {} escapes its root", entry.path().display()),
            })?;
        let path = format!("/{}", rel.to_string_lossy());

        let meta = entry
            .path()
            .symlink_metadata()
            .map_err(|e| BuildError::io(entry.path(), e))?;
        let mode = meta.permissions().mode() & 0o7777;

        let kind = if meta.file_type().is_symlink() {
            let target = fs::read_link(entry.path())
                .map_err(|e| BuildError::io(entry.path(), e))?;
            FileKind::Symlink { target: target.to_string_lossy().into_owned() }
        } else if meta.is_dir() {
            FileKind::Dir
        } else {
            let data = fs::read(entry.path()).map_err(|e| BuildError::io(entry.path(), e))?;
            let digest = store.store_blob(&data)?;
            FileKind::File { digest, size: data.len() as u64 }
        };

        entries.insert(path, FileEntry { mode, kind, owner: None });
    }

    Ok(entries)
}

/// Apply one copy directive against a materialized source snapshot.
///
/// Destination rules: a single file or symlink source copies to the
/// destination path itself, unless the destination ends with `/`; multiple
/// sources and directory sources land under the destination directory by
/// their base name. Returns ownership overrides keyed by destination path.
pub fn resolve_copy(
    root: &Path,
    store: &SnapshotStore,
    source_stage: &str,
    source: &Snapshot,
    sources: &[String],
    destination: &str,
    owner: Option<&str>,
) -> BuildResult<HashMap<String, String>> {
    let view = source.resolve();
    let dest_is_dir = destination.ends_with('/') || sources.len() > 1;
    let dest = normalize_path(destination);
    let mut owners: HashMap<String, String> = HashMap::new();
    let mut copied = 0usize;

    for raw_source in sources {
        let source_path = normalize_path(raw_source);

        // The root is not itself an entry; copying it merges the whole
        // source tree into the destination.
        if source_path == "/" {
            for (path, sub) in &view {
                let target = join_under(&dest, path.trim_start_matches('/'));
                write_entry(root, store, &target, sub)?;
                record_owner(&mut owners, owner, &target);
                copied += 1;
            }
            continue;
        }

        let entry = view
            .get(&source_path)
            .ok_or_else(|| BuildError::SourcePathNotFound {
                source_stage: source_stage.to_string(),
                path: source_path.clone(),
            })?;

        match &entry.kind {
            FileKind::Dir => {
                // The directory lands under the destination by base name
                let base = join_under(&dest, basename(&source_path));

                for (path, sub) in &view {
                    let rest = match subtree_rest(path, &source_path) {
                        Some(rest) => rest,
                        None => continue,
                    };
                    let target = if rest.is_empty() {
                        base.clone()
                    } else {
                        join_under(&base, rest)
                    };
                    write_entry(root, store, &target, sub)?;
                    record_owner(&mut owners, owner, &target);
                    copied += 1;
                }
            }
            FileKind::File { .. } | FileKind::Symlink { .. } => {
                let target = if dest_is_dir {
                    join_under(&dest, basename(&source_path))
                } else {
                    dest.clone()
                };
                write_entry(root, store, &target, entry)?;
                record_owner(&mut owners, owner, &target);
                copied += 1;
            }
        }
    }

    debug!(
        source = %source_stage,
        entries = copied,
        dest = %dest,
        "Applied copy directive"
    );

    Ok(owners)
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn join_under(dest: &str, name: &str) -> String {
    normalize_path(&format!("{}/{}", dest, name))
}

fn record_owner(owners: &mut HashMap<String, String>, owner: Option<&str>, target: &str) {
    if let Some(owner) = owner {
        owners.insert(target.to_string(), owner.to_string());
    }
}

/// If `path` equals the prefix or sits inside it, the remainder without a
/// leading slash.
fn subtree_rest<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    if path == prefix {
        return Some("");
    }
    path.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::snapshot::Layer;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        root: std::path::PathBuf,
        store: SnapshotStore,
        source: Snapshot,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::open(&temp.path().join("store")).unwrap();
        let root = temp.path().join("work");
        fs::create_dir_all(&root).unwrap();

        let tool = store.store_blob(b"#!/bin/sh\necho tool\n").unwrap();
        let conf = store.store_blob(b"key=value\n").unwrap();

        let mut layer = Layer::default();
        layer.entries.insert(
            "/bin".to_string(),
            FileEntry { mode: 0o755, kind: FileKind::Dir, owner: None },
        );
        layer.entries.insert(
            "/bin/tool".to_string(),
            FileEntry {
                mode: 0o755,
                kind: FileKind::File { digest: tool, size: 19 },
                owner: None,
            },
        );
        layer.entries.insert(
            "/etc".to_string(),
            FileEntry { mode: 0o755, kind: FileKind::Dir, owner: None },
        );
        layer.entries.insert(
            "/etc/app.conf".to_string(),
            FileEntry {
                mode: 0o644,
                kind: FileKind::File { digest: conf, size: 10 },
                owner: None,
            },
        );
        layer.entries.insert(
            "/bin/t".to_string(),
            FileEntry {
                mode: 0o777,
                kind: FileKind::Symlink { target: "tool".to_string() },
                owner: None,
            },
        );

        let source = Snapshot::from_layer("builder", "ab12".to_string(), layer);
        Fixture { _temp: temp, root, store, source }
    }

    #[test]
    fn test_single_file_to_exact_destination() {
        let f = fixture();
        resolve_copy(
            &f.root,
            &f.store,
            "builder",
            &f.source,
            &["/bin/tool".to_string()],
            "/usr/local/bin/tool",
            None,
        )
        .unwrap();

        let disk = f.root.join("usr/local/bin/tool");
        assert!(disk.is_file());
        assert_eq!(disk.metadata().unwrap().permissions().mode() & 0o7777, 0o755);
    }

    #[test]
    fn test_trailing_slash_places_under_destination() {
        let f = fixture();
        resolve_copy(
            &f.root,
            &f.store,
            "builder",
            &f.source,
            &["/bin/tool".to_string()],
            "/opt/",
            None,
        )
        .unwrap();

        assert!(f.root.join("opt/tool").is_file());
    }

    #[test]
    fn test_multiple_sources_land_under_destination() {
        let f = fixture();
        resolve_copy(
            &f.root,
            &f.store,
            "builder",
            &f.source,
            &["/bin/tool".to_string(), "/etc/app.conf".to_string()],
            "/dest",
            None,
        )
        .unwrap();

        assert!(f.root.join("dest/tool").is_file());
        assert!(f.root.join("dest/app.conf").is_file());
    }

    #[test]
    fn test_directory_source_copies_subtree() {
        let f = fixture();
        resolve_copy(
            &f.root,
            &f.store,
            "builder",
            &f.source,
            &["/bin".to_string()],
            "/usr",
            None,
        )
        .unwrap();

        assert!(f.root.join("usr/bin").is_dir());
        assert!(f.root.join("usr/bin/tool").is_file());
        let link = f.root.join("usr/bin/t");
        assert_eq!(fs::read_link(link).unwrap().to_str(), Some("tool"));
    }

    #[test]
    fn test_symlink_not_dereferenced() {
        let f = fixture();
        resolve_copy(
            &f.root,
            &f.store,
            "builder",
            &f.source,
            &["/bin/t".to_string()],
            "/t",
            None,
        )
        .unwrap();

        let disk = f.root.join("t");
        assert!(disk.symlink_metadata().unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(disk).unwrap().to_str(), Some("tool"));
    }

    #[test]
    fn test_missing_source_path() {
        let f = fixture();
        let err = resolve_copy(
            &f.root,
            &f.store,
            "builder",
            &f.source,
            &["/bin/absent".to_string()],
            "/x",
            None,
        )
        .unwrap_err();

        match err {
            BuildError::SourcePathNotFound { source_stage, path } => {
                assert_eq!(source_stage, "builder");
                assert_eq!(path, "/bin/absent");
            }
            other => panic!("Expected SourcePathNotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_owner_override_recorded() {
        let f = fixture();
        let owners = resolve_copy(
            &f.root,
            &f.store,
            "builder",
            &f.source,
            &["/bin".to_string()],
            "/srv",
            Some("app:app"),
        )
        .unwrap();

        assert_eq!(owners.get("/srv/bin").map(String::as_str), Some("app:app"));
        assert_eq!(
            owners.get("/srv/bin/tool").map(String::as_str),
            Some("app:app")
        );
    }

    #[test]
    fn test_copy_root_merges_tree() {
        let f = fixture();
        resolve_copy(
            &f.root,
            &f.store,
            "builder",
            &f.source,
            &["/".to_string()],
            "/merged",
            None,
        )
        .unwrap();

        assert!(f.root.join("merged/bin/tool").is_file());
        assert!(f.root.join("merged/etc/app.conf").is_file());
    }
}
