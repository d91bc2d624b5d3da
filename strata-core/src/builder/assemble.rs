//! Image assembly.
//!
//! Turns a target stage's snapshot into an [`ImageDescriptor`]: runtime
//! metadata folded along the stage's base chain plus content statistics.
//! Descriptors are registered as JSON files under the data directory and
//! can be exported together with the materialized filesystem as a gzipped
//! tarball.

use crate::builder::executor::{BuildError, BuildResult};
use crate::builder::parser::{Instruction, RunCommand};
use crate::builder::snapshot::{sha256_hex, short_fingerprint, FileKind, Fingerprint, Snapshot};
use crate::builder::store::SnapshotStore;
use crate::error::{Result, StrataError};
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

/// Runtime metadata accumulated along a stage's base chain.
///
/// Env and label pairs merge per key, later values winning in place;
/// workdir, entrypoint, and cmd are replaced wholesale. External bases
/// contribute nothing, so the fold starts empty at the chain's root.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeMetadata {
    /// Environment pairs in first-declaration order
    pub env: Vec<(String, String)>,
    /// Label pairs in first-declaration order
    pub labels: Vec<(String, String)>,
    pub workdir: Option<String>,
    pub entrypoint: Option<RunCommand>,
    pub cmd: Option<RunCommand>,
}

impl RuntimeMetadata {
    /// Fold one instruction into the accumulated state. Instructions
    /// without a metadata effect are ignored.
    pub fn apply(&mut self, instruction: &Instruction) {
        match instruction {
            Instruction::Env { vars } => {
                for (key, value) in vars {
                    set_pair(&mut self.env, key, value);
                }
            }
            Instruction::Label { labels } => {
                for (key, value) in labels {
                    set_pair(&mut self.labels, key, value);
                }
            }
            Instruction::Workdir { path } => self.workdir = Some(path.clone()),
            Instruction::Entrypoint { command } => self.entrypoint = Some(command.clone()),
            Instruction::Cmd { command } => self.cmd = Some(command.clone()),
            _ => {}
        }
    }

    pub fn apply_all<'a>(&mut self, instructions: impl IntoIterator<Item = &'a Instruction>) {
        for instruction in instructions {
            self.apply(instruction);
        }
    }

    pub fn workdir_or_root(&self) -> &str {
        self.workdir.as_deref().unwrap_or("/")
    }
}

fn set_pair(pairs: &mut Vec<(String, String)>, key: &str, value: &str) {
    match pairs.iter_mut().find(|(k, _)| k == key) {
        Some(pair) => pair.1 = value.to_string(),
        None => pairs.push((key.to_string(), value.to_string())),
    }
}

/// A registered image: pointer to its snapshot plus runtime metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageDescriptor {
    pub image_id: String,
    pub stage_name: String,
    /// Fingerprint of the snapshot holding the image filesystem
    pub fingerprint: Fingerprint,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<RunCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<RunCommand>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    pub workdir: String,
    pub size_bytes: u64,
    pub entry_count: usize,
}

impl ImageDescriptor {
    /// Leading id chars for listings.
    pub fn short_id(&self) -> &str {
        short_fingerprint(&self.image_id)
    }
}

/// Image ids derive from the snapshot fingerprint, so assembling the same
/// stage again yields the same id.
fn image_id(fingerprint: &str) -> String {
    sha256_hex(format!("image:{}", fingerprint).as_bytes())
}

/// Build the descriptor for a completed target stage.
///
/// With `runnable` the image must define how it starts; an entrypoint or
/// a cmd somewhere along the chain satisfies that.
pub fn assemble(
    stage_name: &str,
    snapshot: &Snapshot,
    metadata: &RuntimeMetadata,
    runnable: bool,
) -> BuildResult<ImageDescriptor> {
    if runnable && metadata.entrypoint.is_none() && metadata.cmd.is_none() {
        return Err(BuildError::MissingEntryCommand { stage: stage_name.to_string() });
    }

    Ok(ImageDescriptor {
        image_id: image_id(&snapshot.fingerprint),
        stage_name: stage_name.to_string(),
        fingerprint: snapshot.fingerprint.clone(),
        created_at: snapshot.created_at,
        entrypoint: metadata.entrypoint.clone(),
        cmd: metadata.cmd.clone(),
        env: metadata.env.iter().cloned().collect(),
        labels: metadata.labels.iter().cloned().collect(),
        workdir: metadata.workdir_or_root().to_string(),
        size_bytes: snapshot.total_size(),
        entry_count: snapshot.entry_count(),
    })
}

/// Write a descriptor into the image registry, replacing any previous
/// registration under the same id.
pub fn register_image(images_dir: &Path, descriptor: &ImageDescriptor) -> Result<PathBuf> {
    fs::create_dir_all(images_dir).map_err(|e| StrataError::io(images_dir, e))?;

    let path = images_dir.join(format!("{}.json", descriptor.image_id));
    let data = serde_json::to_vec_pretty(descriptor)
        .map_err(|e| StrataError::Internal(format!("encoding image descriptor: {}", e)))?;

    let tmp = images_dir.join(format!(".tmp-{}", Uuid::new_v4()));
    fs::write(&tmp, &data).map_err(|e| StrataError::io(&tmp, e))?;
    fs::rename(&tmp, &path).map_err(|e| StrataError::io(&path, e))?;

    info!(
        image = %descriptor.short_id(),
        stage = %descriptor.stage_name,
        "Registered image"
    );
    Ok(path)
}

/// All registered images, newest first. Unreadable descriptor files are
/// skipped with a warning.
pub fn list_images(images_dir: &Path) -> Result<Vec<ImageDescriptor>> {
    if !images_dir.exists() {
        return Ok(Vec::new());
    }

    let mut images = Vec::new();
    for entry in fs::read_dir(images_dir).map_err(|e| StrataError::io(images_dir, e))? {
        let entry = entry.map_err(|e| StrataError::io(images_dir, e))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match read_descriptor(&path) {
            Ok(descriptor) => images.push(descriptor),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Skipping unreadable descriptor")
            }
        }
    }

    images.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(images)
}

/// Resolve an image reference, either a full id or a unique prefix.
pub fn load_descriptor(images_dir: &Path, reference: &str) -> Result<ImageDescriptor> {
    if reference.is_empty() {
        return Err(StrataError::ImageNotFound { image: reference.to_string() });
    }

    let exact = images_dir.join(format!("{}.json", reference));
    if exact.is_file() {
        return read_descriptor(&exact);
    }

    let mut matches: Vec<ImageDescriptor> = list_images(images_dir)?
        .into_iter()
        .filter(|image| image.image_id.starts_with(reference))
        .collect();

    match matches.len() {
        1 => Ok(matches.remove(0)),
        0 => Err(StrataError::ImageNotFound { image: reference.to_string() }),
        n => Err(StrataError::AmbiguousImage {
            image: reference.to_string(),
            count: n,
        }),
    }
}

fn read_descriptor(path: &Path) -> Result<ImageDescriptor> {
    let data = fs::read(path).map_err(|e| StrataError::io(path, e))?;
    serde_json::from_slice(&data).map_err(|e| StrataError::InvalidDescriptor {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Export an image as a gzipped tarball: the descriptor at
/// `descriptor.json` and the materialized filesystem under `rootfs/`.
///
/// Headers carry zeroed timestamps, so exporting the same image twice
/// produces identical bytes.
pub fn export_image(
    store: &SnapshotStore,
    descriptor: &ImageDescriptor,
    out_path: &Path,
) -> Result<()> {
    let snapshot = store.lookup(&descriptor.fingerprint)?.ok_or_else(|| {
        StrataError::Build(BuildError::StageNotMaterialized {
            stage: descriptor.stage_name.clone(),
        })
    })?;
    let view = snapshot.resolve();

    let file = fs::File::create(out_path).map_err(|e| StrataError::io(out_path, e))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut archive = tar::Builder::new(encoder);

    let json = serde_json::to_vec_pretty(descriptor)
        .map_err(|e| StrataError::Internal(format!("encoding image descriptor: {}", e)))?;
    let mut header = tar_header(tar::EntryType::Regular, 0o644, json.len() as u64, None)
        .map_err(|e| StrataError::io(out_path, e))?;
    archive
        .append_data(&mut header, "descriptor.json", json.as_slice())
        .map_err(|e| StrataError::io(out_path, e))?;

    for (path, entry) in &view {
        let name = format!("rootfs{}", path);
        let owner = entry.owner.as_deref();
        match &entry.kind {
            FileKind::Dir => {
                let mut header = tar_header(tar::EntryType::Directory, entry.mode, 0, owner)
                    .map_err(|e| StrataError::io(out_path, e))?;
                archive
                    .append_data(&mut header, format!("{}/", name), std::io::empty())
                    .map_err(|e| StrataError::io(out_path, e))?;
            }
            FileKind::File { digest, size } => {
                let data = store.read_blob(digest)?;
                let mut header = tar_header(tar::EntryType::Regular, entry.mode, *size, owner)
                    .map_err(|e| StrataError::io(out_path, e))?;
                archive
                    .append_data(&mut header, &name, data.as_slice())
                    .map_err(|e| StrataError::io(out_path, e))?;
            }
            FileKind::Symlink { target } => {
                let mut header = tar_header(tar::EntryType::Symlink, entry.mode, 0, owner)
                    .map_err(|e| StrataError::io(out_path, e))?;
                archive
                    .append_link(&mut header, &name, target)
                    .map_err(|e| StrataError::io(out_path, e))?;
            }
        }
    }

    let encoder = archive.into_inner().map_err(|e| StrataError::io(out_path, e))?;
    encoder.finish().map_err(|e| StrataError::io(out_path, e))?;

    info!(
        image = %descriptor.short_id(),
        path = %out_path.display(),
        entries = view.len(),
        "Exported image"
    );
    Ok(())
}

fn tar_header(
    entry_type: tar::EntryType,
    mode: u32,
    size: u64,
    owner: Option<&str>,
) -> std::io::Result<tar::Header> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mode(mode);
    header.set_size(size);
    if let Some(owner) = owner {
        let (user, group) = owner.split_once(':').unwrap_or((owner, owner));
        header.set_username(user)?;
        header.set_groupname(group)?;
    }
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::snapshot::{FileEntry, Layer};
    use crate::error::ErrorKind;
    use flate2::read::GzDecoder;
    use std::collections::HashMap;
    use std::io::Read;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> Instruction {
        Instruction::Env {
            vars: pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    #[test]
    fn test_metadata_last_wins_in_place() {
        let mut meta = RuntimeMetadata::default();
        meta.apply(&env(&[("A", "1"), ("B", "2")]));
        meta.apply(&env(&[("A", "3")]));

        assert_eq!(
            meta.env,
            vec![
                ("A".to_string(), "3".to_string()),
                ("B".to_string(), "2".to_string()),
            ]
        );
    }

    #[test]
    fn test_metadata_chain_fold() {
        let mut meta = RuntimeMetadata::default();

        // Base stage of the chain.
        meta.apply_all(&[
            env(&[("PATH_EXTRA", "/opt/bin")]),
            Instruction::Workdir { path: "/build".to_string() },
            Instruction::Entrypoint {
                command: RunCommand::Exec(vec!["/bin/server".to_string()]),
            },
        ]);
        // Derived stage overrides wholesale where it speaks.
        meta.apply_all(&[
            Instruction::Workdir { path: "/srv".to_string() },
            Instruction::Cmd { command: RunCommand::Shell("serve --all".to_string()) },
            Instruction::Label {
                labels: vec![("team".to_string(), "infra".to_string())],
            },
        ]);

        assert_eq!(meta.workdir_or_root(), "/srv");
        assert!(matches!(&meta.entrypoint, Some(RunCommand::Exec(argv)) if argv[0] == "/bin/server"));
        assert!(matches!(&meta.cmd, Some(RunCommand::Shell(line)) if line == "serve --all"));
        assert_eq!(meta.labels, vec![("team".to_string(), "infra".to_string())]);
    }

    #[test]
    fn test_metadata_ignores_run_and_copy() {
        let mut meta = RuntimeMetadata::default();
        meta.apply(&Instruction::Run {
            command: RunCommand::Shell("make".to_string()),
        });
        assert_eq!(meta, RuntimeMetadata::default());
    }

    fn snapshot_with_file(store: &SnapshotStore, data: &[u8]) -> Snapshot {
        let digest = store.store_blob(data).unwrap();
        let mut layer = Layer::default();
        layer.entries.insert(
            "/bin".to_string(),
            FileEntry { mode: 0o755, kind: FileKind::Dir, owner: None },
        );
        layer.entries.insert(
            "/bin/app".to_string(),
            FileEntry {
                mode: 0o755,
                kind: FileKind::File { digest, size: data.len() as u64 },
                owner: Some("app:app".to_string()),
            },
        );
        layer.entries.insert(
            "/bin/link".to_string(),
            FileEntry {
                mode: 0o777,
                kind: FileKind::Symlink { target: "app".to_string() },
                owner: None,
            },
        );
        Snapshot::from_layer("final", "d".repeat(64), layer)
    }

    #[test]
    fn test_assemble_runnable_requires_entry() {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::open(&temp.path().join("store")).unwrap();
        let snapshot = snapshot_with_file(&store, b"data");

        let err = assemble("final", &snapshot, &RuntimeMetadata::default(), true).unwrap_err();
        assert!(matches!(err, BuildError::MissingEntryCommand { stage } if stage == "final"));

        let mut meta = RuntimeMetadata::default();
        meta.cmd = Some(RunCommand::Exec(vec!["/bin/app".to_string()]));
        assert!(assemble("final", &snapshot, &meta, true).is_ok());

        // Without the runnable check an entry command is optional.
        assert!(assemble("final", &snapshot, &RuntimeMetadata::default(), false).is_ok());
    }

    #[test]
    fn test_assemble_descriptor_fields() {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::open(&temp.path().join("store")).unwrap();
        let snapshot = snapshot_with_file(&store, b"binary");

        let mut meta = RuntimeMetadata::default();
        meta.apply_all(&[
            env(&[("B", "2"), ("A", "1")]),
            Instruction::Entrypoint {
                command: RunCommand::Exec(vec!["/bin/app".to_string()]),
            },
        ]);

        let one = assemble("final", &snapshot, &meta, true).unwrap();
        let two = assemble("final", &snapshot, &meta, true).unwrap();
        assert_eq!(one, two);

        assert_eq!(one.fingerprint, snapshot.fingerprint);
        assert_eq!(one.created_at, snapshot.created_at);
        assert_eq!(one.size_bytes, 6);
        assert_eq!(one.entry_count, 3);
        assert_eq!(one.workdir, "/");
        assert_eq!(
            one.env.keys().collect::<Vec<_>>(),
            vec![&"A".to_string(), &"B".to_string()]
        );
        assert_eq!(one.image_id.len(), 64);
        assert_ne!(one.image_id, snapshot.fingerprint);
    }

    #[test]
    fn test_register_list_and_overwrite() {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::open(&temp.path().join("store")).unwrap();
        let images = temp.path().join("images");

        let older = snapshot_with_file(&store, b"one");
        let mut newer = snapshot_with_file(&store, b"two");
        newer.fingerprint = "e".repeat(64);
        newer.created_at = older.created_at + chrono::Duration::seconds(5);

        let meta = RuntimeMetadata::default();
        let first = assemble("a", &older, &meta, false).unwrap();
        let second = assemble("b", &newer, &meta, false).unwrap();

        register_image(&images, &first).unwrap();
        register_image(&images, &second).unwrap();
        register_image(&images, &second).unwrap();

        let listed = list_images(&images).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].stage_name, "b");
        assert_eq!(listed[1].stage_name, "a");
    }

    #[test]
    fn test_list_images_empty_dir() {
        let temp = TempDir::new().unwrap();
        assert!(list_images(&temp.path().join("missing")).unwrap().is_empty());
    }

    #[test]
    fn test_load_descriptor_by_prefix() {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::open(&temp.path().join("store")).unwrap();
        let images = temp.path().join("images");

        let snapshot = snapshot_with_file(&store, b"content");
        let descriptor = assemble("app", &snapshot, &RuntimeMetadata::default(), false).unwrap();
        register_image(&images, &descriptor).unwrap();

        let by_id = load_descriptor(&images, &descriptor.image_id).unwrap();
        assert_eq!(by_id, descriptor);

        let by_prefix = load_descriptor(&images, &descriptor.image_id[..10]).unwrap();
        assert_eq!(by_prefix, descriptor);

        assert!(matches!(
            load_descriptor(&images, "0000dead"),
            Err(StrataError::ImageNotFound { .. })
        ));
        assert!(load_descriptor(&images, "").is_err());
    }

    #[test]
    fn test_load_descriptor_ambiguous_prefix() {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::open(&temp.path().join("store")).unwrap();
        let images = temp.path().join("images");

        let snapshot = snapshot_with_file(&store, b"content");
        let descriptor = assemble("app", &snapshot, &RuntimeMetadata::default(), false).unwrap();
        register_image(&images, &descriptor).unwrap();

        // A second registration sharing the queried prefix.
        let mut twin = descriptor.clone();
        twin.image_id = format!("{}{}", &descriptor.image_id[..8], "0".repeat(56));
        register_image(&images, &twin).unwrap();

        let err = load_descriptor(&images, &descriptor.image_id[..8]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resolution);
        assert_eq!(err.kind().exit_code(), 2);
        match err {
            StrataError::AmbiguousImage { image, count } => {
                assert_eq!(image, descriptor.image_id[..8].to_string());
                assert_eq!(count, 2);
            }
            other => panic!("Expected ambiguous reference, got {:?}", other),
        }
    }

    #[test]
    fn test_export_round_trip() {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::open(&temp.path().join("store")).unwrap();
        let images = temp.path().join("images");

        let snapshot = snapshot_with_file(&store, b"payload");
        store.store(&snapshot).unwrap();
        let descriptor = assemble("final", &snapshot, &RuntimeMetadata::default(), false).unwrap();
        register_image(&images, &descriptor).unwrap();

        let out = temp.path().join("final.tar.gz");
        export_image(&store, &descriptor, &out).unwrap();

        let mut archive = tar::Archive::new(GzDecoder::new(fs::File::open(&out).unwrap()));
        let mut seen: HashMap<String, (tar::EntryType, u32, Vec<u8>, Option<String>)> =
            HashMap::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().into_owned();
            let entry_type = entry.header().entry_type();
            let mode = entry.header().mode().unwrap();
            let link = entry
                .link_name()
                .unwrap()
                .map(|l| l.to_string_lossy().into_owned());
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            seen.insert(path, (entry_type, mode, data, link));
        }

        let (_, _, data, _) = &seen["descriptor.json"];
        let embedded: ImageDescriptor = serde_json::from_slice(data).unwrap();
        assert_eq!(embedded, descriptor);

        let (kind, mode, data, _) = &seen["rootfs/bin/app"];
        assert_eq!(*kind, tar::EntryType::Regular);
        assert_eq!(*mode, 0o755);
        assert_eq!(data, b"payload");

        let (kind, _, _, link) = &seen["rootfs/bin/link"];
        assert_eq!(*kind, tar::EntryType::Symlink);
        assert_eq!(link.as_deref(), Some("app"));

        assert!(seen.contains_key("rootfs/bin/"));
    }

    #[test]
    fn test_export_missing_snapshot() {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::open(&temp.path().join("store")).unwrap();

        let snapshot = snapshot_with_file(&store, b"gone");
        let descriptor = assemble("final", &snapshot, &RuntimeMetadata::default(), false).unwrap();

        let out = temp.path().join("out.tar.gz");
        let err = export_image(&store, &descriptor, &out).unwrap_err();
        assert!(matches!(
            err,
            StrataError::Build(BuildError::StageNotMaterialized { .. })
        ));
    }
}
