//! Base environment resolution.
//!
//! External bases are rootfs directories under the data directory's `bases/`
//! tree. Each is imported into the snapshot store once per identity and
//! reused by fingerprint afterwards. `scratch` is the built-in empty base.

use crate::builder::copy::scan_dir;
use crate::builder::executor::{BuildError, BuildResult};
use crate::builder::parser::BaseRef;
use crate::builder::snapshot::{sha256_hex, Fingerprint, Layer, Snapshot};
use crate::builder::store::SnapshotStore;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Stable identity of a base reference, as it enters stage fingerprints.
///
/// Identity follows the reference, not the imported bytes: re-importing a
/// changed rootfs under the same name reuses the old snapshot until the
/// cache is cleared or the reference is pinned with a digest.
pub fn base_identity(base: &BaseRef) -> String {
    base.canonical()
}

/// Fingerprint under which a base snapshot is cached.
pub fn base_fingerprint(base: &BaseRef) -> Fingerprint {
    sha256_hex(format!("base:{}", base.canonical()).as_bytes())
}

/// Produces snapshots for base references.
#[async_trait]
pub trait BaseProvider: Send + Sync {
    async fn fetch(&self, base: &BaseRef, fingerprint: &Fingerprint) -> BuildResult<Snapshot>;
}

/// Imports bases from local rootfs directories, one per base name.
pub struct LocalBaseProvider {
    bases_dir: PathBuf,
    store: Arc<SnapshotStore>,
}

impl LocalBaseProvider {
    pub fn new(bases_dir: PathBuf, store: Arc<SnapshotStore>) -> Self {
        Self { bases_dir, store }
    }

    /// Walk a rootfs directory into a single snapshot layer, storing file
    /// content in the blob store on the way.
    fn import_dir(
        &self,
        name: &str,
        root: &Path,
        fingerprint: &Fingerprint,
    ) -> BuildResult<Snapshot> {
        let layer = Layer {
            entries: scan_dir(root, &self.store)?,
            ..Layer::default()
        };
        Ok(Snapshot::from_layer(name, fingerprint.clone(), layer))
    }
}

#[async_trait]
impl BaseProvider for LocalBaseProvider {
    async fn fetch(&self, base: &BaseRef, fingerprint: &Fingerprint) -> BuildResult<Snapshot> {
        match base {
            BaseRef::Scratch => Ok(Snapshot::empty("scratch", fingerprint.clone())),
            BaseRef::External { name, .. } => {
                let root = self.bases_dir.join(name);
                if !root.is_dir() {
                    return Err(BuildError::UnknownBaseEnvironment {
                        base: base.canonical(),
                    });
                }
                info!(base = %base.canonical(), "Importing base environment");
                self.import_dir(name, &root, fingerprint)
            }
            BaseRef::Stage(name) => Err(BuildError::Internal {
                message: format!("stage reference '{}' reached the base provider", name),
            }),
        }
    }
}
