//! Fingerprint-keyed snapshot cache with request coalescing.
//!
//! Front-ends the on-disk store for one build run. The first request for a
//! fingerprint claims an in-flight slot and executes; concurrent requests
//! for the same fingerprint wait on that slot instead of executing again,
//! so each fingerprint runs at most once per process. Store failures are
//! logged and treated as misses, never as build failures.

use crate::builder::executor::{BuildError, BuildResult};
use crate::builder::snapshot::{Fingerprint, Snapshot};
use crate::builder::store::SnapshotStore;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, warn};

/// How a snapshot request was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Found in memory or on disk, nothing executed
    Hit,
    /// Executed by this request
    Executed,
    /// Waited for an execution another request had already started
    Coalesced,
}

/// What waiters receive: the snapshot, or the failure rendered to text.
type Outcome = Result<Arc<Snapshot>, String>;

enum Slot {
    InFlight(watch::Receiver<Option<Outcome>>),
    Ready(Arc<Snapshot>),
}

/// What claiming a fingerprint's slot yielded.
enum Claim {
    /// Finished snapshot already in memory
    Ready(Arc<Snapshot>),
    /// Another request is executing; wait on its slot
    Wait(watch::Receiver<Option<Outcome>>),
    /// This request owns execution and publishes through the sender
    Claimed(watch::Sender<Option<Outcome>>),
}

/// Per-run snapshot cache.
pub struct SnapshotCache {
    store: Arc<SnapshotStore>,
    slots: Mutex<HashMap<Fingerprint, Slot>>,
}

impl SnapshotCache {
    pub fn new(store: Arc<SnapshotStore>) -> Self {
        Self { store, slots: Mutex::new(HashMap::new()) }
    }

    /// Return the snapshot for `fingerprint`, executing `execute` only if
    /// no other request has produced or claimed it.
    ///
    /// With `no_cache` the on-disk store is not consulted, but in-memory
    /// results from this run still count, keeping execution at-most-once.
    /// A failed execution releases the slot, so a later request may retry.
    pub async fn get_or_execute<F, Fut>(
        &self,
        fingerprint: &Fingerprint,
        stage_name: &str,
        no_cache: bool,
        execute: F,
    ) -> BuildResult<(Arc<Snapshot>, CacheStatus)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = BuildResult<Snapshot>>,
    {
        let tx = match self.claim(fingerprint) {
            Claim::Ready(snap) => return Ok((snap, CacheStatus::Hit)),
            Claim::Wait(rx) => return self.wait(fingerprint, stage_name, rx).await,
            Claim::Claimed(tx) => tx,
        };

        if !no_cache {
            match self.store.lookup(fingerprint) {
                Ok(Some(snapshot)) => {
                    debug!(fingerprint = %fingerprint, stage = %stage_name, "Cache hit");
                    let snap = Arc::new(snapshot);
                    self.finish(fingerprint, &tx, snap.clone());
                    return Ok((snap, CacheStatus::Hit));
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(
                        fingerprint = %fingerprint,
                        stage = %stage_name,
                        error = %err,
                        "Cache read failed; treating as miss"
                    );
                }
            }
        }

        debug!(fingerprint = %fingerprint, stage = %stage_name, "Cache miss; executing");
        match execute().await {
            Ok(snapshot) => {
                if let Err(err) = self.store.store(&snapshot) {
                    warn!(
                        fingerprint = %fingerprint,
                        error = %err,
                        "Failed to persist snapshot; keeping result in memory"
                    );
                }
                let snap = Arc::new(snapshot);
                self.finish(fingerprint, &tx, snap.clone());
                Ok((snap, CacheStatus::Executed))
            }
            Err(err) => {
                self.slots().remove(fingerprint);
                let _ = tx.send(Some(Err(err.to_string())));
                Err(err)
            }
        }
    }

    /// Claim the slot for `fingerprint`, or report who holds it. The lock
    /// guards only map access and is held only within this call.
    fn claim(&self, fingerprint: &Fingerprint) -> Claim {
        let mut slots = self.slots();
        match slots.get(fingerprint) {
            Some(Slot::Ready(snap)) => Claim::Ready(snap.clone()),
            Some(Slot::InFlight(rx)) => Claim::Wait(rx.clone()),
            None => {
                let (tx, rx) = watch::channel(None);
                slots.insert(fingerprint.clone(), Slot::InFlight(rx));
                Claim::Claimed(tx)
            }
        }
    }

    /// Publish a completed snapshot: replace the in-flight slot and wake
    /// anyone holding a wait handle.
    fn finish(&self, fingerprint: &Fingerprint, tx: &watch::Sender<Option<Outcome>>, snap: Arc<Snapshot>) {
        self.slots().insert(fingerprint.clone(), Slot::Ready(snap.clone()));
        let _ = tx.send(Some(Ok(snap)));
    }

    async fn wait(
        &self,
        fingerprint: &str,
        stage_name: &str,
        mut rx: watch::Receiver<Option<Outcome>>,
    ) -> BuildResult<(Arc<Snapshot>, CacheStatus)> {
        debug!(fingerprint = %fingerprint, stage = %stage_name, "Waiting on in-flight execution");
        loop {
            let outcome = rx.borrow_and_update().clone();
            if let Some(outcome) = outcome {
                return match outcome {
                    Ok(snap) => Ok((snap, CacheStatus::Coalesced)),
                    Err(message) => Err(BuildError::Coalesced {
                        fingerprint: fingerprint.to_string(),
                        message,
                    }),
                };
            }
            if rx.changed().await.is_err() {
                // Sender dropped without publishing: the executing task
                // was aborted mid-flight.
                return Err(BuildError::Coalesced {
                    fingerprint: fingerprint.to_string(),
                    message: "execution abandoned before completing".to_string(),
                });
            }
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<Fingerprint, Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::snapshot::Layer;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_cache() -> (TempDir, SnapshotCache) {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(SnapshotStore::open(temp.path()).unwrap());
        (temp, SnapshotCache::new(store))
    }

    fn made(fp: &str) -> Snapshot {
        Snapshot::from_layer("stage", fp.to_string(), Layer::default())
    }

    #[tokio::test]
    async fn test_miss_executes_then_hits() {
        let (_temp, cache) = test_cache();
        let fp: Fingerprint = "aa".repeat(32);
        let count = AtomicUsize::new(0);

        let (snap, status) = cache
            .get_or_execute(&fp, "stage", false, || async {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(made(&fp))
            })
            .await
            .unwrap();
        assert_eq!(status, CacheStatus::Executed);
        assert_eq!(snap.fingerprint, fp);

        let (_, status) = cache
            .get_or_execute(&fp, "stage", false, || async {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(made(&fp))
            })
            .await
            .unwrap();
        assert_eq!(status, CacheStatus::Hit);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disk_hit_without_execution() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(SnapshotStore::open(temp.path()).unwrap());
        let fp: Fingerprint = "bb".repeat(32);
        store.store(&made(&fp)).unwrap();

        let cache = SnapshotCache::new(store);
        let count = AtomicUsize::new(0);

        let (_, status) = cache
            .get_or_execute(&fp, "stage", false, || async {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(made(&fp))
            })
            .await
            .unwrap();
        assert_eq!(status, CacheStatus::Hit);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_concurrent_requests_coalesce() {
        let (_temp, cache) = test_cache();
        let cache = Arc::new(cache);
        let fp: Fingerprint = "cc".repeat(32);
        let count = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(tokio::sync::Notify::new());

        let primary = {
            let cache = cache.clone();
            let fp = fp.clone();
            let count = count.clone();
            let release = release.clone();
            tokio::spawn(async move {
                let produced = fp.clone();
                cache
                    .get_or_execute(&fp, "stage", false, move || async move {
                        count.fetch_add(1, Ordering::SeqCst);
                        release.notified().await;
                        Ok(made(&produced))
                    })
                    .await
            })
        };

        // Let the primary claim the in-flight slot
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut waiters = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            let fp = fp.clone();
            let count = count.clone();
            waiters.push(tokio::spawn(async move {
                let produced = fp.clone();
                cache
                    .get_or_execute(&fp, "stage", false, move || async move {
                        count.fetch_add(1, Ordering::SeqCst);
                        Ok(made(&produced))
                    })
                    .await
            }));
        }

        // Let the waiters reach the in-flight slot, then finish the primary
        tokio::time::sleep(Duration::from_millis(10)).await;
        release.notify_one();

        let (_, status) = primary.await.unwrap().unwrap();
        assert_eq!(status, CacheStatus::Executed);

        for waiter in waiters {
            let (snap, status) = waiter.await.unwrap().unwrap();
            assert_eq!(status, CacheStatus::Coalesced);
            assert_eq!(snap.fingerprint, fp);
        }

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_releases_slot_for_retry() {
        let (_temp, cache) = test_cache();
        let fp: Fingerprint = "dd".repeat(32);

        let result = cache
            .get_or_execute(&fp, "stage", false, || async {
                Err(BuildError::Internal { message: "boom".to_string() })
            })
            .await;
        assert!(result.is_err());

        let (_, status) = cache
            .get_or_execute(&fp, "stage", false, || async { Ok(made(&fp)) })
            .await
            .unwrap();
        assert_eq!(status, CacheStatus::Executed);
    }

    #[tokio::test]
    async fn test_no_cache_bypasses_store_but_not_memory() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(SnapshotStore::open(temp.path()).unwrap());
        let fp: Fingerprint = "ee".repeat(32);
        store.store(&made(&fp)).unwrap();

        let cache = SnapshotCache::new(store);

        let (_, status) = cache
            .get_or_execute(&fp, "stage", true, || async { Ok(made(&fp)) })
            .await
            .unwrap();
        assert_eq!(status, CacheStatus::Executed);

        // Same run, same fingerprint: the in-memory result is reused
        let (_, status) = cache
            .get_or_execute(&fp, "stage", true, || async { Ok(made(&fp)) })
            .await
            .unwrap();
        assert_eq!(status, CacheStatus::Hit);
    }

    #[tokio::test]
    async fn test_corrupt_manifest_degrades_to_miss() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(SnapshotStore::open(temp.path()).unwrap());
        let fp: Fingerprint = "ff".repeat(32);
        std::fs::write(
            temp.path().join("snapshots").join(format!("{}.json", fp)),
            b"{ not json",
        )
        .unwrap();

        let cache = SnapshotCache::new(store);
        let (_, status) = cache
            .get_or_execute(&fp, "stage", false, || async { Ok(made(&fp)) })
            .await
            .unwrap();
        assert_eq!(status, CacheStatus::Executed);
    }

    // Requests run inside spawned tasks, so the future must be Send.
    #[test]
    fn test_request_future_is_send() {
        fn require_send<F: Send>(_: &F) {}

        let (_temp, cache) = test_cache();
        let fp: Fingerprint = "11".repeat(32);
        let fut = cache.get_or_execute(&fp, "stage", false, || async { Ok(made(&fp)) });
        require_send(&fut);
    }
}
