//! Content-addressed base-image store with per-key single-flight fetch
//! coordination (§4.2).
//!
//! The teacher's `rt/hypervisor/images.rs` (`CloudImage::fetch`) downloads
//! and converts an image with no per-key locking at all — every spawn would
//! race to write the same base file. This module adds the coordination the
//! teacher lacks, in the teacher's own idiom: a process-wide
//! `Arc<Mutex<HashMap<Key, Arc<Mutex<()>>>>>`, the same shape
//! `rt/hypervisor/net/manager.rs`'s `NetworkManager` uses for its
//! `unavailable` address set.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

/// Writes the canonical content for `key` directly to `dest` (§4.2 step 3).
/// Implementations must write atomically: a temp file renamed into place,
/// or hold the caller's lock until the write is complete — `ImageCache`
/// itself does the latter by running the whole fetch under the per-key
/// mutex.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, dest: &Path) -> Result<()>;
}

/// Applied to `target_path` after materialization, e.g. extending a root
/// disk to `minimum_root_size`.
#[async_trait]
pub trait Postprocess: Send + Sync {
    async fn apply(&self, target_path: &Path) -> Result<()>;
}

pub struct ExtendToMinimumSize {
    pub minimum_bytes: u64,
}

#[async_trait]
impl Postprocess for ExtendToMinimumSize {
    async fn apply(&self, target_path: &Path) -> Result<()> {
        crate::disk::qemu_img_resize(target_path, self.minimum_bytes).await
    }
}

pub struct ImageCache {
    base_dir: PathBuf,
    /// Per-key single-flight mutexes. The outer mutex only ever protects a
    /// `HashMap::entry` call, never the fetch itself.
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl ImageCache {
    pub fn new(base_dir: PathBuf) -> Self {
        Self {
            base_dir,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn base_path(&self, key: &str) -> PathBuf {
        self.base_dir.join(key)
    }

    async fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(key.to_string()).or_default().clone()
    }

    /// Drop the map entry for `key` if no other waiter holds it — the
    /// mutex is coordination state, not a cache of the image itself
    /// (§4.2 step 4, §9 open question: conservative by construction since
    /// `Arc::strong_count` only reaches 1 once every waiter has returned
    /// its clone).
    async fn maybe_drop_key_lock(&self, key: &str, key_mutex: &Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        if let Some(entry) = locks.get(key) {
            if Arc::ptr_eq(entry, key_mutex) && Arc::strong_count(entry) <= 2 {
                // `2` = this local clone + the map's own entry.
                locks.remove(key);
            }
        }
    }

    #[instrument(skip(self, fetcher, post))]
    pub async fn materialize(
        &self,
        key: &str,
        target_path: &Path,
        fetcher: &dyn Fetcher,
        cow: bool,
        post: Option<&dyn Postprocess>,
    ) -> Result<()> {
        // Step 1: per-instance file already materialized.
        if tokio::fs::try_exists(target_path).await? {
            debug!(?target_path, "target already materialized");
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.base_dir).await?;
        let base_path = self.base_path(key);

        let key_mutex = self.key_lock(key).await;
        {
            let _guard = key_mutex.lock().await;
            if !tokio::fs::try_exists(&base_path).await? {
                info!(key, "fetching base image");
                let tmp_path = base_path.with_extension("tmp");
                fetcher.fetch(&tmp_path).await?;
                tokio::fs::rename(&tmp_path, &base_path).await?;
            }
        }
        self.maybe_drop_key_lock(key, &key_mutex).await;
        drop(key_mutex);

        if cow {
            crate::disk::qemu_img_create_cow(&base_path, target_path, 2 * 1024 * 1024).await?;
        } else {
            tokio::fs::copy(&base_path, target_path)
                .await
                .map_err(Error::from)?;
        }

        if let Some(post) = post {
            post.apply(target_path).await?;
        }

        Ok(())
    }
}

/// Writes a sparse zero-filled file of `size_bytes`, used for `disk.local`
/// scratch disks (§4.3) which are not derived from any base image.
pub struct SparseZeroFetcher {
    pub size_bytes: u64,
}

#[async_trait]
impl Fetcher for SparseZeroFetcher {
    async fn fetch(&self, dest: &Path) -> Result<()> {
        let file = tokio::fs::File::create(dest).await?;
        file.set_len(self.size_bytes).await?;
        Ok(())
    }
}

/// Delegates to an `ImageService` (§6) to populate the base file.
pub struct ImageServiceFetcher {
    pub service: Arc<dyn crate::store::ImageService>,
    pub image_id: u64,
    pub user: String,
    pub project: String,
}

#[async_trait]
impl Fetcher for ImageServiceFetcher {
    async fn fetch(&self, dest: &Path) -> Result<()> {
        self.service
            .fetch(self.image_id, dest, &self.user, &self.project)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingFetcher {
        calls: Arc<AtomicU32>,
        content: Vec<u8>,
    }

    #[async_trait]
    impl Fetcher for CountingFetcher {
        async fn fetch(&self, dest: &Path) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::fs::write(dest, &self.content).await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn single_producer_for_concurrent_same_key_fetches() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ImageCache::new(dir.path().join("_base")));
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for i in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            let target = dir.path().join(format!("target-{i}"));
            handles.push(tokio::spawn(async move {
                let fetcher = CountingFetcher {
                    calls: calls.clone(),
                    content: b"base-image-bytes".to_vec(),
                };
                cache
                    .materialize("0000002a", &target, &fetcher, false, None)
                    .await
                    .unwrap();
                target
            }));
        }

        for handle in handles {
            let target = handle.await.unwrap();
            let bytes = tokio::fs::read(&target).await.unwrap();
            assert_eq!(bytes, b"base-image-bytes");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn existing_target_short_circuits_without_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::new(dir.path().join("_base"));
        let target = dir.path().join("already-there");
        tokio::fs::write(&target, b"preexisting").await.unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let fetcher = CountingFetcher {
            calls: calls.clone(),
            content: b"should not be written".to_vec(),
        };
        cache
            .materialize("deadbeef", &target, &fetcher, false, None)
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(tokio::fs::read(&target).await.unwrap(), b"preexisting");
    }
}
