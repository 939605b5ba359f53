//! Content-addressed blob cache with LRU eviction.
//!
//! Blobs (layers, configs, manifests, downloaded base layers) are stored
//! by digest under `<cache_root>/blobs/sha256/<hex>` next to an index
//! file recording `(size, last_access, kind)` per digest:
//!
//! ```text
//! <cache_root>/
//!   index.json                 # digest -> entry metadata
//!   blobs/sha256/<hex>         # content-addressed blob files
//!   layers/<key>.json          # source tuples per built layer
//! ```
//!
//! ## Write model
//!
//! Writes stream through a uniquely named temp file while hashing, then
//! rename into place. Two writers racing on the same digest use distinct
//! temp files and the rename is atomic, so the last writer wins with
//! identical content. An interrupted write leaves only a temp file;
//! [`LayerCache::sweep`] removes orphans older than a grace period.
//!
//! ## Eviction
//!
//! `sweep(target)` evicts least-recently-used entries until the total
//! size fits the target. Entries pinned by a live [`PinGuard`] are never
//! evicted. Sweep takes the cache-wide guard exclusively; readers and
//! writers take it shared.
//!
//! ## Layer invalidation
//!
//! A built layer is keyed by a digest over its source tuples
//! `(archive_path, size, content_hash)` stored in a sidecar file. An
//! mtime-only touch leaves the key unchanged, so the cached blob is
//! reused; any size or content change produces a different key and the
//! layer goes cold.

use crate::constants::{
    CACHE_BLOBS_DIR, CACHE_DIR_NAME, CACHE_INDEX_FILE, CACHE_SIDECAR_DIR, DEFAULT_CACHE_CAPACITY,
    TEMP_FILE_GRACE_PERIOD,
};
use crate::digest::{Digest, HashingWriter};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// What kind of content a cache entry holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKind {
    Layer,
    Config,
    Manifest,
    BaseLayer,
}

/// Index metadata for one cached blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub size: u64,
    pub last_access: i64,
    pub kind: CacheKind,
}

/// One source file that went into a built layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    /// Path of the entry inside the archive.
    pub archive_path: String,
    pub size: u64,
    /// Content digest of the source file.
    pub content: Digest,
}

/// Sidecar document recording how a layer was built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerSources {
    pub digest: Digest,
    pub diff_id: Digest,
    pub size: u64,
    pub sources: Vec<SourceFile>,
}

/// Cache usage statistics.
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub capacity_bytes: u64,
}

/// Content-addressed blob cache shared across builds.
///
/// Thread-safe: blob operations take a shared guard, [`LayerCache::sweep`]
/// takes it exclusively. Cloning is cheap and shares state.
#[derive(Clone)]
pub struct LayerCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    root: PathBuf,
    capacity: u64,
    /// Shared for blob reads/writes, exclusive for sweep.
    guard: RwLock<()>,
    index: Mutex<BTreeMap<String, CacheEntry>>,
    pins: Mutex<HashMap<String, usize>>,
}

impl LayerCache {
    /// Opens (or creates) the cache at the default user location.
    pub fn new() -> Result<Self> {
        Self::with_root(Self::default_root(), DEFAULT_CACHE_CAPACITY)
    }

    /// Opens (or creates) a cache at `root` with the given byte capacity.
    pub fn with_root(root: PathBuf, capacity: u64) -> Result<Self> {
        fs::create_dir_all(root.join(CACHE_BLOBS_DIR).join("sha256")).map_err(|e| {
            Error::CacheInitFailed {
                path: root.clone(),
                reason: e.to_string(),
            }
        })?;
        fs::create_dir_all(root.join(CACHE_SIDECAR_DIR)).map_err(|e| Error::CacheInitFailed {
            path: root.clone(),
            reason: e.to_string(),
        })?;

        let index = Self::load_index(&root);
        info!("cache initialized at {}", root.display());

        Ok(Self {
            inner: Arc::new(CacheInner {
                root,
                capacity,
                guard: RwLock::new(()),
                index: Mutex::new(index),
                pins: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Default cache root under the user cache directory.
    pub fn default_root() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from(".cache"))
            .join(CACHE_DIR_NAME)
    }

    /// The cache root directory.
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Configured capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.inner.capacity
    }

    fn load_index(root: &Path) -> BTreeMap<String, CacheEntry> {
        let path = root.join(CACHE_INDEX_FILE);
        match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!("cache index unreadable, starting fresh: {}", e);
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        }
    }

    fn save_index(&self, index: &BTreeMap<String, CacheEntry>) -> Result<()> {
        let path = self.inner.root.join(CACHE_INDEX_FILE);
        let tmp = path.with_extension(format!("tmp.{}", uuid::Uuid::now_v7()));
        let bytes = serde_json::to_vec_pretty(index)?;
        fs::write(&tmp, bytes).map_err(|e| Error::io_at(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            Error::io_at(&path, e)
        })?;
        Ok(())
    }

    /// Path of a blob file for a digest.
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.inner
            .root
            .join(CACHE_BLOBS_DIR)
            .join("sha256")
            .join(digest.hex())
    }

    /// Pure membership test; does not touch access times.
    pub fn has(&self, digest: &Digest) -> bool {
        let _shared = self.inner.guard.read().unwrap();
        self.blob_path(digest).exists()
    }

    /// Opens a blob for reading and updates its last-access time.
    ///
    /// # Errors
    ///
    /// [`Error::BlobNotFound`] when the digest is absent.
    pub fn open(&self, digest: &Digest) -> Result<fs::File> {
        let _shared = self.inner.guard.read().unwrap();
        let path = self.blob_path(digest);
        let file = fs::File::open(&path).map_err(|_| Error::BlobNotFound {
            digest: digest.to_string(),
        })?;
        self.touch(digest);
        Ok(file)
    }

    /// Reads a whole blob into memory. Intended for configs/manifests,
    /// not layers.
    pub fn read_bytes(&self, digest: &Digest) -> Result<Vec<u8>> {
        let mut file = self.open(digest)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .map_err(|e| Error::io_at(self.blob_path(digest), e))?;
        Ok(buf)
    }

    fn touch(&self, digest: &Digest) {
        let mut index = self.inner.index.lock().unwrap();
        if let Some(entry) = index.get_mut(digest.as_str()) {
            entry.last_access = chrono::Utc::now().timestamp();
            let snapshot = index.clone();
            drop(index);
            let _ = self.save_index(&snapshot);
        }
    }

    /// Streams bytes into the cache, hashing on the way.
    ///
    /// Returns `(digest, size)`. If the digest is already present the
    /// temp file is discarded.
    pub fn put_stream(&self, mut reader: impl Read, kind: CacheKind) -> Result<(Digest, u64)> {
        let _shared = self.inner.guard.read().unwrap();

        let tmp = self
            .inner
            .root
            .join(CACHE_BLOBS_DIR)
            .join("sha256")
            .join(format!("tmp.{}", uuid::Uuid::now_v7()));

        let file = fs::File::create(&tmp).map_err(|e| Error::io_at(&tmp, e))?;
        let mut writer = HashingWriter::new(file);
        std::io::copy(&mut reader, &mut writer).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            Error::io_at(&tmp, e)
        })?;
        let (file, digest, size) = writer.finalize();
        file.sync_all().map_err(|e| Error::io_at(&tmp, e))?;
        drop(file);

        self.install_temp(&tmp, &digest, size, kind)?;
        Ok((digest, size))
    }

    /// Convenience wrapper for small blobs.
    pub fn put_bytes(&self, data: &[u8], kind: CacheKind) -> Result<(Digest, u64)> {
        self.put_stream(data, kind)
    }

    /// Installs an already-written temp file under its digest.
    ///
    /// Used by the layer builder, which writes through the tar pipeline
    /// into a temp file and learns the digest only at the end.
    pub fn install_temp(&self, tmp: &Path, digest: &Digest, size: u64, kind: CacheKind) -> Result<()> {
        let path = self.blob_path(digest);

        if path.exists() {
            debug!("blob {} already cached", digest);
            let _ = fs::remove_file(tmp);
        } else {
            fs::rename(tmp, &path).map_err(|e| {
                let _ = fs::remove_file(tmp);
                Error::io_at(&path, e)
            })?;
            debug!("cached blob {} ({} bytes)", digest, size);
        }

        let mut index = self.inner.index.lock().unwrap();
        index.insert(
            digest.to_string(),
            CacheEntry {
                size,
                last_access: chrono::Utc::now().timestamp(),
                kind,
            },
        );
        let snapshot = index.clone();
        drop(index);
        self.save_index(&snapshot)
    }

    /// Creates a uniquely named temp file path inside the blobs dir.
    pub fn temp_path(&self) -> PathBuf {
        self.inner
            .root
            .join(CACHE_BLOBS_DIR)
            .join("sha256")
            .join(format!("tmp.{}", uuid::Uuid::now_v7()))
    }

    /// Pins a digest against eviction for the guard's lifetime.
    pub fn pin(&self, digest: &Digest) -> PinGuard {
        let mut pins = self.inner.pins.lock().unwrap();
        *pins.entry(digest.to_string()).or_insert(0) += 1;
        PinGuard {
            cache: self.clone(),
            digest: digest.clone(),
        }
    }

    fn unpin(&self, digest: &Digest) {
        let mut pins = self.inner.pins.lock().unwrap();
        if let Some(count) = pins.get_mut(digest.as_str()) {
            *count -= 1;
            if *count == 0 {
                pins.remove(digest.as_str());
            }
        }
    }

    /// Evicts least-recently-used entries until the total size is at or
    /// below `target_bytes`, then removes orphaned temp files older than
    /// the grace period. Pinned entries are skipped.
    pub fn sweep(&self, target_bytes: u64) -> Result<u64> {
        let _exclusive = self.inner.guard.write().unwrap();

        let mut index = self.inner.index.lock().unwrap();
        let pins = self.inner.pins.lock().unwrap();

        let mut total: u64 = index.values().map(|e| e.size).sum();
        let mut freed = 0u64;

        if total > target_bytes {
            let mut by_age: Vec<(String, CacheEntry)> =
                index.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            by_age.sort_by_key(|(_, e)| e.last_access);

            for (digest_str, entry) in by_age {
                if total <= target_bytes {
                    break;
                }
                if pins.contains_key(&digest_str) {
                    debug!("sweep skipping pinned blob {}", digest_str);
                    continue;
                }
                if let Ok(digest) = Digest::parse(&digest_str) {
                    let _ = fs::remove_file(self.blob_path(&digest));
                }
                index.remove(&digest_str);
                total -= entry.size;
                freed += entry.size;
            }
        }

        let snapshot = index.clone();
        drop(pins);
        drop(index);
        self.save_index(&snapshot)?;

        self.remove_stale_temps();

        if freed > 0 {
            info!("sweep freed {} bytes", freed);
        }
        Ok(freed)
    }

    fn remove_stale_temps(&self) {
        let blobs = self.inner.root.join(CACHE_BLOBS_DIR).join("sha256");
        let Ok(entries) = fs::read_dir(&blobs) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with("tmp.") {
                continue;
            }
            let stale = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| SystemTime::now().duration_since(t).ok())
                .map(|age| age > TEMP_FILE_GRACE_PERIOD)
                .unwrap_or(false);
            if stale {
                let _ = fs::remove_file(entry.path());
            }
        }
    }

    /// Current usage statistics.
    pub fn stats(&self) -> CacheStats {
        let index = self.inner.index.lock().unwrap();
        CacheStats {
            entries: index.len(),
            total_bytes: index.values().map(|e| e.size).sum(),
            capacity_bytes: self.inner.capacity,
        }
    }

    /// Removes all blobs, sidecars, and the index.
    pub fn clear(&self) -> Result<()> {
        let _exclusive = self.inner.guard.write().unwrap();

        let blobs = self.inner.root.join(CACHE_BLOBS_DIR);
        if blobs.exists() {
            fs::remove_dir_all(&blobs).map_err(|e| Error::io_at(&blobs, e))?;
        }
        let sidecars = self.inner.root.join(CACHE_SIDECAR_DIR);
        if sidecars.exists() {
            fs::remove_dir_all(&sidecars).map_err(|e| Error::io_at(&sidecars, e))?;
        }
        let index_file = self.inner.root.join(CACHE_INDEX_FILE);
        if index_file.exists() {
            fs::remove_file(&index_file).map_err(|e| Error::io_at(&index_file, e))?;
        }

        fs::create_dir_all(blobs.join("sha256")).map_err(|e| Error::io_at(&blobs, e))?;
        fs::create_dir_all(&sidecars).map_err(|e| Error::io_at(&sidecars, e))?;

        self.inner.index.lock().unwrap().clear();
        info!("cache cleared");
        Ok(())
    }

    // =========================================================================
    // Layer source sidecars
    // =========================================================================

    /// Stable key over a source set: digest of the sorted tuple list.
    pub fn source_key(sources: &[SourceFile]) -> Digest {
        let mut sorted: Vec<&SourceFile> = sources.iter().collect();
        sorted.sort_by(|a, b| a.archive_path.cmp(&b.archive_path));

        let mut buf = Vec::new();
        for s in sorted {
            buf.extend_from_slice(s.archive_path.as_bytes());
            buf.push(0);
            buf.extend_from_slice(s.size.to_string().as_bytes());
            buf.push(0);
            buf.extend_from_slice(s.content.as_str().as_bytes());
            buf.push(0);
        }
        Digest::from_bytes(&buf)
    }

    fn sidecar_path(&self, key: &Digest) -> PathBuf {
        self.inner
            .root
            .join(CACHE_SIDECAR_DIR)
            .join(format!("{}.json", key.hex()))
    }

    /// Records how a layer was built so later builds can reuse it.
    pub fn record_layer_sources(&self, doc: &LayerSources) -> Result<()> {
        let key = Self::source_key(&doc.sources);
        let path = self.sidecar_path(&key);
        let tmp = path.with_extension(format!("tmp.{}", uuid::Uuid::now_v7()));
        fs::write(&tmp, serde_json::to_vec_pretty(doc)?).map_err(|e| Error::io_at(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            Error::io_at(&path, e)
        })?;
        Ok(())
    }

    /// Looks up a cached layer by its source set.
    ///
    /// Returns the sidecar only when the referenced blob still exists;
    /// a sidecar pointing at an evicted blob is treated as cold and
    /// removed.
    pub fn lookup_layer_sources(&self, sources: &[SourceFile]) -> Option<LayerSources> {
        let key = Self::source_key(sources);
        let path = self.sidecar_path(&key);
        let bytes = fs::read(&path).ok()?;
        let doc: LayerSources = serde_json::from_slice(&bytes).ok()?;

        if !self.has(&doc.digest) {
            let _ = fs::remove_file(&path);
            return None;
        }

        self.touch(&doc.digest);
        Some(doc)
    }
}

/// Keeps a digest pinned against eviction until dropped.
pub struct PinGuard {
    cache: LayerCache,
    digest: Digest,
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        self.cache.unpin(&self.digest);
    }
}
