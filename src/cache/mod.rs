//! The local object cache: size-bounded, ETag-validating, safe to share
//! with concurrent peer processes.
//!
//! On-disk truth per entry is `{fingerprint}` (body), `{fingerprint}.meta`
//! (serialized [`CacheEntry`]), and `{fingerprint}.lock` (inter-process
//! advisory lock held during population). A `.index` summary is rewritten at
//! each refresh as a startup hint; the filesystem is authoritative.

mod entry;
mod eviction;

pub use self::entry::{fingerprint, CacheEntry};
pub use self::eviction::EvictionPolicy;

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use fs2::FileExt;

use self::entry::{body_path, lock_path, meta_path};
use crate::config::{parse_size, CacheSchema};
use crate::providers::{bytes_stream, collect_stream, StorageProvider};
use crate::{Error, Result};

/// Advisory on-disk summary, rewritten at each refresh.
const INDEX_HINT: &str = ".index";

/// Bound applied when the configuration does not name one.
const DEFAULT_MAX_SIZE: u64 = 100 << 30;

/// Realized cache settings.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Total body-bytes bound.
    pub max_size: u64,
    /// Validate cached bodies against backend ETags.
    pub use_etag: bool,
    /// Victim selection rule.
    pub policy: EvictionPolicy,
    /// Maintenance rescan cadence.
    pub refresh_interval: Duration,
    /// Directory holding bodies, entry metadata, and locks.
    pub cache_path: PathBuf,
}

impl Default for CacheOptions {
    fn default() -> Self {
        CacheOptions {
            max_size: DEFAULT_MAX_SIZE,
            use_etag: true,
            policy: EvictionPolicy::Fifo,
            refresh_interval: Duration::from_secs(300),
            cache_path: std::env::temp_dir().join("msc_cache"),
        }
    }
}

impl CacheOptions {
    /// Realizes options from the config file schema.
    pub fn from_schema(schema: &CacheSchema) -> Result<Self> {
        let defaults = CacheOptions::default();
        Ok(CacheOptions {
            max_size: match &schema.size {
                Some(size) => parse_size(size)?,
                None => defaults.max_size,
            },
            use_etag: schema.use_etag,
            policy: schema.eviction_policy.policy.parse()?,
            refresh_interval: Duration::from_secs(schema.eviction_policy.refresh_interval),
            cache_path: schema
                .cache_backend
                .as_ref()
                .and_then(|b| b.cache_path.as_deref())
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_path),
        })
    }
}

#[derive(Debug, Default)]
struct IndexState {
    entries: HashMap<String, CacheEntry>,
    total_size: u64,
    last_refresh: Option<Instant>,
}

/// A size-bounded body cache shared by every client in the process, and,
/// through the filesystem, with concurrent peer processes.
pub struct Cache {
    dir: PathBuf,
    max_size: u64,
    use_etag: bool,
    policy: EvictionPolicy,
    refresh_interval: Duration,
    // Early-access mode: bodies delegated to a second storage provider,
    // local disk holds only metadata, eviction is a no-op.
    backend: Option<Arc<dyn StorageProvider>>,
    state: Mutex<IndexState>,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("dir", &self.dir)
            .field("max_size", &self.max_size)
            .field("policy", &self.policy)
            .field("backend", &self.backend.as_ref().map(|b| b.name()))
            .finish()
    }
}

impl Cache {
    /// Opens (creating if needed) a disk cache.
    pub fn new(options: CacheOptions) -> Result<Self> {
        Cache::build(options, None)
    }

    /// Opens a cache whose bodies live on `backend`, keyed by fingerprint.
    pub fn with_backend(options: CacheOptions, backend: Arc<dyn StorageProvider>) -> Result<Self> {
        Cache::build(options, Some(backend))
    }

    fn build(options: CacheOptions, backend: Option<Arc<dyn StorageProvider>>) -> Result<Self> {
        std::fs::create_dir_all(&options.cache_path).map_err(Error::cache)?;
        let mut state = IndexState::default();
        // Warm from the hint; the first refresh reconciles with disk truth.
        if let Ok(bytes) = std::fs::read(options.cache_path.join(INDEX_HINT)) {
            if let Ok(entries) = serde_json::from_slice::<HashMap<String, CacheEntry>>(&bytes) {
                state.total_size = entries.values().map(|e| e.size).sum();
                state.entries = entries;
            }
        }
        Ok(Cache {
            dir: options.cache_path,
            max_size: options.max_size,
            use_etag: options.use_etag,
            policy: options.policy,
            refresh_interval: options.refresh_interval,
            backend,
            state: Mutex::new(state),
        })
    }

    /// Returns the cached body for `(profile, key)`, coordinating exactly one
    /// download through `store` when absent or stale. Cache faults are
    /// recovered by bypassing to the backend; backend faults propagate.
    pub async fn read(
        &self,
        profile: &str,
        key: &str,
        etag: Option<&str>,
        store: &Arc<dyn StorageProvider>,
    ) -> Result<Bytes> {
        let fp = fingerprint(profile, key);
        if let Err(err) = self.maybe_refresh().await {
            tracing::warn!(error = %err, "cache refresh failed");
        }
        let etag = if self.use_etag { etag } else { None };

        match self.read_or_populate(&fp, key, etag, store).await {
            Ok(bytes) => Ok(bytes),
            Err(err @ Error::Cache { .. }) => {
                tracing::warn!(key = %key, error = %err, "cache fault, bypassing");
                collect_stream(store.get(key, None).await?).await
            }
            Err(err) => Err(err),
        }
    }

    async fn read_or_populate(
        &self,
        fp: &str,
        key: &str,
        etag: Option<&str>,
        store: &Arc<dyn StorageProvider>,
    ) -> Result<Bytes> {
        if let Some(bytes) = self.try_cached(fp, etag).await? {
            return Ok(bytes);
        }

        // Exactly one process populates; everyone else queues on the lock and
        // finds the entry on re-check.
        let lock = acquire_lock(lock_path(&self.dir, fp)).await?;
        let result = self.populate_locked(fp, key, etag, store).await;
        drop(lock);

        let bytes = result?;
        self.enforce_bound().await;
        Ok(bytes)
    }

    async fn populate_locked(
        &self,
        fp: &str,
        key: &str,
        etag: Option<&str>,
        store: &Arc<dyn StorageProvider>,
    ) -> Result<Bytes> {
        if let Some(bytes) = self.try_cached(fp, etag).await? {
            return Ok(bytes);
        }

        // The authoritative read. Failures here are the backend's, never the
        // cache's, and propagate unchanged.
        let bytes = collect_stream(store.get(key, None).await?).await?;

        let entry = CacheEntry::new(bytes.len() as u64, etag.map(str::to_string));
        match &self.backend {
            None => {
                write_file_atomic(&self.dir, &body_path(&self.dir, fp), &bytes, true).await?;
            }
            Some(backend) => {
                let len = bytes.len() as u64;
                backend
                    .put(fp, bytes_stream(bytes.clone()), Some(len))
                    .await
                    .map_err(Error::cache)?;
            }
        }
        write_meta(&self.dir, fp, &entry).await?;

        let mut state = self.state.lock().expect("cache index poisoned");
        if let Some(old) = state.entries.insert(fp.to_string(), entry.clone()) {
            state.total_size -= old.size.min(state.total_size);
        }
        state.total_size += entry.size;
        Ok(bytes)
    }

    /// The fast path: serve the existing entry when present and ETag-valid.
    /// Local faults surface as misses; backing-store faults as cache errors.
    async fn try_cached(&self, fp: &str, etag: Option<&str>) -> Result<Option<Bytes>> {
        let meta = match tokio::fs::read(meta_path(&self.dir, fp)).await {
            Ok(bytes) => bytes,
            Err(_) => return Ok(None),
        };
        let mut entry: CacheEntry = match serde_json::from_slice(&meta) {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(fingerprint = %fp, error = %err, "dropping unreadable cache entry metadata");
                return Ok(None);
            }
        };
        if !entry.matches_etag(etag) {
            return Ok(None);
        }

        let bytes = match &self.backend {
            None => match tokio::fs::read(body_path(&self.dir, fp)).await {
                Ok(bytes) => Bytes::from(bytes),
                Err(_) => return Ok(None),
            },
            Some(backend) => match backend.get(fp, None).await {
                Ok(stream) => collect_stream(stream).await.map_err(Error::cache)?,
                Err(err) if err.is_not_found() => return Ok(None),
                Err(err) => return Err(Error::cache(err)),
            },
        };

        entry.touch();
        if write_meta(&self.dir, fp, &entry).await.is_err() {
            tracing::debug!(fingerprint = %fp, "access-time update lost");
        }
        let mut state = self.state.lock().expect("cache index poisoned");
        state.entries.insert(fp.to_string(), entry);
        Ok(Some(bytes))
    }

    /// Drops the cached copy of `(profile, key)`. Missing entries are not an
    /// error.
    pub async fn remove(&self, profile: &str, key: &str) -> Result<()> {
        let fp = fingerprint(profile, key);
        if let Some(backend) = &self.backend {
            match backend.delete(&fp).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(Error::cache(err)),
            }
        }
        let dir = self.dir.clone();
        let fp_owned = fp.clone();
        let remove_body = self.backend.is_none();
        tokio::task::spawn_blocking(move || {
            if remove_body {
                let _ = std::fs::remove_file(body_path(&dir, &fp_owned));
            }
            let _ = std::fs::remove_file(meta_path(&dir, &fp_owned));
            let _ = std::fs::remove_file(lock_path(&dir, &fp_owned));
        })
        .await
        .map_err(Error::cache)?;

        let mut state = self.state.lock().expect("cache index poisoned");
        if let Some(old) = state.entries.remove(&fp) {
            state.total_size -= old.size.min(state.total_size);
        }
        Ok(())
    }

    /// Whether `(profile, key)` currently has a cached entry.
    pub async fn contains(&self, profile: &str, key: &str) -> bool {
        let fp = fingerprint(profile, key);
        tokio::fs::metadata(meta_path(&self.dir, fp.as_str()))
            .await
            .is_ok()
    }

    /// Where the body of `(profile, key)` lives in disk mode.
    pub fn body_path(&self, profile: &str, key: &str) -> PathBuf {
        body_path(&self.dir, &fingerprint(profile, key))
    }

    /// Sum of cached body sizes per the in-memory index.
    pub fn total_size(&self) -> u64 {
        self.state.lock().expect("cache index poisoned").total_size
    }

    /// Rescans the directory, reconciling the in-memory index with on-disk
    /// truth, applying deferred evictions, and rewriting the `.index` hint.
    pub async fn refresh(&self) -> Result<()> {
        let dir = self.dir.clone();
        let meta_only = self.backend.is_some();
        let (entries, total) = tokio::task::spawn_blocking(move || scan_dir(&dir, meta_only))
            .await
            .map_err(Error::cache)?
            .map_err(Error::cache)?;

        {
            let mut state = self.state.lock().expect("cache index poisoned");
            state.entries = entries.clone();
            state.total_size = total;
            state.last_refresh = Some(Instant::now());
        }

        let hint = serde_json::to_vec(&entries).map_err(Error::cache)?;
        if let Err(err) =
            write_file_atomic(&self.dir, &self.dir.join(INDEX_HINT), &hint, false).await
        {
            tracing::debug!(error = %err, "index hint not rewritten");
        }
        self.enforce_bound().await;
        Ok(())
    }

    async fn maybe_refresh(&self) -> Result<()> {
        let due = {
            let mut state = self.state.lock().expect("cache index poisoned");
            let due = state
                .last_refresh
                .map_or(true, |at| at.elapsed() >= self.refresh_interval);
            if due {
                // Claim the pass so concurrent readers do not stampede.
                state.last_refresh = Some(Instant::now());
            }
            due
        };
        if due {
            self.refresh().await?;
        }
        Ok(())
    }

    /// Evicts per policy until the size bound holds. Entries whose lock is
    /// held by any process are skipped. No-op in backend mode.
    async fn enforce_bound(&self) {
        if self.backend.is_some() {
            return;
        }
        let (mut excess, order): (u64, Vec<(String, u64)>) = {
            let state = self.state.lock().expect("cache index poisoned");
            if state.total_size <= self.max_size {
                return;
            }
            let order = eviction::eviction_order(&state.entries, self.policy);
            let sized = order
                .into_iter()
                .filter_map(|fp| state.entries.get(&fp).map(|e| (fp, e.size)))
                .collect();
            (state.total_size - self.max_size, sized)
        };

        let dir = self.dir.clone();
        let evicted: Vec<(String, u64)> = tokio::task::spawn_blocking(move || {
            let mut evicted = Vec::new();
            for (fp, size) in order {
                if excess == 0 {
                    break;
                }
                if !evict_entry(&dir, &fp) {
                    continue;
                }
                excess = excess.saturating_sub(size);
                evicted.push((fp, size));
            }
            evicted
        })
        .await
        .unwrap_or_default();

        if !evicted.is_empty() {
            tracing::debug!(count = evicted.len(), "evicted cache entries");
        }
        let mut state = self.state.lock().expect("cache index poisoned");
        for (fp, _) in &evicted {
            if let Some(old) = state.entries.remove(fp) {
                state.total_size -= old.size.min(state.total_size);
            }
        }
    }
}

/// Removes one entry's files unless its lock is currently held. Returns
/// whether the entry was removed.
fn evict_entry(dir: &Path, fp: &str) -> bool {
    let lock = match OpenOptions::new()
        .write(true)
        .create(true)
        .open(lock_path(dir, fp))
    {
        Ok(file) => file,
        Err(_) => return false,
    };
    if lock.try_lock_exclusive().is_err() {
        // Population in flight somewhere; never evict under it.
        return false;
    }
    let _ = std::fs::remove_file(body_path(dir, fp));
    let _ = std::fs::remove_file(meta_path(dir, fp));
    let _ = lock.unlock();
    let _ = std::fs::remove_file(lock_path(dir, fp));
    true
}

/// Blocking acquisition of a per-entry lock file, off the async executor.
async fn acquire_lock(path: PathBuf) -> Result<std::fs::File> {
    tokio::task::spawn_blocking(move || -> std::io::Result<std::fs::File> {
        let file = OpenOptions::new().write(true).create(true).open(&path)?;
        file.lock_exclusive()?;
        Ok(file)
    })
    .await
    .map_err(Error::cache)?
    .map_err(Error::cache)
}

/// Publishes bytes atomically: same-directory temp file, optional fsync,
/// rename into place.
async fn write_file_atomic(dir: &Path, target: &Path, bytes: &[u8], sync: bool) -> Result<()> {
    let dir = dir.to_path_buf();
    let target = target.to_path_buf();
    let bytes = bytes.to_vec();
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        use std::io::Write;
        let mut temp = tempfile::NamedTempFile::new_in(&dir)?;
        temp.write_all(&bytes)?;
        if sync {
            temp.as_file().sync_all()?;
        }
        temp.persist(&target).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(Error::cache)?
    .map_err(Error::cache)
}

async fn write_meta(dir: &Path, fp: &str, entry: &CacheEntry) -> Result<()> {
    let bytes = serde_json::to_vec(entry).map_err(Error::cache)?;
    write_file_atomic(dir, &meta_path(dir, fp), &bytes, false).await
}

/// Reads on-disk truth: every `.meta` file, plus bodies whose metadata went
/// missing (reconstructed from file attributes).
fn scan_dir(dir: &Path, meta_only: bool) -> std::io::Result<(HashMap<String, CacheEntry>, u64)> {
    let mut entries: HashMap<String, CacheEntry> = HashMap::new();
    let mut bodies: Vec<(String, std::fs::Metadata)> = Vec::new();

    for dirent in std::fs::read_dir(dir)? {
        let dirent = dirent?;
        if !dirent.file_type()?.is_file() {
            continue;
        }
        let name = dirent.file_name().to_string_lossy().into_owned();
        if name == INDEX_HINT || name.starts_with(".tmp") || name.ends_with(".lock") {
            continue;
        }
        if let Some(fp) = name.strip_suffix(".meta") {
            if let Ok(bytes) = std::fs::read(dirent.path()) {
                if let Ok(entry) = serde_json::from_slice::<CacheEntry>(&bytes) {
                    entries.insert(fp.to_string(), entry);
                }
            }
        } else if !meta_only {
            if let Ok(meta) = dirent.metadata() {
                bodies.push((name, meta));
            }
        }
    }
    if !meta_only {
        for (fp, meta) in bodies {
            entries.entry(fp).or_insert_with(|| {
                let stamp = meta
                    .modified()
                    .ok()
                    .and_then(|m| m.duration_since(std::time::SystemTime::UNIX_EPOCH).ok())
                    .map(|d| d.as_nanos() as u64)
                    .unwrap_or(0);
                CacheEntry {
                    size: meta.len(),
                    inserted_at: stamp,
                    last_accessed: stamp,
                    etag: None,
                }
            });
        }
    }
    let total = entries.values().map(|e| e.size).sum();
    Ok((entries, total))
}
