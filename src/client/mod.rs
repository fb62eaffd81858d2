//! The unified operation surface: one client per profile, multiplexing over
//! the profile's storage provider, optional metadata provider, and the
//! process-wide cache, with telemetry observing every call.

mod file_handle;
mod sync;

pub use self::file_handle::{ObjectFile, OpenMode};
pub use self::sync::SyncReport;

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;

use crate::cache::Cache;
use crate::config::Config;
use crate::models::{ByteRange, ObjectMetadata};
use crate::providers::{
    bytes_stream, collect_stream, resolve_profile, MetadataProvider, StorageProvider,
};
use crate::telemetry::Recorder;
use crate::{Error, Result};

/// Full-object reads at least this large are routed through the cache.
pub const DEFAULT_READ_THRESHOLD: u64 = 16 << 20;

/// The primary entrypoint to perform operations against one profile.
///
/// Cloning is cheap: clones share the same providers and cache.
#[derive(Clone)]
pub struct StorageClient {
    profile: String,
    storage: Arc<dyn StorageProvider>,
    metadata: Option<Arc<dyn MetadataProvider>>,
    cache: Option<Arc<Cache>>,
    telemetry: Option<Arc<Recorder>>,
    read_threshold: u64,
}

impl std::fmt::Debug for StorageClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageClient")
            .field("profile", &self.profile)
            .field("storage", &self.storage.name())
            .field("metadata", &self.metadata.is_some())
            .field("cache", &self.cache.is_some())
            .finish()
    }
}

impl StorageClient {
    /// A client over just a storage provider. Use [`StorageClient::builder`]
    /// to attach a metadata provider, cache, or telemetry.
    pub fn new(profile: impl Into<String>, storage: Arc<dyn StorageProvider>) -> Self {
        StorageClient {
            profile: profile.into(),
            storage,
            metadata: None,
            cache: None,
            telemetry: None,
            read_threshold: DEFAULT_READ_THRESHOLD,
        }
    }

    /// Creates a new [StorageClientBuilder].
    pub fn builder(profile: impl Into<String>) -> StorageClientBuilder {
        StorageClientBuilder {
            profile: profile.into(),
            storage: None,
            metadata: None,
            cache: None,
            telemetry: None,
            read_threshold: DEFAULT_READ_THRESHOLD,
        }
    }

    /// Realizes the client for a configured profile, attaching the shared
    /// cache and telemetry.
    pub fn from_config(
        config: &Config,
        profile: &str,
        cache: Option<Arc<Cache>>,
        telemetry: Option<Arc<Recorder>>,
    ) -> Result<Self> {
        let providers = resolve_profile(config, profile)?;
        Ok(StorageClient {
            profile: profile.to_string(),
            storage: providers.storage,
            metadata: providers.metadata,
            cache,
            telemetry,
            read_threshold: DEFAULT_READ_THRESHOLD,
        })
    }

    /// The profile this client serves.
    pub fn profile(&self) -> &str {
        &self.profile
    }

    /// The storage provider behind this client.
    pub fn storage_provider(&self) -> &Arc<dyn StorageProvider> {
        &self.storage
    }

    /// The metadata provider, when the profile configures one.
    pub fn metadata_provider(&self) -> Option<&Arc<dyn MetadataProvider>> {
        self.metadata.as_ref()
    }

    /// Reads an object body, or a byte range of it. Ranged and small
    /// one-shot reads bypass the cache; large or repeated full reads are
    /// served through it.
    pub async fn read(&self, key: &str, range: Option<ByteRange>) -> Result<Bytes> {
        let op = self.start("read");
        let result = self.read_inner(key, range).await;
        self.finish(op, &result, result.as_ref().ok().map(|b| b.len() as u64));
        result.map_err(|e| e.with_profile(&self.profile))
    }

    async fn read_inner(&self, key: &str, range: Option<ByteRange>) -> Result<Bytes> {
        if range.is_none() {
            if let Some(cache) = &self.cache {
                let meta = self.info_inner(key).await?;
                if meta.content_length >= self.read_threshold
                    || cache.contains(&self.profile, key).await
                {
                    return cache
                        .read(&self.profile, key, meta.etag.as_deref(), &self.storage)
                        .await;
                }
            }
        }
        collect_stream(self.storage.get(key, range).await?).await
    }

    /// Writes an object body. A profile with a manifest stages the new entry
    /// for its next commit; a stale cached copy is dropped.
    pub async fn write(&self, key: &str, body: impl Into<Bytes>) -> Result<()> {
        let body = body.into();
        let size = body.len() as u64;
        let op = self.start("write");
        let result = self.write_inner(key, body).await;
        self.finish(op, &result, Some(size));
        result.map_err(|e| e.with_profile(&self.profile))
    }

    async fn write_inner(&self, key: &str, body: Bytes) -> Result<()> {
        let size = body.len() as u64;
        self.storage
            .put(key, bytes_stream(body), Some(size))
            .await?;
        if let Some(cache) = &self.cache {
            cache.remove(&self.profile, key).await?;
        }
        if let Some(metadata) = &self.metadata {
            // Prefer the backend's own view (it carries the fresh ETag).
            let staged = match self.storage.head(key).await {
                Ok(meta) => meta,
                Err(_) => ObjectMetadata::file(key, size, time::OffsetDateTime::now_utc()),
            };
            metadata.add_pending(key, staged).await;
        }
        Ok(())
    }

    /// Opens an object for reading or writing.
    pub async fn open(&self, key: &str, mode: OpenMode) -> Result<ObjectFile> {
        match mode {
            OpenMode::Read => {
                let body = self.read(key, None).await?;
                Ok(ObjectFile::for_reading(self.clone(), key.to_string(), body))
            }
            OpenMode::Write => Ok(ObjectFile::for_writing(self.clone(), key.to_string())),
        }
    }

    /// Lists entries under `prefix`, consulting the metadata provider when
    /// the profile has one. Directory placeholders are withheld unless
    /// `include_directories` is set.
    pub async fn list(
        &self,
        prefix: &str,
        recursive: bool,
        include_directories: bool,
    ) -> Result<Vec<ObjectMetadata>> {
        let op = self.start("list");
        let result = self.list_inner(prefix, recursive, include_directories).await;
        self.finish(op, &result, None);
        result.map_err(|e| e.with_profile(&self.profile))
    }

    async fn list_inner(
        &self,
        prefix: &str,
        recursive: bool,
        include_directories: bool,
    ) -> Result<Vec<ObjectMetadata>> {
        let mut entries = match &self.metadata {
            Some(metadata) => metadata.list(prefix, recursive).await?,
            None => {
                use futures_util::TryStreamExt;
                self.storage
                    .list(prefix, recursive, None)
                    .await?
                    .try_collect()
                    .await?
            }
        };
        if !include_directories {
            entries.retain(|m| !m.is_directory());
        }
        Ok(entries)
    }

    /// Expands a shell-style pattern (`*`, `?`, character classes, `**`
    /// across separators) into matching keys, in key order.
    pub async fn glob(&self, pattern: &str) -> Result<Vec<String>> {
        let op = self.start("glob");
        let result = self.glob_inner(pattern).await;
        self.finish(op, &result, None);
        result.map_err(|e| e.with_profile(&self.profile))
    }

    async fn glob_inner(&self, pattern: &str) -> Result<Vec<String>> {
        let compiled = glob::Pattern::new(pattern)
            .map_err(|e| Error::invalid(format!("glob pattern {:?}: {}", pattern, e)))?;
        let options = glob::MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };
        let prefix: String = pattern
            .chars()
            .take_while(|c| !matches!(c, '*' | '?' | '['))
            .collect();
        let mut keys: Vec<String> = self
            .list_inner(&prefix, true, false)
            .await?
            .into_iter()
            .filter(|m| compiled.matches_with(&m.key, options))
            .map(|m| m.key)
            .collect();
        keys.sort();
        Ok(keys)
    }

    /// Deletes an object and its cached copy. Deleting an absent key
    /// succeeds; a profile with a manifest stages the removal.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let op = self.start("delete");
        let result = self.delete_inner(key).await;
        self.finish(op, &result, None);
        result.map_err(|e| e.with_profile(&self.profile))
    }

    async fn delete_inner(&self, key: &str) -> Result<()> {
        match self.storage.delete(key).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
        if let Some(cache) = &self.cache {
            cache.remove(&self.profile, key).await?;
        }
        if let Some(metadata) = &self.metadata {
            metadata.remove_pending(key).await;
        }
        Ok(())
    }

    /// Server-side copy within the profile's namespace.
    pub async fn copy(&self, src_key: &str, dst_key: &str) -> Result<()> {
        let op = self.start("copy");
        let result = self.copy_inner(src_key, dst_key).await;
        self.finish(op, &result, None);
        result.map_err(|e| e.with_profile(&self.profile))
    }

    async fn copy_inner(&self, src_key: &str, dst_key: &str) -> Result<()> {
        self.storage.copy(src_key, dst_key).await?;
        if let Some(cache) = &self.cache {
            cache.remove(&self.profile, dst_key).await?;
        }
        if let Some(metadata) = &self.metadata {
            if let Ok(meta) = self.storage.head(dst_key).await {
                metadata.add_pending(dst_key, meta).await;
            }
        }
        Ok(())
    }

    /// Metadata for one key, from the metadata provider when present, else
    /// from the storage provider. Missing keys fail with `NotFound`.
    pub async fn info(&self, key: &str) -> Result<ObjectMetadata> {
        let op = self.start("info");
        let result = self.info_inner(key).await;
        self.finish(op, &result, None);
        result.map_err(|e| e.with_profile(&self.profile))
    }

    /// Non-strict metadata lookup: a missing key yields the zero-length file
    /// sentinel instead of failing.
    pub async fn info_or_default(&self, key: &str) -> Result<ObjectMetadata> {
        match self.info(key).await {
            Ok(meta) => Ok(meta),
            Err(err) if err.is_not_found() => Ok(ObjectMetadata::sentinel(key)),
            Err(err) => Err(err),
        }
    }

    async fn info_inner(&self, key: &str) -> Result<ObjectMetadata> {
        match &self.metadata {
            Some(metadata) => metadata.head(key).await,
            None => self.storage.head(key).await,
        }
    }

    /// Persists pending manifest mutations, returning the new generation id,
    /// or `None` when the profile has no metadata provider.
    pub async fn commit_metadata(&self) -> Result<Option<String>> {
        match &self.metadata {
            Some(metadata) => {
                let generation = metadata
                    .commit()
                    .await
                    .map_err(|e| e.with_profile(&self.profile))?;
                Ok(Some(generation))
            }
            None => Ok(None),
        }
    }

    /// Copies every object under `source_path` on `source` to the
    /// corresponding key under `target_path` on this client. With
    /// `delete_unmatched_files`, objects under `target_path` that have no
    /// source counterpart are deleted once the copy phase succeeds.
    pub async fn sync_from(
        &self,
        source: &StorageClient,
        source_path: &str,
        target_path: &str,
        delete_unmatched_files: bool,
    ) -> Result<SyncReport> {
        let op = self.start("sync");
        let result =
            sync::sync_from(self, source, source_path, target_path, delete_unmatched_files).await;
        self.finish(op, &result, None);
        result.map_err(|e| e.with_profile(&self.profile))
    }

    fn start(&self, operation: &'static str) -> (Instant, &'static str) {
        if let Some(telemetry) = &self.telemetry {
            telemetry.operation_started(self.storage.name(), operation);
        }
        (Instant::now(), operation)
    }

    fn finish<T>(
        &self,
        op: (Instant, &'static str),
        result: &Result<T>,
        bytes: Option<u64>,
    ) {
        let (started, operation) = op;
        if let Some(telemetry) = &self.telemetry {
            let status = match result {
                Ok(_) => "success",
                Err(err) => err.status_label(),
            };
            telemetry.operation_finished(
                self.storage.name(),
                operation,
                status,
                started.elapsed().as_secs_f64(),
                bytes.filter(|_| result.is_ok()),
            );
        }
    }
}

/// A StorageClientBuilder assembles a client with custom providers, cache,
/// and telemetry.
pub struct StorageClientBuilder {
    profile: String,
    storage: Option<Arc<dyn StorageProvider>>,
    metadata: Option<Arc<dyn MetadataProvider>>,
    cache: Option<Arc<Cache>>,
    telemetry: Option<Arc<Recorder>>,
    read_threshold: u64,
}

impl StorageClientBuilder {
    /// Sets the storage provider. Required.
    pub fn storage(mut self, storage: Arc<dyn StorageProvider>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Sets the metadata provider.
    pub fn metadata(mut self, metadata: Arc<dyn MetadataProvider>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Attaches a cache.
    pub fn cache(mut self, cache: Arc<Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Attaches a telemetry recorder.
    pub fn telemetry(mut self, telemetry: Arc<Recorder>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Overrides the cache routing threshold for full-object reads.
    pub fn read_threshold(mut self, read_threshold: u64) -> Self {
        self.read_threshold = read_threshold;
        self
    }

    /// Returns a `StorageClient` using this builder's configuration.
    pub fn build(self) -> Result<StorageClient> {
        let storage = self
            .storage
            .ok_or_else(|| Error::invalid("StorageClientBuilder requires a storage provider"))?;
        Ok(StorageClient {
            profile: self.profile,
            storage,
            metadata: self.metadata,
            cache: self.cache,
            telemetry: self.telemetry,
            read_threshold: self.read_threshold,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheOptions;
    use crate::providers::{FileStorageProvider, MemoryStorageProvider};
    use std::io::{Read, Seek, SeekFrom, Write};

    fn memory_client() -> StorageClient {
        StorageClient::new("test", Arc::new(MemoryStorageProvider::new()))
    }

    #[tokio::test]
    async fn posix_round_trip() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let storage = FileStorageProvider::new(dir.path().to_string_lossy().to_string())?;
        let client = StorageClient::new("default", Arc::new(storage));

        client.write("a/b.txt", "hello").await?;
        assert_eq!(&client.read("a/b.txt", None).await?[..], b"hello");
        assert_eq!(client.info("a/b.txt").await?.content_length, 5);
        Ok(())
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_read_fails_after() -> Result<(), Box<dyn std::error::Error>>
    {
        let client = memory_client();
        client.write("k", "v").await?;
        client.delete("k").await?;
        client.delete("k").await?;
        assert!(client.read("k", None).await.unwrap_err().is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn ranged_reads_are_half_open() -> Result<(), Box<dyn std::error::Error>> {
        let client = memory_client();
        client.write("k", "0123456789").await?;
        let body = client.read("k", Some(ByteRange::new(3, 7)?)).await?;
        assert_eq!(&body[..], b"3456");
        Ok(())
    }

    #[tokio::test]
    async fn glob_semantics() -> Result<(), Box<dyn std::error::Error>> {
        let client = memory_client();
        for key in ["a/b/c.tar", "a/d.tar", "a/b/e.txt"] {
            client.write(key, "x").await?;
        }

        assert_eq!(client.glob("**/*.tar").await?, ["a/b/c.tar", "a/d.tar"]);
        // `*` does not cross separators.
        assert_eq!(client.glob("a/*.tar").await?, ["a/d.tar"]);
        // Character classes match one character.
        assert_eq!(client.glob("a/[d].tar").await?, ["a/d.tar"]);
        assert_eq!(client.glob("a/[xyz].tar").await?, Vec::<String>::new());
        Ok(())
    }

    #[tokio::test]
    async fn info_or_default_returns_sentinel() -> Result<(), Box<dyn std::error::Error>> {
        let client = memory_client();
        assert!(client.info("missing").await.unwrap_err().is_not_found());
        let sentinel = client.info_or_default("missing").await?;
        assert_eq!(sentinel.content_length, 0);
        assert!(!sentinel.is_directory());
        Ok(())
    }

    #[tokio::test]
    async fn open_write_then_read_back() -> Result<(), Box<dyn std::error::Error>> {
        let client = memory_client();

        let mut handle = client.open("out.bin", OpenMode::Write).await?;
        handle.write_all(b"head-")?;
        handle.write_all(b"tail")?;
        handle.seek(SeekFrom::Start(0))?;
        handle.write_all(b"HEAD-")?;
        handle.close().await?;

        let mut handle = client.open("out.bin", OpenMode::Read).await?;
        let mut body = String::new();
        handle.read_to_string(&mut body)?;
        assert_eq!(body, "HEAD-tail");

        handle.seek(SeekFrom::Start(5))?;
        let mut tail = [0u8; 4];
        handle.read_exact(&mut tail)?;
        assert_eq!(&tail, b"tail");
        handle.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn write_invalidates_cached_body() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let cache = Arc::new(
            crate::cache::Cache::new(CacheOptions {
                cache_path: dir.path().to_path_buf(),
                ..CacheOptions::default()
            })
            .unwrap(),
        );
        let client = StorageClient::builder("test")
            .storage(Arc::new(MemoryStorageProvider::new()))
            .cache(cache.clone())
            .read_threshold(0)
            .build()?;

        client.write("k", "one").await?;
        assert_eq!(&client.read("k", None).await?[..], b"one");
        client.write("k", "two").await?;
        assert_eq!(&client.read("k", None).await?[..], b"two");

        client.delete("k").await?;
        assert!(!cache.contains("test", "k").await);
        Ok(())
    }

    #[tokio::test]
    async fn manifest_profile_lists_through_catalog() -> Result<(), Box<dyn std::error::Error>> {
        let storage = Arc::new(MemoryStorageProvider::new());
        let manifest = Arc::new(crate::manifest::ManifestMetadataProvider::new(
            storage.clone(),
            ".msc_manifests",
        ));
        let client = StorageClient::builder("cat")
            .storage(storage.clone())
            .metadata(manifest)
            .build()?;

        client.write("x/1", "abc").await?;
        client.write("x/2", "abcde").await?;
        let generation = client.commit_metadata().await?.unwrap();
        assert!(!generation.is_empty());

        // Listing equivalence: the manifest mirrors the backend listing.
        let from_manifest: Vec<String> = client
            .list("x/", true, false)
            .await?
            .into_iter()
            .map(|m| m.key)
            .collect();
        use futures_util::TryStreamExt;
        let from_backend: Vec<String> = storage
            .list("x/", true, None)
            .await?
            .map_ok(|m| m.key)
            .try_collect()
            .await?;
        assert_eq!(from_manifest, from_backend);

        assert_eq!(client.info("x/2").await?.content_length, 5);
        Ok(())
    }
}
