//! The manifest metadata provider: listings and metadata served from a
//! pre-generated catalog instead of backend list calls.
//!
//! A manifest lives under `{manifest_path}/{timestamp}/` on a storage
//! provider; the lexicographically greatest timestamp is the current
//! generation. Generations are immutable; mutation is staged in memory and
//! persisted by committing a new generation.

mod format;

pub use self::format::{ManifestIndex, PartEntry, PartRef};
pub(crate) use self::format::{generation_timestamp, part_path, INDEX_FILENAME, INDEX_VERSION, PART_LINES};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};

use crate::config::ProviderSchema;
use crate::models::ObjectMetadata;
use crate::providers::{
    bytes_stream, collapse_to_directories, join_key, ByteStream, MetadataContext,
    MetadataProvider, StorageProvider,
};
use crate::{Error, Result};

/// How many parts are fetched concurrently while loading a generation.
const PART_FETCH_CONCURRENCY: usize = 8;

/// Default manifest directory, relative to the storage provider's base path.
const DEFAULT_MANIFEST_PATH: &str = ".msc_manifests";

#[derive(Debug, Default)]
struct State {
    generation: Option<String>,
    entries: HashMap<String, ObjectMetadata>,
    pending_adds: HashMap<String, ObjectMetadata>,
    pending_removes: HashSet<String>,
}

/// Serves `list`/`info` from an in-memory mirror of the current manifest
/// generation, merged with pending local mutations.
#[derive(Debug)]
pub struct ManifestMetadataProvider {
    store: Arc<dyn StorageProvider>,
    manifest_root: String,
    loaded: tokio::sync::OnceCell<()>,
    state: tokio::sync::RwLock<State>,
}

impl ManifestMetadataProvider {
    /// Creates a provider reading manifests under `manifest_root` on `store`.
    /// Nothing is fetched until the first lookup.
    pub fn new(store: Arc<dyn StorageProvider>, manifest_root: impl Into<String>) -> Self {
        ManifestMetadataProvider {
            store,
            manifest_root: manifest_root.into().trim_matches('/').to_string(),
            loaded: tokio::sync::OnceCell::new(),
            state: tokio::sync::RwLock::new(State::default()),
        }
    }

    pub(crate) fn from_options(schema: &ProviderSchema, ctx: &MetadataContext<'_>) -> Result<Self> {
        let manifest_path = schema
            .option_str("manifest_path")
            .unwrap_or(DEFAULT_MANIFEST_PATH);
        let store = match schema.option_str("storage_provider_profile") {
            Some(sibling) => (ctx.resolve_storage)(sibling)?,
            None => ctx.storage.clone(),
        };
        Ok(ManifestMetadataProvider::new(store, manifest_path))
    }

    async fn ensure_loaded(&self) -> Result<()> {
        self.loaded
            .get_or_try_init(|| async {
                let loaded = self.load().await?;
                // Mutations staged before the first load survive it.
                let mut state = self.state.write().await;
                state.generation = loaded.generation;
                state.entries = loaded.entries;
                Ok(())
            })
            .await
            .map(|_| ())
    }

    /// Reads the current generation: index first, then every referenced part,
    /// fetched concurrently and parsed line by line.
    async fn load(&self) -> Result<State> {
        let Some(generation) = self.current_generation().await? else {
            tracing::debug!(root = %self.manifest_root, "no manifest generation found, starting empty");
            return Ok(State::default());
        };
        let generation_root = join_key(&self.manifest_root, &generation);

        let index_key = join_key(&generation_root, INDEX_FILENAME);
        let index_bytes = match self.store.get(&index_key, None).await {
            Ok(stream) => crate::providers::collect_stream(stream).await?,
            Err(err) if err.is_not_found() => {
                return Err(Error::manifest_corrupt(format!(
                    "generation {:?} has no {}",
                    generation, INDEX_FILENAME
                )))
            }
            Err(err) => return Err(err),
        };
        let index: ManifestIndex = serde_json::from_slice(&index_bytes)
            .map_err(|e| Error::manifest_corrupt(format!("index {:?}: {}", index_key, e)))?;
        if index.version != INDEX_VERSION {
            return Err(Error::manifest_corrupt(format!(
                "unsupported manifest version {:?}",
                index.version
            )));
        }

        let part_keys: Vec<String> = index
            .parts
            .iter()
            .map(|part| join_key(&generation_root, &part.path))
            .collect();

        let mut part_futures: Vec<
            std::pin::Pin<Box<dyn std::future::Future<Output = Result<Vec<ObjectMetadata>>> + Send + '_>>,
        > = Vec::with_capacity(part_keys.len());
        for part_key in &part_keys {
            part_futures.push(Box::pin(self.load_part(part_key)));
        }

        let parts: Vec<Vec<ObjectMetadata>> = futures_util::stream::iter(part_futures)
            .buffer_unordered(PART_FETCH_CONCURRENCY)
            .try_collect()
            .await?;

        let mut entries = HashMap::new();
        for part in parts {
            for metadata in part {
                entries.insert(metadata.key.clone(), metadata);
            }
        }
        tracing::debug!(
            generation = %generation,
            objects = entries.len(),
            "loaded manifest generation"
        );
        Ok(State {
            generation: Some(generation),
            entries,
            pending_adds: HashMap::new(),
            pending_removes: HashSet::new(),
        })
    }

    /// The lexicographically greatest timestamped subdirectory, if any.
    async fn current_generation(&self) -> Result<Option<String>> {
        let prefix = format!("{}/", self.manifest_root);
        let mut listing = self.store.list(&prefix, false, None).await?;
        let mut greatest: Option<String> = None;
        while let Some(entry) = listing.next().await {
            let entry = entry?;
            if !entry.is_directory() {
                continue;
            }
            let name = entry
                .key
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .unwrap_or("")
                .to_string();
            if name.is_empty() {
                continue;
            }
            if greatest.as_deref().map_or(true, |g| name.as_str() > g) {
                greatest = Some(name);
            }
        }
        Ok(greatest)
    }

    /// Streams one part file, parsing each line as it arrives so a large
    /// part never has to sit in memory twice.
    async fn load_part(&self, part_key: &str) -> Result<Vec<ObjectMetadata>> {
        let mut stream: ByteStream = match self.store.get(part_key, None).await {
            Ok(stream) => stream,
            Err(err) if err.is_not_found() => {
                return Err(Error::manifest_corrupt(format!(
                    "index references missing part {:?}",
                    part_key
                )))
            }
            Err(err) => return Err(err),
        };

        let mut entries = Vec::new();
        let mut pending: Vec<u8> = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            pending.extend_from_slice(&chunk);
            while let Some(newline) = pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = pending.drain(..=newline).collect();
                parse_part_line(&line[..line.len() - 1], part_key, &mut entries)?;
            }
        }
        parse_part_line(&pending, part_key, &mut entries)?;
        Ok(entries)
    }
}

fn parse_part_line(line: &[u8], part_key: &str, entries: &mut Vec<ObjectMetadata>) -> Result<()> {
    let line = std::str::from_utf8(line)
        .map_err(|e| Error::manifest_corrupt(format!("part {:?}: {}", part_key, e)))?
        .trim();
    if line.is_empty() {
        return Ok(());
    }
    let entry: PartEntry = serde_json::from_str(line)
        .map_err(|e| Error::manifest_corrupt(format!("part {:?}: {}", part_key, e)))?;
    entries.push(entry.into());
    Ok(())
}

#[async_trait]
impl MetadataProvider for ManifestMetadataProvider {
    async fn list(&self, prefix: &str, recursive: bool) -> Result<Vec<ObjectMetadata>> {
        self.ensure_loaded().await?;
        let state = self.state.read().await;
        let mut merged: BTreeMap<&str, &ObjectMetadata> = BTreeMap::new();
        for (key, metadata) in &state.entries {
            if key.starts_with(prefix) && !state.pending_removes.contains(key) {
                merged.insert(key, metadata);
            }
        }
        for (key, metadata) in &state.pending_adds {
            if key.starts_with(prefix) {
                merged.insert(key, metadata);
            }
        }
        let entries: Vec<ObjectMetadata> = merged.into_values().cloned().collect();
        Ok(if recursive {
            entries
        } else {
            collapse_to_directories(entries, prefix)
        })
    }

    async fn head(&self, key: &str) -> Result<ObjectMetadata> {
        self.ensure_loaded().await?;
        let state = self.state.read().await;
        if let Some(metadata) = state.pending_adds.get(key) {
            return Ok(metadata.clone());
        }
        if state.pending_removes.contains(key) {
            return Err(Error::not_found("head", key));
        }
        state
            .entries
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found("head", key))
    }

    async fn add_pending(&self, key: &str, metadata: ObjectMetadata) {
        let mut state = self.state.write().await;
        state.pending_removes.remove(key);
        state.pending_adds.insert(key.to_string(), metadata);
    }

    async fn remove_pending(&self, key: &str) {
        let mut state = self.state.write().await;
        state.pending_adds.remove(key);
        state.pending_removes.insert(key.to_string());
    }

    async fn commit(&self) -> Result<String> {
        self.ensure_loaded().await?;
        let mut state = self.state.write().await;

        let mut merged: BTreeMap<String, ObjectMetadata> = BTreeMap::new();
        for (key, metadata) in &state.entries {
            if !state.pending_removes.contains(key) {
                merged.insert(key.clone(), metadata.clone());
            }
        }
        for (key, metadata) in &state.pending_adds {
            merged.insert(key.clone(), metadata.clone());
        }

        let generation = generation_timestamp(state.generation.as_deref())?;
        let generation_root = join_key(&self.manifest_root, &generation);

        // Parts first, index last: a reader never observes an index whose
        // parts are not yet in place.
        let entries: Vec<&ObjectMetadata> = merged.values().collect();
        let mut parts = Vec::new();
        for (seq, chunk) in entries.chunks(PART_LINES).enumerate() {
            let path = part_path(seq);
            let mut body = String::new();
            for metadata in chunk {
                body.push_str(&serde_json::to_string(&PartEntry::from(*metadata))?);
                body.push('\n');
            }
            let size = body.len() as u64;
            self.store
                .put(
                    &join_key(&generation_root, &path),
                    bytes_stream(Bytes::from(body)),
                    Some(size),
                )
                .await?;
            parts.push(PartRef { path });
        }

        let index = ManifestIndex {
            version: INDEX_VERSION.to_string(),
            parts,
        };
        let index_body = Bytes::from(serde_json::to_vec(&index)?);
        let size = index_body.len() as u64;
        self.store
            .put(
                &join_key(&generation_root, INDEX_FILENAME),
                bytes_stream(index_body),
                Some(size),
            )
            .await?;

        tracing::debug!(generation = %generation, objects = merged.len(), "committed manifest generation");
        state.entries = merged.into_iter().collect();
        state.pending_adds.clear();
        state.pending_removes.clear();
        state.generation = Some(generation.clone());
        Ok(generation)
    }

    fn realpath(&self, key: &str) -> String {
        // Entries carry no separate physical location; the logical key is the
        // physical path.
        key.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MemoryStorageProvider;

    async fn seed_generation(
        store: &MemoryStorageProvider,
        root: &str,
        timestamp: &str,
        lines: &[&str],
    ) -> Result<(), Box<dyn std::error::Error>> {
        let part = format!("{}/{}/parts/msc_manifest_part000000.jsonl", root, timestamp);
        let body = lines.join("\n");
        store.put(&part, bytes_stream(body.into()), None).await?;
        let index =
            r#"{"version":"1.0","parts":[{"path":"parts/msc_manifest_part000000.jsonl"}]}"#
                .to_string();
        store
            .put(
                &format!("{}/{}/msc_manifest_index.json", root, timestamp),
                bytes_stream(index.into()),
                None,
            )
            .await?;
        Ok(())
    }

    fn provider(store: &MemoryStorageProvider) -> ManifestMetadataProvider {
        ManifestMetadataProvider::new(Arc::new(store.clone()), ".msc_manifests")
    }

    #[tokio::test]
    async fn listings_come_from_the_catalog() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryStorageProvider::new();
        seed_generation(
            &store,
            ".msc_manifests",
            "2024-01-01T00:00:00.000000000Z",
            &[
                r#"{"key":"x/1","size_bytes":3,"last_modified":"2024-01-01T00:00:00Z"}"#,
                r#"{"key":"x/2","size_bytes":5,"last_modified":"2024-01-01T00:00:00Z"}"#,
                r#"{"key":"y/3","size_bytes":7,"last_modified":"2024-01-01T00:00:00Z"}"#,
            ],
        )
        .await?;

        let manifest = provider(&store);
        let listed = manifest.list("x/", true).await?;
        let keys: Vec<&str> = listed.iter().map(|m| m.key.as_str()).collect();
        assert_eq!(keys, ["x/1", "x/2"]);
        assert_eq!(listed[0].content_length, 3);
        assert_eq!(listed[1].content_length, 5);

        assert_eq!(manifest.head("y/3").await?.content_length, 7);
        assert!(manifest.head("y/missing").await.unwrap_err().is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn greatest_generation_wins() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryStorageProvider::new();
        seed_generation(
            &store,
            ".msc_manifests",
            "2024-01-01T00:00:00.000000000Z",
            &[r#"{"key":"old","size_bytes":1,"last_modified":"2024-01-01T00:00:00Z"}"#],
        )
        .await?;
        seed_generation(
            &store,
            ".msc_manifests",
            "2024-06-01T00:00:00.000000000Z",
            &[r#"{"key":"new","size_bytes":2,"last_modified":"2024-06-01T00:00:00Z"}"#],
        )
        .await?;

        let manifest = provider(&store);
        let keys: Vec<String> = manifest
            .list("", true)
            .await?
            .into_iter()
            .map(|m| m.key)
            .collect();
        assert_eq!(keys, ["new"]);
        Ok(())
    }

    #[tokio::test]
    async fn missing_part_is_corrupt() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryStorageProvider::new();
        store
            .put(
                ".msc_manifests/2024-01-01T00:00:00.000000000Z/msc_manifest_index.json",
                bytes_stream(
                    r#"{"version":"1.0","parts":[{"path":"parts/msc_manifest_part000000.jsonl"}]}"#
                        .into(),
                ),
                None,
            )
            .await?;
        let manifest = provider(&store);
        let err = manifest.list("", true).await.unwrap_err();
        assert!(matches!(err, Error::ManifestCorrupt { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn empty_root_is_an_empty_provider() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryStorageProvider::new();
        let manifest = provider(&store);
        assert!(manifest.list("", true).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn pending_mutations_merge_and_commit() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryStorageProvider::new();
        seed_generation(
            &store,
            ".msc_manifests",
            "2024-01-01T00:00:00.000000000Z",
            &[
                r#"{"key":"keep","size_bytes":1,"last_modified":"2024-01-01T00:00:00Z"}"#,
                r#"{"key":"drop","size_bytes":1,"last_modified":"2024-01-01T00:00:00Z"}"#,
            ],
        )
        .await?;

        let manifest = provider(&store);
        manifest
            .add_pending(
                "added",
                ObjectMetadata::file("added", 9, time::OffsetDateTime::UNIX_EPOCH),
            )
            .await;
        manifest.remove_pending("drop").await;

        // Pending mutations are visible locally before any commit.
        let keys: Vec<String> = manifest
            .list("", true)
            .await?
            .into_iter()
            .map(|m| m.key)
            .collect();
        assert_eq!(keys, ["added", "keep"]);

        // But a second client only observes them after commit.
        let before = provider(&store);
        let keys: Vec<String> = before
            .list("", true)
            .await?
            .into_iter()
            .map(|m| m.key)
            .collect();
        assert_eq!(keys, ["drop", "keep"]);

        let generation = manifest.commit().await?;
        assert!(generation.as_str() > "2024-01-01T00:00:00.000000000Z");

        let after = provider(&store);
        let keys: Vec<String> = after
            .list("", true)
            .await?
            .into_iter()
            .map(|m| m.key)
            .collect();
        assert_eq!(keys, ["added", "keep"]);
        Ok(())
    }

    #[tokio::test]
    async fn commits_are_monotonic() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryStorageProvider::new();
        let manifest = provider(&store);
        manifest
            .add_pending(
                "a",
                ObjectMetadata::file("a", 1, time::OffsetDateTime::UNIX_EPOCH),
            )
            .await;
        let first = manifest.commit().await?;
        manifest
            .add_pending(
                "b",
                ObjectMetadata::file("b", 1, time::OffsetDateTime::UNIX_EPOCH),
            )
            .await;
        let second = manifest.commit().await?;
        assert!(second > first);
        Ok(())
    }

    #[tokio::test]
    async fn removed_then_readded_keys_survive() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryStorageProvider::new();
        let manifest = provider(&store);
        manifest.remove_pending("k").await;
        manifest
            .add_pending(
                "k",
                ObjectMetadata::file("k", 2, time::OffsetDateTime::UNIX_EPOCH),
            )
            .await;
        assert_eq!(manifest.head("k").await?.content_length, 2);
        Ok(())
    }
}
