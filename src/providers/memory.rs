use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use sha2::Digest;

use super::{collapse_to_directories, collect_stream, ByteStream, MetadataStream, StorageProvider};
use crate::config::ProviderSchema;
use crate::models::{ByteRange, ObjectMetadata};
use crate::{Error, Result};

/// In-memory provider: the smallest model of the storage contract and the
/// backend the test suite runs against. Sorted keys give ordered listings
/// and `start_after` for free.
#[derive(Debug, Default, Clone)]
pub struct MemoryStorageProvider {
    base_path: String,
    state: Arc<tokio::sync::RwLock<BTreeMap<String, StoredObject>>>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    metadata: ObjectMetadata,
}

impl MemoryStorageProvider {
    /// Creates an empty store.
    pub fn new() -> Self {
        MemoryStorageProvider::default()
    }

    pub(crate) fn from_options(schema: &ProviderSchema) -> Self {
        MemoryStorageProvider {
            base_path: schema.option_str("base_path").unwrap_or("").to_string(),
            state: Arc::default(),
        }
    }

    fn entry_for(key: &str, data: &Bytes) -> ObjectMetadata {
        ObjectMetadata::file(key, data.len() as u64, time::OffsetDateTime::now_utc())
            .with_etag(hex::encode(sha2::Sha256::digest(data)))
    }
}

#[async_trait]
impl StorageProvider for MemoryStorageProvider {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn base_path(&self) -> &str {
        &self.base_path
    }

    async fn put(&self, key: &str, body: ByteStream, size: Option<u64>) -> Result<()> {
        let data = collect_stream(body).await?;
        if let Some(size) = size {
            if data.len() as u64 != size {
                return Err(Error::invalid(format!(
                    "put {:?}: body is {} bytes, expected {}",
                    key,
                    data.len(),
                    size
                )));
            }
        }
        let metadata = Self::entry_for(key, &data);
        self.state
            .write()
            .await
            .insert(key.to_string(), StoredObject { data, metadata });
        Ok(())
    }

    async fn get(&self, key: &str, range: Option<ByteRange>) -> Result<ByteStream> {
        let state = self.state.read().await;
        let object = state
            .get(key)
            .ok_or_else(|| Error::not_found("get", key))?;
        let data = match range {
            Some(range) => {
                let (start, end) = range
                    .slice_indices(object.data.len() as u64)
                    .ok_or_else(|| {
                        Error::invalid(format!(
                            "get {:?}: range starts at {} but the object is {} bytes",
                            key,
                            range.start,
                            object.data.len()
                        ))
                    })?;
                object.data.slice(start..end)
            }
            None => object.data.clone(),
        };
        Ok(futures_util::stream::once(async move { Ok(data) }).boxed())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.state
            .write()
            .await
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("delete", key))
    }

    async fn head(&self, key: &str) -> Result<ObjectMetadata> {
        self.state
            .read()
            .await
            .get(key)
            .map(|object| object.metadata.clone())
            .ok_or_else(|| Error::not_found("head", key))
    }

    async fn copy(&self, src_key: &str, dst_key: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let source = state
            .get(src_key)
            .ok_or_else(|| Error::not_found("copy", src_key))?
            .clone();
        let metadata = ObjectMetadata {
            key: dst_key.to_string(),
            last_modified: time::OffsetDateTime::now_utc(),
            ..source.metadata
        };
        state.insert(
            dst_key.to_string(),
            StoredObject {
                data: source.data,
                metadata,
            },
        );
        Ok(())
    }

    async fn list(
        &self,
        prefix: &str,
        recursive: bool,
        start_after: Option<String>,
    ) -> Result<MetadataStream> {
        let state = self.state.read().await;
        let mut entries: Vec<ObjectMetadata> = state
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter(|(key, _)| match &start_after {
                Some(after) => key.as_str() > after.as_str(),
                None => true,
            })
            .map(|(_, object)| object.metadata.clone())
            .collect();
        if !recursive {
            entries = collapse_to_directories(entries, prefix);
        }
        Ok(futures_util::stream::iter(entries.into_iter().map(Ok)).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::bytes_stream;
    use futures_util::TryStreamExt;

    #[tokio::test]
    async fn round_trip_and_etag_tracks_body() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryStorageProvider::new();
        store.put("k", bytes_stream("one".into()), None).await?;
        let first = store.head("k").await?.etag;
        store.put("k", bytes_stream("two".into()), None).await?;
        let second = store.head("k").await?.etag;
        assert_ne!(first, second);

        let body = collect_stream(store.get("k", None).await?).await?;
        assert_eq!(&body[..], b"two");
        Ok(())
    }

    #[tokio::test]
    async fn listing_respects_prefix_and_start_after() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryStorageProvider::new();
        for key in ["a/1", "a/2", "a/b/3", "z"] {
            store.put(key, bytes_stream("v".into()), None).await?;
        }
        let keys: Vec<String> = store
            .list("a/", true, Some("a/1".to_string()))
            .await?
            .map_ok(|m| m.key)
            .try_collect()
            .await?;
        assert_eq!(keys, ["a/2", "a/b/3"]);
        Ok(())
    }

    #[tokio::test]
    async fn ranged_get_slices() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryStorageProvider::new();
        store.put("k", bytes_stream("0123456789".into()), None).await?;
        let body =
            collect_stream(store.get("k", Some(ByteRange::new(8, 20)?)).await?).await?;
        assert_eq!(&body[..], b"89");
        Ok(())
    }
}
