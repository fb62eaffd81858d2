use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::{collapse_to_directories, join_key, ByteStream, MetadataStream, StorageProvider};
use crate::config::ProviderSchema;
use crate::models::{ByteRange, ObjectMetadata};
use crate::{Error, Result};

/// POSIX file system provider. Keys map to paths under `base_path`; writes
/// publish atomically through a same-directory temporary file and rename.
#[derive(Debug)]
pub struct FileStorageProvider {
    base_path: String,
}

impl FileStorageProvider {
    /// Creates a provider rooted at `base_path`.
    pub fn new(base_path: impl Into<String>) -> Result<Self> {
        let base_path = base_path.into();
        if base_path.is_empty() {
            return Err(Error::invalid("file provider requires a base_path"));
        }
        Ok(FileStorageProvider { base_path })
    }

    pub(crate) fn from_options(schema: &ProviderSchema) -> Result<Self> {
        FileStorageProvider::new(schema.option_str("base_path").unwrap_or("/"))
    }

    fn full_path(&self, key: &str) -> PathBuf {
        PathBuf::from(join_key(&self.base_path, key))
    }

    async fn metadata_for(&self, key: &str, path: &Path) -> Result<ObjectMetadata> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| Error::from_io(e, "head", key))?;
        if meta.is_dir() {
            return Ok(ObjectMetadata::directory(key));
        }
        let modified = meta
            .modified()
            .map_err(|e| Error::from_io(e, "head", key))?;
        let last_modified = time::OffsetDateTime::from(modified);
        Ok(
            ObjectMetadata::file(key, meta.len(), last_modified)
                .with_etag(file_etag(meta.len(), last_modified)),
        )
    }
}

// Weak validator derived from length and mtime, the usual shape for static
// file serving.
fn file_etag(len: u64, modified: time::OffsetDateTime) -> String {
    format!("{:x}-{:x}", len, modified.unix_timestamp_nanos())
}

#[async_trait]
impl StorageProvider for FileStorageProvider {
    fn name(&self) -> &'static str {
        "file"
    }

    fn base_path(&self) -> &str {
        &self.base_path
    }

    async fn put(&self, key: &str, mut body: ByteStream, size: Option<u64>) -> Result<()> {
        let path = self.full_path(key);
        let parent = path
            .parent()
            .ok_or_else(|| Error::invalid(format!("key {:?} has no parent directory", key)))?
            .to_path_buf();
        tokio::fs::create_dir_all(&parent)
            .await
            .map_err(|e| Error::from_io(e, "put", key))?;

        let temp = {
            let parent = parent.clone();
            tokio::task::spawn_blocking(move || tempfile::NamedTempFile::new_in(parent))
                .await
                .map_err(|e| Error::Other(e.to_string()))?
                .map_err(|e| Error::from_io(e, "put", key))?
        };
        let temp_path = temp.into_temp_path();

        let mut file = tokio::fs::File::create(&temp_path)
            .await
            .map_err(|e| Error::from_io(e, "put", key))?;
        let mut written: u64 = 0;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            written += chunk.len() as u64;
            file.write_all(&chunk)
                .await
                .map_err(|e| Error::from_io(e, "put", key))?;
        }
        if let Some(size) = size {
            if written != size {
                return Err(Error::invalid(format!(
                    "put {:?}: body is {} bytes, expected {}",
                    key, written, size
                )));
            }
        }
        file.sync_all()
            .await
            .map_err(|e| Error::from_io(e, "put", key))?;
        drop(file);

        let published = temp_path
            .keep()
            .map_err(|e| Error::Other(e.to_string()))?;
        tokio::fs::rename(&published, &path)
            .await
            .map_err(|e| Error::from_io(e, "put", key))?;
        Ok(())
    }

    async fn get(&self, key: &str, range: Option<ByteRange>) -> Result<ByteStream> {
        let path = self.full_path(key);
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| Error::from_io(e, "get", key))?;
        let meta = file
            .metadata()
            .await
            .map_err(|e| Error::from_io(e, "get", key))?;
        if meta.is_dir() {
            return Err(Error::not_found("get", key));
        }

        let reader: Box<dyn tokio::io::AsyncRead + Send + Unpin> = match range {
            Some(range) => {
                if range.start >= meta.len() {
                    return Err(Error::invalid(format!(
                        "get {:?}: range starts at {} but the object is {} bytes",
                        key,
                        range.start,
                        meta.len()
                    )));
                }
                file.seek(std::io::SeekFrom::Start(range.start))
                    .await
                    .map_err(|e| Error::from_io(e, "get", key))?;
                Box::new(file.take(range.len()))
            }
            None => Box::new(file),
        };
        let key = key.to_string();
        let stream = tokio_util::io::ReaderStream::new(reader)
            .map(move |chunk| chunk.map_err(|e| Error::from_io(e, "get", &key)));
        Ok(stream.boxed())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        tokio::fs::remove_file(self.full_path(key))
            .await
            .map_err(|e| Error::from_io(e, "delete", key))
    }

    async fn head(&self, key: &str) -> Result<ObjectMetadata> {
        self.metadata_for(key, &self.full_path(key)).await
    }

    async fn copy(&self, src_key: &str, dst_key: &str) -> Result<()> {
        let dst = self.full_path(dst_key);
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::from_io(e, "copy", dst_key))?;
        }
        tokio::fs::copy(self.full_path(src_key), dst)
            .await
            .map_err(|e| Error::from_io(e, "copy", src_key))?;
        Ok(())
    }

    async fn list(
        &self,
        prefix: &str,
        recursive: bool,
        start_after: Option<String>,
    ) -> Result<MetadataStream> {
        // Walk from the deepest directory the prefix names so partial
        // filename prefixes still match.
        let walk_root = match prefix.rfind('/') {
            Some(idx) => self.full_path(&prefix[..idx]),
            None => PathBuf::from(&self.base_path),
        };
        let base = self.base_path.clone();
        let prefix = prefix.to_string();
        let prefix_for_walk = prefix.clone();

        let mut entries: Vec<(String, std::fs::Metadata)> = tokio::task::spawn_blocking(move || {
            let prefix = prefix_for_walk;
            let mut found = Vec::new();
            if !walk_root.is_dir() {
                return found;
            }
            for entry in walkdir::WalkDir::new(&walk_root)
                .follow_links(false)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                if !entry.file_type().is_file() {
                    continue;
                }
                // Skip in-flight put temporaries.
                if entry.file_name().to_string_lossy().starts_with(".tmp") {
                    continue;
                }
                let relative = match entry.path().strip_prefix(Path::new(&base)) {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                let key = relative.to_string_lossy().replace('\\', "/");
                if !key.starts_with(&prefix) {
                    continue;
                }
                if let Ok(meta) = entry.metadata() {
                    found.push((key, meta));
                }
            }
            found.sort_by(|a, b| a.0.cmp(&b.0));
            found
        })
        .await
        .map_err(|e| Error::Other(e.to_string()))?;

        if let Some(start_after) = &start_after {
            entries.retain(|(key, _)| key.as_str() > start_after.as_str());
        }

        let mut objects: Vec<ObjectMetadata> = Vec::with_capacity(entries.len());
        for (key, meta) in entries {
            let modified = meta
                .modified()
                .map(time::OffsetDateTime::from)
                .unwrap_or(time::OffsetDateTime::UNIX_EPOCH);
            objects.push(
                ObjectMetadata::file(key, meta.len(), modified)
                    .with_etag(file_etag(meta.len(), modified)),
            );
        }
        if !recursive {
            objects = collapse_to_directories(objects, &prefix);
        }
        Ok(futures_util::stream::iter(objects.into_iter().map(Ok)).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{bytes_stream, collect_stream};
    use futures_util::TryStreamExt;

    fn provider(dir: &tempfile::TempDir) -> FileStorageProvider {
        FileStorageProvider::new(dir.path().to_string_lossy().to_string()).unwrap()
    }

    #[tokio::test]
    async fn put_get_round_trip() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let store = provider(&dir);
        store
            .put("a/b.txt", bytes_stream("hello".into()), Some(5))
            .await?;
        let body = collect_stream(store.get("a/b.txt", None).await?).await?;
        assert_eq!(&body[..], b"hello");

        let meta = store.head("a/b.txt").await?;
        assert_eq!(meta.content_length, 5);
        assert!(meta.etag.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn put_rejects_size_mismatch() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let store = provider(&dir);
        let err = store
            .put("k", bytes_stream("abc".into()), Some(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn ranged_get_is_half_open() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let store = provider(&dir);
        store
            .put("k", bytes_stream("0123456789".into()), None)
            .await?;
        let body =
            collect_stream(store.get("k", Some(ByteRange::new(2, 5)?)).await?).await?;
        assert_eq!(&body[..], b"234");
        Ok(())
    }

    #[tokio::test]
    async fn missing_keys_surface_not_found() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let store = provider(&dir);
        assert!(store
            .get("missing", None)
            .await
            .err()
            .map_or(false, |e| e.is_not_found()));
        assert!(store.head("missing").await.unwrap_err().is_not_found());
        assert!(store.delete("missing").await.unwrap_err().is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn listing_recursive_and_delimited() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let store = provider(&dir);
        for key in ["x/1", "x/2", "x/sub/3", "y/4"] {
            store.put(key, bytes_stream("v".into()), None).await?;
        }

        let all: Vec<ObjectMetadata> =
            store.list("x/", true, None).await?.try_collect().await?;
        let keys: Vec<&str> = all.iter().map(|m| m.key.as_str()).collect();
        assert_eq!(keys, ["x/1", "x/2", "x/sub/3"]);

        let shallow: Vec<ObjectMetadata> =
            store.list("x/", false, None).await?.try_collect().await?;
        let keys: Vec<&str> = shallow.iter().map(|m| m.key.as_str()).collect();
        assert_eq!(keys, ["x/1", "x/2", "x/sub/"]);

        let after: Vec<ObjectMetadata> = store
            .list("x/", true, Some("x/1".to_string()))
            .await?
            .try_collect()
            .await?;
        let keys: Vec<&str> = after.iter().map(|m| m.key.as_str()).collect();
        assert_eq!(keys, ["x/2", "x/sub/3"]);
        Ok(())
    }

    #[tokio::test]
    async fn copy_duplicates_bytes() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let store = provider(&dir);
        store.put("src", bytes_stream("data".into()), None).await?;
        store.copy("src", "deep/dst").await?;
        let body = collect_stream(store.get("deep/dst", None).await?).await?;
        assert_eq!(&body[..], b"data");
        Ok(())
    }
}
