//! Blocking facade over the async client, for callers without a tokio
//! runtime of their own. Each facade owns a current-thread runtime and
//! drives the async client to completion on the caller's thread.

use std::sync::Arc;

use bytes::Bytes;

use crate::client::{StorageClient, SyncReport};
use crate::models::{ByteRange, ObjectMetadata};
use crate::Result;

/// The primary blocking entrypoint to perform operations against one
/// profile.
#[derive(Debug)]
pub struct Client {
    runtime: tokio::runtime::Runtime,
    inner: Arc<StorageClient>,
}

impl Client {
    /// Wraps an async client.
    pub fn new(inner: Arc<StorageClient>) -> Result<Self> {
        Ok(Client {
            runtime: crate::runtime()?,
            inner,
        })
    }

    /// The blocking client for a configured profile.
    ///
    /// ### Features
    /// This function requires that the feature flag `global-client` is
    /// enabled in `Cargo.toml`.
    #[cfg(feature = "global-client")]
    pub fn from_profile(profile: &str) -> Result<Self> {
        Client::new(crate::global_client::storage_client(profile)?)
    }

    /// The async client underneath.
    pub fn storage_client(&self) -> &Arc<StorageClient> {
        &self.inner
    }

    /// The synchronous equivalent of [`StorageClient::read`].
    pub fn read(&self, key: &str, range: Option<ByteRange>) -> Result<Bytes> {
        self.runtime.block_on(self.inner.read(key, range))
    }

    /// The synchronous equivalent of [`StorageClient::write`].
    pub fn write(&self, key: &str, body: impl Into<Bytes>) -> Result<()> {
        self.runtime.block_on(self.inner.write(key, body))
    }

    /// The synchronous equivalent of [`StorageClient::delete`].
    pub fn delete(&self, key: &str) -> Result<()> {
        self.runtime.block_on(self.inner.delete(key))
    }

    /// The synchronous equivalent of [`StorageClient::copy`].
    pub fn copy(&self, src_key: &str, dst_key: &str) -> Result<()> {
        self.runtime.block_on(self.inner.copy(src_key, dst_key))
    }

    /// The synchronous equivalent of [`StorageClient::list`].
    pub fn list(
        &self,
        prefix: &str,
        recursive: bool,
        include_directories: bool,
    ) -> Result<Vec<ObjectMetadata>> {
        self.runtime
            .block_on(self.inner.list(prefix, recursive, include_directories))
    }

    /// The synchronous equivalent of [`StorageClient::glob`].
    pub fn glob(&self, pattern: &str) -> Result<Vec<String>> {
        self.runtime.block_on(self.inner.glob(pattern))
    }

    /// The synchronous equivalent of [`StorageClient::info`].
    pub fn info(&self, key: &str) -> Result<ObjectMetadata> {
        self.runtime.block_on(self.inner.info(key))
    }

    /// The synchronous equivalent of [`StorageClient::info_or_default`].
    pub fn info_or_default(&self, key: &str) -> Result<ObjectMetadata> {
        self.runtime.block_on(self.inner.info_or_default(key))
    }

    /// The synchronous equivalent of [`StorageClient::commit_metadata`].
    pub fn commit_metadata(&self) -> Result<Option<String>> {
        self.runtime.block_on(self.inner.commit_metadata())
    }

    /// The synchronous equivalent of [`StorageClient::sync_from`].
    pub fn sync_from(
        &self,
        source: &StorageClient,
        source_path: &str,
        target_path: &str,
        delete_unmatched_files: bool,
    ) -> Result<SyncReport> {
        self.runtime.block_on(self.inner.sync_from(
            source,
            source_path,
            target_path,
            delete_unmatched_files,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MemoryStorageProvider;

    #[test]
    fn blocking_round_trip() -> Result<(), Box<dyn std::error::Error>> {
        let inner = Arc::new(StorageClient::new(
            "mem",
            Arc::new(MemoryStorageProvider::new()),
        ));
        let client = Client::new(inner)?;

        client.write("a/b", "hello")?;
        assert_eq!(&client.read("a/b", None)?[..], b"hello");
        assert_eq!(client.info("a/b")?.content_length, 5);
        assert_eq!(client.glob("a/*")?, ["a/b"]);
        client.delete("a/b")?;
        assert!(client.read("a/b", None).unwrap_err().is_not_found());
        Ok(())
    }
}
