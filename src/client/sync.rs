//! The bulk sync engine behind [`StorageClient::sync_from`]: a concurrent
//! copier with optional delete-unmatched semantics.

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::StreamExt;

use super::StorageClient;
use crate::models::ObjectMetadata;
use crate::providers::join_key;
use crate::{Error, Result};

/// Sizes the worker pool, kept for parity with multi-process deployments:
/// the engine runs `MSC_NUM_PROCESSES × MSC_NUM_THREADS_PER_PROCESS`
/// concurrent transfers.
pub const NUM_PROCESSES_ENV: &str = "MSC_NUM_PROCESSES";

/// See [`NUM_PROCESSES_ENV`].
pub const NUM_THREADS_ENV: &str = "MSC_NUM_THREADS_PER_PROCESS";

/// Outcome of one sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncReport {
    /// Objects copied to the target.
    pub copied: usize,
    /// Unmatched target objects deleted.
    pub deleted: usize,
}

fn worker_count() -> usize {
    let processes = std::env::var(NUM_PROCESSES_ENV)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(1);
    let threads = std::env::var(NUM_THREADS_ENV)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or_else(num_cpus::get);
    (processes * threads).max(1)
}

pub(super) async fn sync_from(
    target: &StorageClient,
    source: &StorageClient,
    source_path: &str,
    target_path: &str,
    delete_unmatched: bool,
) -> Result<SyncReport> {
    let workers = worker_count();
    let source_entries = source
        .list(source_path, true, false)
        .await
        .map_err(|e| e.with_profile(source.profile()))?;

    // Deletions are planned up front but never precede copies.
    let to_delete: Vec<String> = if delete_unmatched {
        let matched: HashSet<String> = source_entries
            .iter()
            .map(|m| relative_key(&m.key, source_path))
            .collect();
        target
            .list(target_path, true, false)
            .await?
            .into_iter()
            .map(|m| m.key)
            .filter(|key| !matched.contains(&relative_key(key, target_path)))
            .collect()
    } else {
        Vec::new()
    };

    let copied = source_entries.len();
    let failures: Vec<Error> = futures_util::stream::iter(source_entries.into_iter().map(|meta| {
        let source_key = meta.key.clone();
        let target_key = join_key(target_path, &relative_key(&meta.key, source_path));
        async move {
            copy_one(target, source, &meta, &source_key, &target_key)
                .await
                .err()
        }
    }))
    .buffer_unordered(workers)
    .filter_map(|failure| async move { failure })
    .collect()
    .await;

    if !failures.is_empty() {
        for failure in &failures {
            tracing::error!(error = %failure, "sync transfer failed");
        }
        return Err(Error::unavailable(
            "sync",
            source_path,
            format!("{} of {} transfers failed", failures.len(), copied),
        ));
    }

    let mut deleted = 0;
    for key in to_delete {
        target.delete(&key).await?;
        deleted += 1;
    }

    tracing::debug!(copied, deleted, "sync completed");
    Ok(SyncReport { copied, deleted })
}

/// One transfer: server-side copy when source and target share a storage
/// namespace, a buffered pipe otherwise.
async fn copy_one(
    target: &StorageClient,
    source: &StorageClient,
    meta: &ObjectMetadata,
    source_key: &str,
    target_key: &str,
) -> Result<()> {
    let same_namespace = Arc::ptr_eq(source.storage_provider(), target.storage_provider());
    if same_namespace {
        target
            .storage_provider()
            .copy(source_key, target_key)
            .await?;
    } else {
        let body = source.storage_provider().get(source_key, None).await?;
        target
            .storage_provider()
            .put(target_key, body, Some(meta.content_length))
            .await?;
    }

    if let Some(cache) = &target.cache {
        cache.remove(target.profile(), target_key).await?;
    }
    if let Some(metadata) = target.metadata_provider() {
        let staged = ObjectMetadata {
            key: target_key.to_string(),
            etag: None,
            ..meta.clone()
        };
        metadata.add_pending(target_key, staged).await;
    }
    Ok(())
}

fn relative_key(key: &str, prefix: &str) -> String {
    key.strip_prefix(prefix)
        .unwrap_or(key)
        .trim_start_matches('/')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{collect_stream, MemoryStorageProvider, StorageProvider};

    fn client(name: &str) -> StorageClient {
        StorageClient::new(name, Arc::new(MemoryStorageProvider::new()))
    }

    #[tokio::test]
    async fn sync_with_deletion_mirrors_the_source() -> Result<(), Box<dyn std::error::Error>> {
        let source = client("src");
        let target = client("dst");
        source.write("p/x", "source-x").await?;
        source.write("p/y", "source-y").await?;
        target.write("p/x_old", "stale").await?;
        target.write("p/y", "old-y").await?;
        target.write("p/z", "stale").await?;

        let report = target.sync_from(&source, "p/", "p/", true).await?;
        assert_eq!(report.copied, 2);
        assert_eq!(report.deleted, 2);

        let keys: Vec<String> = target
            .list("p/", true, false)
            .await?
            .into_iter()
            .map(|m| m.key)
            .collect();
        assert_eq!(keys, ["p/x", "p/y"]);
        assert_eq!(&target.read("p/x", None).await?[..], b"source-x");
        assert_eq!(&target.read("p/y", None).await?[..], b"source-y");
        Ok(())
    }

    #[tokio::test]
    async fn sync_without_deletion_keeps_extra_objects() -> Result<(), Box<dyn std::error::Error>>
    {
        let source = client("src");
        let target = client("dst");
        source.write("data/a", "a").await?;
        target.write("data/extra", "keep me").await?;

        let report = target.sync_from(&source, "data/", "data/", false).await?;
        assert_eq!(report.copied, 1);
        assert_eq!(report.deleted, 0);
        assert_eq!(&target.read("data/extra", None).await?[..], b"keep me");
        Ok(())
    }

    #[tokio::test]
    async fn sync_across_prefixes_rewrites_keys() -> Result<(), Box<dyn std::error::Error>> {
        let source = client("src");
        let target = client("dst");
        source.write("in/deep/file", "v").await?;

        target.sync_from(&source, "in/", "out/mirror/", false).await?;
        assert_eq!(&target.read("out/mirror/deep/file", None).await?[..], b"v");
        Ok(())
    }

    #[tokio::test]
    async fn same_namespace_uses_server_side_copy() -> Result<(), Box<dyn std::error::Error>> {
        let storage: Arc<dyn StorageProvider> = Arc::new(MemoryStorageProvider::new());
        let source = StorageClient::new("p", storage.clone());
        let target = StorageClient::new("p", storage.clone());
        source.write("a/k", "v").await?;

        target.sync_from(&source, "a/", "b/", false).await?;
        let body = collect_stream(storage.get("b/k", None).await?).await?;
        assert_eq!(&body[..], b"v");
        Ok(())
    }
}
