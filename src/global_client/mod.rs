//! The process-wide client registry and the URL shortcut surface: resolve
//! any supported URL to a `StorageClient`, constructing clients lazily and
//! retaining them until process exit.

mod registry;

pub use self::registry::ClientRegistry;

use once_cell::sync::Lazy;

use crate::client::{ObjectFile, OpenMode, StorageClient};
use crate::models::ObjectMetadata;
use crate::Result;

pub(crate) static CLIENT_REGISTRY: Lazy<ClientRegistry> = Lazy::new(ClientRegistry::discover);

/// Resolves a URL (`msc://`, a mapped source prefix, a foreign bucket URL,
/// or a POSIX path) to its client and client-relative key.
pub fn resolve(url: &str) -> Result<(std::sync::Arc<StorageClient>, String)> {
    CLIENT_REGISTRY.resolve(url)
}

/// The lazily constructed client for a configured profile.
pub fn storage_client(profile: &str) -> Result<std::sync::Arc<StorageClient>> {
    CLIENT_REGISTRY.client(profile)
}

/// Reads a whole object by URL.
pub async fn read(url: &str) -> Result<bytes::Bytes> {
    let (client, key) = resolve(url)?;
    client.read(&key, None).await
}

/// Writes a whole object by URL.
pub async fn write(url: &str, body: impl Into<bytes::Bytes>) -> Result<()> {
    let (client, key) = resolve(url)?;
    client.write(&key, body).await
}

/// Deletes an object by URL.
pub async fn delete(url: &str) -> Result<()> {
    let (client, key) = resolve(url)?;
    client.delete(&key).await
}

/// Lists objects under a URL prefix.
pub async fn list(url: &str) -> Result<Vec<ObjectMetadata>> {
    let (client, prefix) = resolve(url)?;
    client.list(&prefix, true, false).await
}

/// Expands a URL glob pattern into matching URLs.
pub async fn glob(pattern: &str) -> Result<Vec<String>> {
    let (client, key_pattern) = resolve(pattern)?;
    let keys = client.glob(&key_pattern).await?;
    Ok(keys
        .into_iter()
        .map(|key| format!("msc://{}/{}", client.profile(), key))
        .collect())
}

/// Metadata for one URL.
pub async fn info(url: &str) -> Result<ObjectMetadata> {
    let (client, key) = resolve(url)?;
    client.info(&key).await
}

/// Opens an object by URL.
pub async fn open(url: &str, mode: OpenMode) -> Result<ObjectFile> {
    let (client, key) = resolve(url)?;
    client.open(&key, mode).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn posix_paths_round_trip_through_the_implicit_profile(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("note.txt");
        let url = path.to_string_lossy().to_string();

        write(&url, "hello").await?;
        assert_eq!(&read(&url).await?[..], b"hello");
        assert_eq!(info(&url).await?.content_length, 5);

        let (client, key) = resolve(&url)?;
        assert_eq!(client.profile(), "_file");
        assert_eq!(format!("/{}", key), url);

        delete(&url).await?;
        assert!(read(&url).await.unwrap_err().is_not_found());
        Ok(())
    }
}
