//! Provider contracts and the process-wide registry resolving `type` strings
//! from the configuration to provider factories.
//!
//! Three capabilities exist: storage (body I/O), metadata (accelerated
//! listings), and credentials. Vendor SDK bindings register their factories
//! here under their `type` name; the crate ships `file`, `memory` and `ais`
//! storage providers, the `manifest` metadata provider, and `static`/`env`
//! credentials providers.

mod aistore;
mod credentials;
mod file;
mod memory;

pub use self::aistore::AisStorageProvider;
pub use self::credentials::{Credentials, CredentialsProvider, EnvCredentials, StaticCredentials};
pub use self::file::FileStorageProvider;
pub use self::memory::MemoryStorageProvider;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use once_cell::sync::Lazy;

use crate::config::{Config, ProviderSchema};
use crate::models::{ByteRange, ObjectMetadata};
use crate::{Error, Result};

/// A stream of body chunks.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// A stream of listing entries.
pub type MetadataStream = BoxStream<'static, Result<ObjectMetadata>>;

/// Wraps an in-memory body as a one-chunk stream.
pub fn bytes_stream(bytes: Bytes) -> ByteStream {
    futures_util::stream::once(async move { Ok(bytes) }).boxed()
}

/// Drains a body stream into contiguous bytes.
pub async fn collect_stream(mut stream: ByteStream) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

/// Adapter implementing body I/O for one backend. Keys are relative to the
/// provider's `base_path` and use forward slashes regardless of host OS.
#[async_trait]
pub trait StorageProvider: Send + Sync + std::fmt::Debug {
    /// Short backend name used as the telemetry `provider` tag.
    fn name(&self) -> &'static str;

    /// The path every key is resolved under.
    fn base_path(&self) -> &str;

    /// Stores a body. When `size` is given the provider verifies the stream
    /// length against it.
    async fn put(&self, key: &str, body: ByteStream, size: Option<u64>) -> Result<()>;

    /// Retrieves a body, or a byte range of it.
    async fn get(&self, key: &str, range: Option<ByteRange>) -> Result<ByteStream>;

    /// Removes an object. Missing keys surface `NotFound`; idempotence is a
    /// client-level concern.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Metadata for one key.
    async fn head(&self, key: &str) -> Result<ObjectMetadata>;

    /// Server-side copy within this provider's namespace.
    async fn copy(&self, src_key: &str, dst_key: &str) -> Result<()>;

    /// Lists keys under `prefix`. Non-recursive listings collapse deeper
    /// levels into directory entries. Entries are yielded in key order where
    /// the backend supports it.
    async fn list(
        &self,
        prefix: &str,
        recursive: bool,
        start_after: Option<String>,
    ) -> Result<MetadataStream>;
}

/// Listing/metadata accelerator consulted before the storage provider.
#[async_trait]
pub trait MetadataProvider: Send + Sync + std::fmt::Debug {
    /// Lists entries under `prefix`, merged with pending local mutations.
    async fn list(&self, prefix: &str, recursive: bool) -> Result<Vec<ObjectMetadata>>;

    /// Metadata for one key.
    async fn head(&self, key: &str) -> Result<ObjectMetadata>;

    /// Stages an addition (or replacement), visible to this process's
    /// listings immediately and persisted by the next [`commit`].
    ///
    /// [`commit`]: MetadataProvider::commit
    async fn add_pending(&self, key: &str, metadata: ObjectMetadata);

    /// Stages a removal.
    async fn remove_pending(&self, key: &str);

    /// Persists pending mutations as a new generation and returns its id.
    async fn commit(&self) -> Result<String>;

    /// Maps a logical key to the physical path bodies are stored under.
    fn realpath(&self, key: &str) -> String;
}

/// Everything a profile resolves to.
#[derive(Clone)]
pub struct ResolvedProviders {
    /// Body I/O.
    pub storage: Arc<dyn StorageProvider>,
    /// Optional listing accelerator.
    pub metadata: Option<Arc<dyn MetadataProvider>>,
    /// Optional credentials source.
    pub credentials: Option<Arc<dyn CredentialsProvider>>,
}

/// Context handed to metadata provider factories: the profile's own storage
/// provider plus a resolver for sibling profiles' storage.
pub struct MetadataContext<'a> {
    /// The enclosing profile's storage provider.
    pub storage: &'a Arc<dyn StorageProvider>,
    /// Resolves another profile's storage provider by name.
    pub resolve_storage: &'a (dyn Fn(&str) -> Result<Arc<dyn StorageProvider>> + Sync),
}

/// Factory for storage providers.
pub type StorageFactory = Arc<
    dyn Fn(&ProviderSchema, Option<Arc<dyn CredentialsProvider>>) -> Result<Arc<dyn StorageProvider>>
        + Send
        + Sync,
>;

/// Factory for metadata providers.
pub type MetadataFactory = Arc<
    dyn Fn(&ProviderSchema, &MetadataContext<'_>) -> Result<Arc<dyn MetadataProvider>>
        + Send
        + Sync,
>;

/// Factory for credentials providers.
pub type CredentialsFactory =
    Arc<dyn Fn(&ProviderSchema) -> Result<Arc<dyn CredentialsProvider>> + Send + Sync>;

/// Factory supplying storage, metadata, and credentials together.
pub type BundleFactory = Arc<dyn Fn(&ProviderSchema) -> Result<ResolvedProviders> + Send + Sync>;

#[derive(Default)]
struct ProviderRegistry {
    storage: Mutex<HashMap<String, StorageFactory>>,
    metadata: Mutex<HashMap<String, MetadataFactory>>,
    credentials: Mutex<HashMap<String, CredentialsFactory>>,
    bundles: Mutex<HashMap<String, BundleFactory>>,
}

static REGISTRY: Lazy<ProviderRegistry> = Lazy::new(|| {
    let registry = ProviderRegistry::default();
    {
        let mut storage = registry.storage.lock().unwrap();
        storage.insert(
            "file".to_string(),
            Arc::new(|schema, _| {
                Ok(Arc::new(FileStorageProvider::from_options(schema)?) as Arc<dyn StorageProvider>)
            }),
        );
        storage.insert(
            "memory".to_string(),
            Arc::new(|schema, _| {
                Ok(Arc::new(MemoryStorageProvider::from_options(schema)) as Arc<dyn StorageProvider>)
            }),
        );
        storage.insert(
            "ais".to_string(),
            Arc::new(|schema, credentials| {
                Ok(Arc::new(AisStorageProvider::from_options(schema, credentials)?)
                    as Arc<dyn StorageProvider>)
            }),
        );
    }
    {
        let mut metadata = registry.metadata.lock().unwrap();
        metadata.insert(
            "manifest".to_string(),
            Arc::new(|schema, ctx| {
                Ok(Arc::new(crate::manifest::ManifestMetadataProvider::from_options(schema, ctx)?)
                    as Arc<dyn MetadataProvider>)
            }),
        );
    }
    {
        let mut credentials = registry.credentials.lock().unwrap();
        credentials.insert(
            "static".to_string(),
            Arc::new(|schema| {
                Ok(Arc::new(StaticCredentials::from_options(schema)) as Arc<dyn CredentialsProvider>)
            }),
        );
        credentials.insert(
            "env".to_string(),
            Arc::new(|schema| {
                Ok(Arc::new(EnvCredentials::from_options(schema)) as Arc<dyn CredentialsProvider>)
            }),
        );
    }
    registry
});

/// Registers (or replaces) a storage provider factory under a `type` name.
/// Host applications use this to plug vendor backends (`s3`, `gcs`, `azure`,
/// `oci`) or qualified names of their own.
pub fn register_storage_provider(name: impl Into<String>, factory: StorageFactory) {
    REGISTRY.storage.lock().unwrap().insert(name.into(), factory);
}

/// Registers a metadata provider factory.
pub fn register_metadata_provider(name: impl Into<String>, factory: MetadataFactory) {
    REGISTRY.metadata.lock().unwrap().insert(name.into(), factory);
}

/// Registers a credentials provider factory.
pub fn register_credentials_provider(name: impl Into<String>, factory: CredentialsFactory) {
    REGISTRY
        .credentials
        .lock()
        .unwrap()
        .insert(name.into(), factory);
}

/// Registers a provider bundle factory. A profile whose `provider_bundle`
/// names it receives all three providers from the bundle; individual
/// provider fields are superseded.
pub fn register_provider_bundle(name: impl Into<String>, factory: BundleFactory) {
    REGISTRY.bundles.lock().unwrap().insert(name.into(), factory);
}

fn make_storage(
    schema: &ProviderSchema,
    credentials: Option<Arc<dyn CredentialsProvider>>,
) -> Result<Arc<dyn StorageProvider>> {
    let factory = REGISTRY
        .storage
        .lock()
        .unwrap()
        .get(&schema.provider_type)
        .cloned()
        .ok_or_else(|| {
            Error::invalid(format!(
                "storage provider type {:?} is not registered; call register_storage_provider",
                schema.provider_type
            ))
        })?;
    factory(schema, credentials)
}

fn make_credentials(schema: &ProviderSchema) -> Result<Arc<dyn CredentialsProvider>> {
    let factory = REGISTRY
        .credentials
        .lock()
        .unwrap()
        .get(&schema.provider_type)
        .cloned()
        .ok_or_else(|| {
            Error::invalid(format!(
                "credentials provider type {:?} is not registered",
                schema.provider_type
            ))
        })?;
    factory(schema)
}

/// Resolves every provider a profile binds. Storage for sibling profiles
/// (manifests rooted under another profile) resolves through the same path,
/// without the sibling's metadata provider.
pub(crate) fn resolve_profile(config: &Config, profile: &str) -> Result<ResolvedProviders> {
    let schema = config.profile(profile)?;

    if let Some(bundle) = &schema.provider_bundle {
        let factory = REGISTRY
            .bundles
            .lock()
            .unwrap()
            .get(&bundle.provider_type)
            .cloned()
            .ok_or_else(|| {
                Error::invalid(format!(
                    "provider bundle {:?} is not registered",
                    bundle.provider_type
                ))
            })?;
        return factory(bundle);
    }

    let credentials = schema
        .credentials_provider
        .as_ref()
        .map(make_credentials)
        .transpose()?;
    let storage_schema = schema
        .storage_provider
        .as_ref()
        .expect("validated by Config::from_schema");
    let storage = make_storage(storage_schema, credentials.clone())?;

    let metadata = match &schema.metadata_provider {
        Some(metadata_schema) => {
            let factory = REGISTRY
                .metadata
                .lock()
                .unwrap()
                .get(&metadata_schema.provider_type)
                .cloned()
                .ok_or_else(|| {
                    Error::invalid(format!(
                        "metadata provider type {:?} is not registered",
                        metadata_schema.provider_type
                    ))
                })?;
            let resolve_storage = |sibling: &str| -> Result<Arc<dyn StorageProvider>> {
                let sibling_schema = config.profile(sibling)?;
                let sibling_credentials = sibling_schema
                    .credentials_provider
                    .as_ref()
                    .map(make_credentials)
                    .transpose()?;
                let sibling_storage = sibling_schema.storage_provider.as_ref().ok_or_else(|| {
                    Error::invalid(format!("profile {:?} has no storage provider", sibling))
                })?;
                make_storage(sibling_storage, sibling_credentials)
            };
            let ctx = MetadataContext {
                storage: &storage,
                resolve_storage: &resolve_storage,
            };
            Some(factory(metadata_schema, &ctx)?)
        }
        None => None,
    };

    Ok(ResolvedProviders {
        storage,
        metadata,
        credentials,
    })
}

/// Joins a base path and a key with forward-slash semantics.
pub(crate) fn join_key(base: &str, key: &str) -> String {
    let base = base.trim_end_matches('/');
    let key = key.trim_start_matches('/');
    if base.is_empty() {
        key.to_string()
    } else if key.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, key)
    }
}

/// Runs `op`, retrying transient failures with exponential backoff.
pub(crate) async fn with_retries<T, F, Fut>(
    attempts: u32,
    base_delay: Duration,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut delay = base_delay;
    let mut remaining = attempts.max(1);
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && remaining > 1 => {
                remaining -= 1;
                tracing::debug!(error = %err, delay_ms = delay.as_millis() as u64, "retrying transient failure");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
            Err(err) => return Err(err),
        }
    }
}

/// Collapses a sorted key iterator into delimiter-style listing entries:
/// keys directly under `prefix` stay files, deeper keys fold into directory
/// entries, first occurrence wins.
pub(crate) fn collapse_to_directories(
    entries: impl IntoIterator<Item = ObjectMetadata>,
    prefix: &str,
) -> Vec<ObjectMetadata> {
    let mut out: Vec<ObjectMetadata> = Vec::new();
    let mut last_dir: Option<String> = None;
    for entry in entries {
        let remainder = match entry.key.strip_prefix(prefix) {
            Some(r) => r,
            None => continue,
        };
        match remainder.split_once('/') {
            Some((first, _)) => {
                let dir = format!("{}{}/", prefix, first);
                if last_dir.as_deref() != Some(dir.as_str()) {
                    last_dir = Some(dir.clone());
                    out.push(ObjectMetadata::directory(dir));
                }
            }
            None => out.push(entry),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_key_semantics() {
        assert_eq!(join_key("/data", "a/b"), "/data/a/b");
        assert_eq!(join_key("/data/", "/a"), "/data/a");
        assert_eq!(join_key("", "a"), "a");
        assert_eq!(join_key("bucket", ""), "bucket");
    }

    #[test]
    fn delimiter_collapse() {
        let entries = ["x/1", "x/sub/1", "x/sub/2", "x/zub/9"]
            .into_iter()
            .map(|k| ObjectMetadata::file(k, 1, time::OffsetDateTime::UNIX_EPOCH));
        let collapsed = collapse_to_directories(entries, "x/");
        let keys: Vec<&str> = collapsed.iter().map(|m| m.key.as_str()).collect();
        assert_eq!(keys, ["x/1", "x/sub/", "x/zub/"]);
    }

    #[tokio::test]
    async fn retries_stop_on_terminal_errors() {
        let mut calls = 0;
        let result: Result<()> = with_retries(5, Duration::from_millis(1), || {
            calls += 1;
            async move { Err(Error::not_found("get", "k")) }
        })
        .await;
        assert!(result.unwrap_err().is_not_found());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn provider_bundles_supersede_individual_fields(
    ) -> Result<(), Box<dyn std::error::Error>> {
        register_provider_bundle(
            "bundle-under-test",
            Arc::new(|_schema| {
                Ok(ResolvedProviders {
                    storage: Arc::new(MemoryStorageProvider::new()),
                    metadata: None,
                    credentials: None,
                })
            }),
        );
        let config = Config::from_yaml(
            r#"
profiles:
  bundled:
    provider_bundle:
      type: bundle-under-test
"#,
        )?;
        let providers = resolve_profile(&config, "bundled")?;
        assert_eq!(providers.storage.name(), "memory");
        assert!(providers.metadata.is_none());
        Ok(())
    }

    #[test]
    fn host_registered_types_resolve() -> Result<(), Box<dyn std::error::Error>> {
        register_storage_provider(
            "host-backend-under-test",
            Arc::new(|_schema, _credentials| {
                Ok(Arc::new(MemoryStorageProvider::new()) as Arc<dyn StorageProvider>)
            }),
        );
        let config = Config::from_yaml(
            r#"
profiles:
  plugged:
    storage_provider:
      type: host-backend-under-test
"#,
        )?;
        assert!(resolve_profile(&config, "plugged").is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn retries_exhaust_transient_errors() {
        let mut calls = 0;
        let result: Result<()> = with_retries(3, Duration::from_millis(1), || {
            calls += 1;
            async move { Err(Error::unavailable("get", "k", "503")) }
        })
        .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls, 3);
    }
}
