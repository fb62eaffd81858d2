use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use once_cell::sync::OnceCell;

use crate::cache::{Cache, CacheOptions};
use crate::client::StorageClient;
use crate::config::{Config, ProfileSchema, ProviderSchema};
use crate::telemetry::Recorder;
use crate::url::{provider_type_for_scheme, ForeignUrl, MscUrl};
use crate::Result;

/// Owns every profile's client in the process: lazy construction on first
/// use, guarded by a lock, retained until exit. The cache and telemetry
/// recorder are shared by all clients, implicit profiles included.
pub struct ClientRegistry {
    config: RwLock<Config>,
    cache: OnceCell<Option<Arc<Cache>>>,
    telemetry: OnceCell<Option<Arc<Recorder>>>,
    clients: Mutex<HashMap<String, Arc<StorageClient>>>,
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("clients", &self.clients.lock().unwrap().len())
            .finish()
    }
}

impl ClientRegistry {
    /// A registry over the discovered configuration. Discovery failures fall
    /// back to the default POSIX-only configuration so the process can still
    /// address local files.
    pub fn discover() -> Self {
        let config = Config::discover().unwrap_or_else(|err| {
            tracing::warn!(error = %err, "configuration discovery failed, using defaults");
            Config::default()
        });
        ClientRegistry::with_config(config)
    }

    /// A registry over an explicit configuration.
    pub fn with_config(config: Config) -> Self {
        ClientRegistry {
            config: RwLock::new(config),
            cache: OnceCell::new(),
            telemetry: OnceCell::new(),
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// The client for `profile`, constructing it on first use.
    pub fn client(&self, profile: &str) -> Result<Arc<StorageClient>> {
        if let Some(client) = self.clients.lock().expect("client registry poisoned").get(profile) {
            return Ok(client.clone());
        }

        let built = {
            let config = self.config.read().expect("config lock poisoned");
            StorageClient::from_config(&config, profile, self.shared_cache(), self.shared_telemetry())?
        };
        let mut clients = self.clients.lock().expect("client registry poisoned");
        Ok(clients
            .entry(profile.to_string())
            .or_insert_with(|| Arc::new(built))
            .clone())
    }

    /// Resolves a URL to `(client, key)`: `msc://` directly, then the
    /// longest-prefix path mapping, then an implicit profile synthesized
    /// from the foreign URL.
    pub fn resolve(&self, url: &str) -> Result<(Arc<StorageClient>, String)> {
        if MscUrl::is_msc_url(url) {
            let parsed = MscUrl::parse(url)?;
            return Ok((self.client(&parsed.profile)?, parsed.key));
        }

        let mapped = {
            let config = self.config.read().expect("config lock poisoned");
            config.path_mapping.resolve(url)
        };
        if let Some(mapped) = mapped {
            let parsed = MscUrl::parse(&mapped)?;
            return Ok((self.client(&parsed.profile)?, parsed.key));
        }

        let foreign = ForeignUrl::parse(url)?;
        let name = foreign.implicit_profile_name();
        {
            let mut config = self.config.write().expect("config lock poisoned");
            if !config.has_profile(&name) {
                config.insert_implicit_profile(&name, implicit_profile(&foreign));
            }
        }
        let key = match foreign {
            ForeignUrl::Bucket { key, .. } => key,
            ForeignUrl::Posix { path } => path.trim_start_matches('/').to_string(),
        };
        Ok((self.client(&name)?, key))
    }

    // One cache for the whole process. A configured `cache:` block is
    // honored; without one the defaults still give implicit profiles the
    // local file-system cache.
    fn shared_cache(&self) -> Option<Arc<Cache>> {
        self.cache
            .get_or_init(|| {
                let config = self.config.read().expect("config lock poisoned");
                let built = match &config.cache {
                    Some(schema) => CacheOptions::from_schema(schema).and_then(|options| {
                        match schema
                            .cache_backend
                            .as_ref()
                            .and_then(|b| b.storage_provider_profile.as_deref())
                        {
                            Some(backing_profile) => {
                                let providers =
                                    crate::providers::resolve_profile(&config, backing_profile)?;
                                Cache::with_backend(options, providers.storage)
                            }
                            None => Cache::new(options),
                        }
                    }),
                    None => Cache::new(CacheOptions::default()),
                };
                match built {
                    Ok(cache) => Some(Arc::new(cache)),
                    Err(err) => {
                        tracing::warn!(error = %err, "cache unavailable, operating uncached");
                        None
                    }
                }
            })
            .clone()
    }

    fn shared_telemetry(&self) -> Option<Arc<Recorder>> {
        self.telemetry
            .get_or_init(|| {
                let config = self.config.read().expect("config lock poisoned");
                let schema = config.telemetry.as_ref()?;
                match Recorder::from_schema(schema) {
                    Ok(recorder) => Some(recorder),
                    Err(err) => {
                        tracing::warn!(error = %err, "telemetry unavailable");
                        None
                    }
                }
            })
            .clone()
    }
}

fn implicit_profile(foreign: &ForeignUrl) -> ProfileSchema {
    let storage = match foreign {
        ForeignUrl::Bucket { scheme, bucket, .. } => {
            let mut options = serde_json::Map::new();
            options.insert("base_path".to_string(), serde_json::Value::from(bucket.as_str()));
            ProviderSchema {
                provider_type: provider_type_for_scheme(scheme)
                    .expect("validated by ForeignUrl::parse")
                    .to_string(),
                options,
            }
        }
        ForeignUrl::Posix { .. } => {
            let mut options = serde_json::Map::new();
            options.insert("base_path".to_string(), serde_json::Value::from("/"));
            ProviderSchema {
                provider_type: "file".to_string(),
                options,
            }
        }
    };
    ProfileSchema {
        storage_provider: Some(storage),
        metadata_provider: None,
        credentials_provider: None,
        provider_bundle: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn test_config(yaml: &str) -> Config {
        Config::from_yaml(yaml).unwrap()
    }

    #[tokio::test]
    async fn clients_are_constructed_once_per_profile() -> Result<(), Box<dyn std::error::Error>>
    {
        let registry = ClientRegistry::with_config(test_config(
            "profiles:\n  mem:\n    storage_provider:\n      type: memory\n",
        ));
        let first = registry.client("mem")?;
        let second = registry.client("mem")?;
        assert!(Arc::ptr_eq(&first, &second));

        first.write("k", "v").await?;
        assert_eq!(&second.read("k", None).await?[..], b"v");
        Ok(())
    }

    #[test]
    fn unknown_profiles_are_invalid() {
        let registry = ClientRegistry::with_config(Config::default());
        assert!(matches!(
            registry.client("missing").unwrap_err(),
            Error::InvalidArgument { .. }
        ));
    }

    #[test]
    fn msc_urls_resolve_directly() -> Result<(), Box<dyn std::error::Error>> {
        let registry = ClientRegistry::with_config(test_config(
            "profiles:\n  data:\n    storage_provider:\n      type: memory\n",
        ));
        let (client, key) = registry.resolve("msc://data/a/b.txt")?;
        assert_eq!(client.profile(), "data");
        assert_eq!(key, "a/b.txt");
        Ok(())
    }

    #[test]
    fn path_mapping_wins_over_implicit_profiles() -> Result<(), Box<dyn std::error::Error>> {
        let registry = ClientRegistry::with_config(test_config(
            r#"
profiles:
  mapped:
    storage_provider:
      type: memory
path_mapping:
  "/mnt/data/": "msc://mapped/"
"#,
        ));
        let (client, key) = registry.resolve("/mnt/data/x/y")?;
        assert_eq!(client.profile(), "mapped");
        assert_eq!(key, "x/y");
        Ok(())
    }

    #[test]
    fn foreign_urls_synthesize_stable_implicit_profiles(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let registry = ClientRegistry::with_config(Config::default());
        let (client, key) = registry.resolve("/tmp/some/file")?;
        assert_eq!(client.profile(), "_file");
        assert_eq!(key, "tmp/some/file");

        let (again, _) = registry.resolve("/tmp/other")?;
        assert!(Arc::ptr_eq(&client, &again));

        // Bucket schemes resolve to their vendor type, which is a registry
        // miss until a host registers the factory.
        let err = registry.resolve("s3://bucket/key").unwrap_err();
        assert!(err.to_string().contains("not registered"));
        Ok(())
    }
}
