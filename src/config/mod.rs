//! Declarative configuration: file discovery, environment expansion, profile
//! validation, and the realized settings handed to the client registry.

mod rclone;
mod schema;

pub use self::schema::{
    CacheBackendSchema, CacheSchema, ConfigSchema, EvictionPolicySchema, MetricsSchema,
    ProfileSchema, ProviderSchema, ReaderSchema, TelemetrySchema, TracesSchema,
};

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;

use crate::url::{validate_profile_name, PathMapping};
use crate::{Error, Result};

/// The predefined profile giving POSIX access rooted at `/`.
pub const DEFAULT_POSIX_PROFILE: &str = "default";

/// Environment variable naming an explicit config file.
pub const MSC_CONFIG_ENV: &str = "MSC_CONFIG";

/// Validated, process-ready configuration.
#[derive(Debug, Clone)]
pub struct Config {
    profiles: HashMap<String, ProfileSchema>,
    /// Cache settings shared by every client in the process, when configured.
    pub cache: Option<CacheSchema>,
    /// Telemetry settings, when configured.
    pub telemetry: Option<TelemetrySchema>,
    /// Foreign-URL rewrite table.
    pub path_mapping: PathMapping,
}

impl Default for Config {
    fn default() -> Self {
        Config::from_schema(ConfigSchema::default()).expect("empty schema always validates")
    }
}

impl Config {
    /// Discovers configuration from the documented chain: `$MSC_CONFIG`,
    /// `/etc/msc_config.yaml`, `~/.config/msc/config.yaml`,
    /// `~/.msc_config.yaml`, then the JSON equivalents. First existing file
    /// wins. Rclone INI profiles are merged in afterwards for names the main
    /// config does not define. With no file at all, only the default POSIX
    /// profile exists.
    pub fn discover() -> Result<Config> {
        #[cfg(feature = "dotenv")]
        dotenv::dotenv().ok();

        let mut schema = match discovered_config_path() {
            Some(path) => parse_config_file(&path)?,
            None => ConfigSchema::default(),
        };
        for (name, profile) in rclone::discover_profiles() {
            schema.profiles.entry(name).or_insert(profile);
        }
        Config::from_schema(schema)
    }

    /// Loads a specific config file, `.yaml`/`.yml` or `.json` by extension.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Config> {
        Config::from_schema(parse_config_file(path.as_ref())?)
    }

    /// Parses a YAML document.
    pub fn from_yaml(text: &str) -> Result<Config> {
        let value: serde_json::Value =
            serde_yaml::from_str(text).map_err(|e| Error::invalid(format!("config: {}", e)))?;
        Config::from_value(value)
    }

    /// Parses a JSON document.
    pub fn from_json(text: &str) -> Result<Config> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        Config::from_value(value)
    }

    fn from_value(mut value: serde_json::Value) -> Result<Config> {
        expand_env_values(&mut value, &|name| std::env::var(name).ok());
        let schema: ConfigSchema = serde_json::from_value(value)
            .map_err(|e| Error::invalid(format!("config schema: {}", e)))?;
        Config::from_schema(schema)
    }

    /// Validates a schema and realizes the configuration.
    ///
    /// User-provided profile names must not begin with `_` (reserved for the
    /// implicit profiles the URL dispatcher synthesizes), every profile needs
    /// a storage provider or a bundle, and `default` stays on the file
    /// provider.
    pub fn from_schema(schema: ConfigSchema) -> Result<Config> {
        let ConfigSchema {
            mut profiles,
            cache,
            opentelemetry,
            path_mapping,
        } = schema;

        for (name, profile) in &profiles {
            validate_profile_name(name, false)?;
            if profile.provider_bundle.is_none() && profile.storage_provider.is_none() {
                return Err(Error::invalid(format!(
                    "profile {:?} has neither storage_provider nor provider_bundle",
                    name
                )));
            }
            if let Some(storage) = &profile.storage_provider {
                if name == DEFAULT_POSIX_PROFILE && storage.provider_type != "file" {
                    return Err(Error::invalid(format!(
                        "profile {:?} must use the file provider, found {:?}",
                        DEFAULT_POSIX_PROFILE, storage.provider_type
                    )));
                }
            }
        }
        profiles
            .entry(DEFAULT_POSIX_PROFILE.to_string())
            .or_insert_with(default_posix_profile);

        Ok(Config {
            profiles,
            cache,
            telemetry: opentelemetry,
            path_mapping: PathMapping::new(path_mapping)?,
        })
    }

    /// Looks up a profile by name.
    pub fn profile(&self, name: &str) -> Result<&ProfileSchema> {
        self.profiles.get(name).ok_or_else(|| {
            Error::invalid(format!("profile {:?} is not defined in the configuration", name))
        })
    }

    /// Whether a profile is defined.
    pub fn has_profile(&self, name: &str) -> bool {
        self.profiles.contains_key(name)
    }

    /// Registers a synthesized implicit profile (name starting with `_`).
    pub(crate) fn insert_implicit_profile(&mut self, name: &str, profile: ProfileSchema) {
        debug_assert!(name.starts_with('_'));
        self.profiles.insert(name.to_string(), profile);
    }

    /// All configured profile names.
    pub fn profile_names(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }
}

fn default_posix_profile() -> ProfileSchema {
    let mut options = serde_json::Map::new();
    options.insert("base_path".to_string(), serde_json::Value::from("/"));
    ProfileSchema {
        storage_provider: Some(ProviderSchema {
            provider_type: "file".to_string(),
            options,
        }),
        metadata_provider: None,
        credentials_provider: None,
        provider_bundle: None,
    }
}

fn discovered_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(MSC_CONFIG_ENV) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    let home = dirs::home_dir();
    let mut candidates = vec![PathBuf::from("/etc/msc_config.yaml")];
    if let Some(home) = &home {
        candidates.push(home.join(".config/msc/config.yaml"));
        candidates.push(home.join(".msc_config.yaml"));
    }
    candidates.push(PathBuf::from("/etc/msc_config.json"));
    if let Some(home) = &home {
        candidates.push(home.join(".config/msc/config.json"));
        candidates.push(home.join(".msc_config.json"));
    }
    candidates.into_iter().find(|p| p.is_file())
}

fn parse_config_file(path: &Path) -> Result<ConfigSchema> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::invalid(format!("config file {:?}: {}", path, e)))?;
    let is_json = path.extension().map(|e| e == "json").unwrap_or(false);
    let mut value: serde_json::Value = if is_json {
        serde_json::from_str(&text)?
    } else {
        serde_yaml::from_str(&text).map_err(|e| Error::invalid(format!("config: {}", e)))?
    };
    expand_env_values(&mut value, &|name| std::env::var(name).ok());
    serde_json::from_value(value).map_err(|e| Error::invalid(format!("config schema: {}", e)))
}

static ENV_REFERENCE: Lazy<regex::Regex> =
    Lazy::new(|| regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)").unwrap());

/// Expands `${VAR}` and `$VAR` in every string value of the tree. Unresolved
/// references are left literal.
fn expand_env_values(value: &mut serde_json::Value, lookup: &dyn Fn(&str) -> Option<String>) {
    match value {
        serde_json::Value::String(s) => {
            let expanded = ENV_REFERENCE.replace_all(s, |caps: &regex::Captures<'_>| {
                let name = caps.get(1).or_else(|| caps.get(2)).unwrap().as_str();
                lookup(name).unwrap_or_else(|| caps[0].to_string())
            });
            if expanded != *s {
                *s = expanded.into_owned();
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                expand_env_values(item, lookup);
            }
        }
        serde_json::Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                expand_env_values(item, lookup);
            }
        }
        _ => {}
    }
}

/// Parses a cache size string: digits with an optional `K`/`M`/`G`/`T`
/// binary suffix.
pub fn parse_size(text: &str) -> Result<u64> {
    let text = text.trim();
    let (digits, multiplier) = match text.char_indices().last() {
        Some((idx, c)) if c.is_ascii_alphabetic() => {
            let multiplier: u64 = match c.to_ascii_uppercase() {
                'K' => 1 << 10,
                'M' => 1 << 20,
                'G' => 1 << 30,
                'T' => 1 << 40,
                _ => return Err(Error::invalid(format!("invalid size suffix: {:?}", text))),
            };
            (&text[..idx], multiplier)
        }
        _ => (text, 1),
    };
    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| Error::invalid(format!("invalid size: {:?}", text)))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| Error::invalid(format!("size overflows: {:?}", text)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_profiles_round_trip() -> Result<(), Box<dyn std::error::Error>> {
        let config = Config::from_yaml(
            r#"
profiles:
  data:
    storage_provider:
      type: file
      options:
        base_path: /tmp/data
cache:
  size: 500M
  eviction_policy:
    policy: lru
    refresh_interval: 60
path_mapping:
  "/mnt/data/": "msc://data/"
"#,
        )?;
        let profile = config.profile("data")?;
        let storage = profile.storage_provider.as_ref().unwrap();
        assert_eq!(storage.provider_type, "file");
        assert_eq!(storage.option_str("base_path"), Some("/tmp/data"));
        let cache = config.cache.as_ref().unwrap();
        assert_eq!(cache.eviction_policy.policy, "lru");
        assert_eq!(
            config.path_mapping.resolve("/mnt/data/x").as_deref(),
            Some("msc://data/x")
        );
        Ok(())
    }

    #[test]
    fn default_profile_is_always_present() {
        let config = Config::default();
        let profile = config.profile(DEFAULT_POSIX_PROFILE).unwrap();
        let storage = profile.storage_provider.as_ref().unwrap();
        assert_eq!(storage.provider_type, "file");
        assert_eq!(storage.option_str("base_path"), Some("/"));
    }

    #[test]
    fn reserved_profile_names_are_rejected() {
        let err = Config::from_yaml(
            "profiles:\n  _hidden:\n    storage_provider:\n      type: file\n",
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[test]
    fn default_profile_must_stay_posix() {
        let err = Config::from_yaml(
            "profiles:\n  default:\n    storage_provider:\n      type: memory\n",
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[test]
    fn env_references_expand_and_unresolved_stay_literal() {
        let mut value = serde_json::json!({
            "a": "${PRESENT}/x",
            "b": "$PRESENT",
            "c": "${MISSING}/y",
            "nested": { "d": ["$PRESENT"] },
        });
        expand_env_values(&mut value, &|name| {
            (name == "PRESENT").then(|| "v".to_string())
        });
        assert_eq!(value["a"], "v/x");
        assert_eq!(value["b"], "v");
        assert_eq!(value["c"], "${MISSING}/y");
        assert_eq!(value["nested"]["d"][0], "v");
    }

    #[test]
    fn size_suffixes() {
        assert_eq!(parse_size("10").unwrap(), 10);
        assert_eq!(parse_size("2K").unwrap(), 2048);
        assert_eq!(parse_size("500M").unwrap(), 500 << 20);
        assert_eq!(parse_size("1T").unwrap(), 1 << 40);
        assert!(parse_size("1X").is_err());
        assert!(parse_size("").is_err());
    }
}
