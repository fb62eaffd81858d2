//! The declarative configuration schema, deserialized from YAML or JSON.

use std::collections::BTreeMap;
use std::collections::HashMap;

/// Top-level configuration document.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct ConfigSchema {
    /// Named profiles, each binding one set of providers.
    #[serde(default)]
    pub profiles: HashMap<String, ProfileSchema>,
    /// Local object cache settings, shared by every profile in the process.
    #[serde(default)]
    pub cache: Option<CacheSchema>,
    /// Telemetry pipeline settings.
    #[serde(default)]
    pub opentelemetry: Option<TelemetrySchema>,
    /// Source-prefix to `msc://` destination rewrites.
    #[serde(default)]
    pub path_mapping: BTreeMap<String, String>,
}

/// One named profile: exactly one storage provider, at most one metadata
/// provider, at most one credentials provider. A `provider_bundle` supplies
/// all three together and supersedes the individual fields.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct ProfileSchema {
    /// The storage provider serving body I/O.
    #[serde(default)]
    pub storage_provider: Option<ProviderSchema>,
    /// Optional listing/metadata accelerator.
    #[serde(default)]
    pub metadata_provider: Option<ProviderSchema>,
    /// Optional credentials source.
    #[serde(default)]
    pub credentials_provider: Option<ProviderSchema>,
    /// Optional bundle superseding the three fields above.
    #[serde(default)]
    pub provider_bundle: Option<ProviderSchema>,
}

/// A provider reference: a `type` string resolved through the provider
/// registry, plus free-form options interpreted by the factory.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ProviderSchema {
    /// Registry key, e.g. `file`, `s3`, `manifest`, or a qualified name
    /// registered by the host application.
    #[serde(rename = "type")]
    pub provider_type: String,
    /// Factory-specific options.
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl ProviderSchema {
    /// Looks up a string-typed option.
    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(|v| v.as_str())
    }

    /// Looks up a u64-typed option.
    pub fn option_u64(&self, key: &str) -> Option<u64> {
        self.options.get(key).and_then(|v| v.as_u64())
    }
}

/// Cache settings as written in the config file.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct CacheSchema {
    /// Total body-bytes bound, e.g. `"500M"` or `"2G"`.
    #[serde(default)]
    pub size: Option<String>,
    /// Validate cached bodies against backend ETags.
    #[serde(default = "default_true")]
    pub use_etag: bool,
    /// Eviction policy and maintenance cadence.
    #[serde(default)]
    pub eviction_policy: EvictionPolicySchema,
    /// Where cached bodies live.
    #[serde(default)]
    pub cache_backend: Option<CacheBackendSchema>,
}

/// Eviction policy selection.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct EvictionPolicySchema {
    /// `fifo`, `lru`, or `random`.
    #[serde(default = "default_policy")]
    pub policy: String,
    /// Seconds between maintenance rescans of the cache directory.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: u64,
}

impl Default for EvictionPolicySchema {
    fn default() -> Self {
        EvictionPolicySchema {
            policy: default_policy(),
            refresh_interval: default_refresh_interval(),
        }
    }
}

/// Cache body placement: a local directory, or a sibling profile's storage
/// provider for the early-access remote-backed mode.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct CacheBackendSchema {
    /// Directory holding bodies, entry metadata, and locks.
    #[serde(default)]
    pub cache_path: Option<String>,
    /// Profile whose storage provider holds the bodies instead of local disk.
    #[serde(default)]
    pub storage_provider_profile: Option<String>,
}

/// Telemetry settings under the `opentelemetry` key.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct TelemetrySchema {
    /// Metric pipeline settings.
    #[serde(default)]
    pub metrics: Option<MetricsSchema>,
    /// Trace pipeline settings.
    #[serde(default)]
    pub traces: Option<TracesSchema>,
}

/// Metric pipeline: attribute providers, the diperiodic reader, an exporter.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct MetricsSchema {
    /// Attribute providers contributing tag sets; later entries override
    /// earlier ones on collision.
    #[serde(default)]
    pub attributes: Vec<ProviderSchema>,
    /// Reader cadence settings.
    #[serde(default)]
    pub reader: Option<ReaderSchema>,
    /// Exporter selection, e.g. `{type: console}`.
    #[serde(default)]
    pub exporter: Option<ProviderSchema>,
}

/// Collect and export cadences of the diperiodic metric reader. The two
/// periods are independent so high-frequency gauges do not overwhelm the
/// exporter.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ReaderSchema {
    /// Instrument polling period.
    #[serde(default = "default_collect_interval")]
    pub collect_interval_millis: u64,
    /// Bound on a single collection pass.
    #[serde(default = "default_collect_timeout")]
    pub collect_interval_timeout: u64,
    /// Ring flush period.
    #[serde(default = "default_export_interval")]
    pub export_interval_millis: u64,
    /// Bound on a single export pass.
    #[serde(default = "default_export_timeout")]
    pub export_timeout_millis: u64,
}

impl Default for ReaderSchema {
    fn default() -> Self {
        ReaderSchema {
            collect_interval_millis: default_collect_interval(),
            collect_interval_timeout: default_collect_timeout(),
            export_interval_millis: default_export_interval(),
            export_timeout_millis: default_export_timeout(),
        }
    }
}

/// Trace pipeline: tail sampling threshold and exporter.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct TracesSchema {
    /// Spans at least this slow are retained even without errors.
    #[serde(default = "default_span_threshold")]
    pub latency_threshold_millis: u64,
    /// Exporter selection.
    #[serde(default)]
    pub exporter: Option<ProviderSchema>,
}

impl Default for TracesSchema {
    fn default() -> Self {
        TracesSchema {
            latency_threshold_millis: default_span_threshold(),
            exporter: None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_policy() -> String {
    "fifo".to_string()
}

fn default_refresh_interval() -> u64 {
    300
}

fn default_collect_interval() -> u64 {
    100
}

fn default_collect_timeout() -> u64 {
    100
}

fn default_export_interval() -> u64 {
    1_000
}

fn default_export_timeout() -> u64 {
    500
}

fn default_span_threshold() -> u64 {
    1_000
}
