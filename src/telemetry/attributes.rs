//! Attribute providers contribute tag sets to every exported sample. They
//! are applied in configuration order; later providers override earlier
//! ones on collision.

use std::collections::BTreeMap;

use crate::config::ProviderSchema;
use crate::{Error, Result};

/// One source of metric attributes.
pub trait AttributesProvider: Send + Sync + std::fmt::Debug {
    /// The tags this provider contributes.
    fn attributes(&self) -> BTreeMap<String, String>;
}

/// Fixed key/value pairs from the configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticAttributes {
    attributes: BTreeMap<String, String>,
}

impl StaticAttributes {
    /// Builds from explicit pairs.
    pub fn new(attributes: BTreeMap<String, String>) -> Self {
        StaticAttributes { attributes }
    }
}

impl AttributesProvider for StaticAttributes {
    fn attributes(&self) -> BTreeMap<String, String> {
        self.attributes.clone()
    }
}

/// Tags read from named environment variables at startup. Option keys name
/// the tags; values name the variables.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentAttributes {
    variables: BTreeMap<String, String>,
}

impl AttributesProvider for EnvironmentAttributes {
    fn attributes(&self) -> BTreeMap<String, String> {
        self.variables
            .iter()
            .filter_map(|(tag, variable)| {
                std::env::var(variable).ok().map(|value| (tag.clone(), value))
            })
            .collect()
    }
}

/// The machine's hostname, as `host.name`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostAttributes;

impl AttributesProvider for HostAttributes {
    fn attributes(&self) -> BTreeMap<String, String> {
        let mut attributes = BTreeMap::new();
        if let Some(hostname) = hostname() {
            attributes.insert("host.name".to_string(), hostname);
        }
        attributes
    }
}

fn hostname() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
}

/// The process id, as `process.pid`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessAttributes;

impl AttributesProvider for ProcessAttributes {
    fn attributes(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("process.pid".to_string(), std::process::id().to_string())])
    }
}

/// The recording thread, as `thread.name`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadAttributes;

impl AttributesProvider for ThreadAttributes {
    fn attributes(&self) -> BTreeMap<String, String> {
        let thread = std::thread::current();
        BTreeMap::from([(
            "thread.name".to_string(),
            thread.name().unwrap_or("unnamed").to_string(),
        )])
    }
}

/// Builds the configured provider chain and merges it into one tag set.
pub fn merged_attributes(providers: &[ProviderSchema]) -> Result<BTreeMap<String, String>> {
    let mut merged = BTreeMap::new();
    for schema in providers {
        let provider: Box<dyn AttributesProvider> = match schema.provider_type.as_str() {
            "static" => Box::new(StaticAttributes {
                attributes: string_options(schema),
            }),
            "environment" => Box::new(EnvironmentAttributes {
                variables: string_options(schema),
            }),
            "host" => Box::new(HostAttributes),
            "process" => Box::new(ProcessAttributes),
            "thread" => Box::new(ThreadAttributes),
            other => {
                return Err(Error::invalid(format!(
                    "unknown attributes provider type {:?}",
                    other
                )))
            }
        };
        // Later providers win.
        merged.extend(provider.attributes());
    }
    Ok(merged)
}

fn string_options(schema: &ProviderSchema) -> BTreeMap<String, String> {
    schema
        .options
        .iter()
        .filter_map(|(key, value)| value.as_str().map(|v| (key.clone(), v.to_string())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(provider_type: &str, pairs: &[(&str, &str)]) -> ProviderSchema {
        let mut options = serde_json::Map::new();
        for (key, value) in pairs {
            options.insert(key.to_string(), serde_json::Value::from(*value));
        }
        ProviderSchema {
            provider_type: provider_type.to_string(),
            options,
        }
    }

    #[test]
    fn later_providers_override_earlier_ones() -> Result<(), Box<dyn std::error::Error>> {
        let merged = merged_attributes(&[
            schema("static", &[("service", "msc"), ("tier", "dev")]),
            schema("static", &[("tier", "prod")]),
        ])?;
        assert_eq!(merged.get("service").map(String::as_str), Some("msc"));
        assert_eq!(merged.get("tier").map(String::as_str), Some("prod"));
        Ok(())
    }

    #[test]
    fn process_attributes_carry_the_pid() {
        let attributes = ProcessAttributes.attributes();
        assert_eq!(
            attributes.get("process.pid").map(String::as_str),
            Some(std::process::id().to_string().as_str())
        );
    }

    #[test]
    fn unknown_provider_types_are_rejected() {
        assert!(merged_attributes(&[schema("mystery", &[])]).is_err());
    }
}
