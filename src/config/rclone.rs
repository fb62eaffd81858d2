//! Rclone INI interop: profiles for users who already maintain an
//! `rclone.conf`. Sections become profiles; keys keep their rclone names
//! (`endpoint`, `access_key_id`, `secret_key_id`, …) and are handed to the
//! provider factory untouched.

use std::collections::BTreeMap;
use std::path::PathBuf;

use super::schema::{ProfileSchema, ProviderSchema};

/// Profiles found in the first existing rclone config file, if any. Sections
/// with an unknown `type` are skipped.
pub(super) fn discover_profiles() -> Vec<(String, ProfileSchema)> {
    let Some(path) = discovered_rclone_path() else {
        return Vec::new();
    };
    let Ok(text) = std::fs::read_to_string(&path) else {
        return Vec::new();
    };
    profiles_from_ini(&text)
}

/// Discovery order: `rclone.conf` next to an `rclone` binary on `PATH`, then
/// `$XDG_CONFIG_HOME/rclone/rclone.conf`, `/etc/rclone.conf`,
/// `~/.config/rclone/rclone.conf`, `~/.rclone.conf`.
fn discovered_rclone_path() -> Option<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(paths) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&paths) {
            if dir.join("rclone").is_file() {
                candidates.push(dir.join("rclone.conf"));
                break;
            }
        }
    }
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        if !xdg.is_empty() {
            candidates.push(PathBuf::from(xdg).join("rclone/rclone.conf"));
        }
    }
    candidates.push(PathBuf::from("/etc/rclone.conf"));
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(".config/rclone/rclone.conf"));
        candidates.push(home.join(".rclone.conf"));
    }
    candidates.into_iter().find(|p| p.is_file())
}

fn profiles_from_ini(text: &str) -> Vec<(String, ProfileSchema)> {
    parse_ini(text)
        .into_iter()
        .filter_map(|(name, mut section)| {
            if name.starts_with('_') {
                return None;
            }
            let rclone_type = section.remove("type")?;
            let Some(provider_type) = provider_type_for_rclone(&rclone_type) else {
                tracing::debug!(section = %name, rclone_type = %rclone_type, "skipping rclone section with unsupported type");
                return None;
            };
            let mut options = serde_json::Map::new();
            for (key, value) in section {
                options.insert(key, serde_json::Value::from(value));
            }
            Some((
                name,
                ProfileSchema {
                    storage_provider: Some(ProviderSchema {
                        provider_type: provider_type.to_string(),
                        options,
                    }),
                    metadata_provider: None,
                    credentials_provider: None,
                    provider_bundle: None,
                },
            ))
        })
        .collect()
}

fn provider_type_for_rclone(rclone_type: &str) -> Option<&'static str> {
    match rclone_type {
        "s3" => Some("s3"),
        "google cloud storage" => Some("gcs"),
        "azureblob" => Some("azure"),
        "oracleobjectstorage" => Some("oci"),
        "local" => Some("file"),
        _ => None,
    }
}

/// A minimal INI reader: `[section]` headers, `key = value` lines, `#` and
/// `;` comments. Quoting and line continuations are not part of the rclone
/// dialect this crate consumes.
fn parse_ini(text: &str) -> Vec<(String, BTreeMap<String, String>)> {
    let mut sections: Vec<(String, BTreeMap<String, String>)> = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            sections.push((name.trim().to_string(), BTreeMap::new()));
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        if let Some((_, section)) = sections.last_mut() {
            section.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    sections
}
