//! The `msc://{profile}/{key}` URL model, recognition of foreign URLs, and
//! the configured source-prefix → MSC destination rewrite table.

use std::fmt;

use crate::{Error, Result};

/// A parsed `msc://{profile}/{key}` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MscUrl {
    /// The profile the URL addresses.
    pub profile: String,
    /// The key below the profile's base path; may be empty and may carry a
    /// trailing `/` to denote a directory.
    pub key: String,
}

impl MscUrl {
    /// Parses an `msc://` URL.
    ///
    /// ## Example
    /// ```
    /// # use multi_storage_client::MscUrl;
    /// let url = MscUrl::parse("msc://data/a/b.txt").unwrap();
    /// assert_eq!(url.profile, "data");
    /// assert_eq!(url.key, "a/b.txt");
    /// ```
    pub fn parse(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix("msc://")
            .ok_or_else(|| Error::invalid(format!("not an msc:// URL: {:?}", url)))?;
        let (profile, key) = match rest.split_once('/') {
            Some((profile, key)) => (profile, key),
            None => (rest, ""),
        };
        validate_profile_name(profile, true)?;
        Ok(MscUrl {
            profile: profile.to_string(),
            key: key.to_string(),
        })
    }

    /// Whether a string looks like an `msc://` URL at all.
    pub fn is_msc_url(url: &str) -> bool {
        url.starts_with("msc://")
    }
}

impl fmt::Display for MscUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msc://{}/{}", self.profile, self.key)
    }
}

/// Validates a profile name against the grammar `[A-Za-z0-9][A-Za-z0-9._-]*`.
/// Implicit profiles synthesized by the dispatcher start with `_` and are
/// only accepted when `allow_implicit` is set.
pub(crate) fn validate_profile_name(name: &str, allow_implicit: bool) -> Result<()> {
    let mut chars = name.chars();
    let valid_first = match chars.next() {
        Some('_') => allow_implicit,
        Some(c) => c.is_ascii_alphanumeric(),
        None => false,
    };
    if !valid_first || !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')) {
        return Err(Error::invalid(format!("invalid profile name: {:?}", name)));
    }
    Ok(())
}

/// A user-provided URL that is not `msc://`: either a bucket-scheme URL of a
/// known backend, or a POSIX path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ForeignUrl {
    /// `s3://bucket/key`, `gs://bucket/key`, `ais://bucket/key`.
    Bucket {
        scheme: String,
        bucket: String,
        key: String,
    },
    /// An absolute POSIX path.
    Posix { path: String },
}

impl ForeignUrl {
    /// Recognizes a foreign URL. Relative POSIX paths are resolved against
    /// the current working directory.
    pub(crate) fn parse(url: &str) -> Result<Self> {
        if let Some((scheme, rest)) = url.split_once("://") {
            if provider_type_for_scheme(scheme).is_none() {
                return Err(Error::invalid(format!(
                    "unsupported URL scheme: {:?}",
                    scheme
                )));
            }
            let (bucket, key) = match rest.split_once('/') {
                Some((bucket, key)) => (bucket, key),
                None => (rest, ""),
            };
            if bucket.is_empty() {
                return Err(Error::invalid(format!("URL has no bucket: {:?}", url)));
            }
            return Ok(ForeignUrl::Bucket {
                scheme: scheme.to_string(),
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }
        let path = if url.starts_with('/') {
            url.to_string()
        } else {
            let cwd = std::env::current_dir().map_err(|e| Error::invalid(e.to_string()))?;
            format!("{}/{}", cwd.to_string_lossy().trim_end_matches('/'), url)
        };
        Ok(ForeignUrl::Posix { path })
    }

    /// The reserved profile name this URL resolves to: `_{scheme}-{bucket}`
    /// for bucket URLs, `_file` for POSIX paths. Stable across processes.
    pub(crate) fn implicit_profile_name(&self) -> String {
        match self {
            ForeignUrl::Bucket { scheme, bucket, .. } => format!("_{}-{}", scheme, bucket),
            ForeignUrl::Posix { .. } => "_file".to_string(),
        }
    }
}

/// Maps a foreign URL scheme to the storage provider type serving it.
pub(crate) fn provider_type_for_scheme(scheme: &str) -> Option<&'static str> {
    match scheme {
        "s3" => Some("s3"),
        "gs" => Some("gcs"),
        "ais" => Some("ais"),
        _ => None,
    }
}

/// Ordered rewrite table translating non-MSC source prefixes to MSC URLs.
/// Longest source prefix wins.
#[derive(Debug, Clone, Default)]
pub struct PathMapping {
    // Sorted by source-prefix length, descending.
    entries: Vec<(String, String)>,
}

impl PathMapping {
    /// Builds a mapping from `(source_prefix, msc_destination)` pairs.
    /// Source prefixes must end in `/`; destinations must be
    /// `msc://{profile}/…/`.
    pub fn new(pairs: impl IntoIterator<Item = (String, String)>) -> Result<Self> {
        let mut entries = Vec::new();
        for (source, destination) in pairs {
            if !source.ends_with('/') {
                return Err(Error::invalid(format!(
                    "path_mapping source {:?} must end in '/'",
                    source
                )));
            }
            if !source.starts_with('/') && !source.contains("://") {
                return Err(Error::invalid(format!(
                    "path_mapping source {:?} must be a URL or an absolute path",
                    source
                )));
            }
            if !destination.ends_with('/') {
                return Err(Error::invalid(format!(
                    "path_mapping destination {:?} must end in '/'",
                    destination
                )));
            }
            // Destinations must parse as msc:// URLs with a real profile.
            MscUrl::parse(&destination)?;
            entries.push((source, destination));
        }
        entries.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Ok(PathMapping { entries })
    }

    /// Rewrites `url` through the longest matching source prefix, or returns
    /// `None` when no prefix applies.
    pub fn resolve(&self, url: &str) -> Option<String> {
        for (source, destination) in &self.entries {
            if let Some(remainder) = url.strip_prefix(source.as_str()) {
                return Some(format!("{}{}", destination, remainder));
            }
        }
        None
    }

    /// Whether the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
