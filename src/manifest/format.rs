//! On-disk manifest formats: the generation index and line-delimited parts.

use std::collections::HashMap;

use crate::models::{ObjectMetadata, ObjectType};
use crate::{Error, Result};

/// Index file name inside a generation directory.
pub const INDEX_FILENAME: &str = "msc_manifest_index.json";

/// The only index version this crate reads and writes.
pub const INDEX_VERSION: &str = "1.0";

/// Upper bound on lines per part file written by `commit`.
pub const PART_LINES: usize = 100_000;

/// `{"version":"1.0","parts":[{"path":…}]}`.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct ManifestIndex {
    /// Format version.
    pub version: String,
    /// Part files, relative to the generation directory.
    pub parts: Vec<PartRef>,
}

/// One part reference inside the index.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct PartRef {
    /// Path relative to the generation directory.
    pub path: String,
}

/// Relative path of the `seq`-th part file.
pub fn part_path(seq: usize) -> String {
    format!("parts/msc_manifest_part{:06}.jsonl", seq)
}

/// One line of a part file.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct PartEntry {
    /// Object key.
    pub key: String,
    /// Body length in bytes.
    pub size_bytes: u64,
    /// Modification time.
    #[serde(with = "time::serde::rfc3339")]
    pub last_modified: time::OffsetDateTime,
    /// Backend entity tag, when captured at generation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    /// User metadata, when captured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
}

impl From<PartEntry> for ObjectMetadata {
    fn from(entry: PartEntry) -> Self {
        ObjectMetadata {
            key: entry.key,
            object_type: ObjectType::File,
            content_length: entry.size_bytes,
            last_modified: entry.last_modified,
            etag: entry.etag,
            storage_class: None,
            metadata: entry.metadata,
        }
    }
}

impl From<&ObjectMetadata> for PartEntry {
    fn from(metadata: &ObjectMetadata) -> Self {
        PartEntry {
            key: metadata.key.clone(),
            size_bytes: metadata.content_length,
            last_modified: metadata.last_modified,
            etag: metadata.etag.clone(),
            metadata: metadata.metadata.clone(),
        }
    }
}

// Fixed-width RFC 3339 UTC with nine subsecond digits, so generation names
// order lexicographically exactly as they order in time.
const GENERATION_FORMAT: &[time::format_description::FormatItem<'_>] = time::macros::format_description!(
    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:9]Z"
);

/// A generation timestamp strictly greater than `after`, taken from the UTC
/// clock and nudged forward by a nanosecond when the clock has not advanced.
pub fn generation_timestamp(after: Option<&str>) -> Result<String> {
    let mut instant = time::OffsetDateTime::now_utc();
    let mut candidate = format_generation(instant)?;
    if let Some(after) = after {
        while candidate.as_str() <= after {
            let floor =
                time::OffsetDateTime::parse(after, &time::format_description::well_known::Rfc3339)
                    .map_err(|e| {
                        Error::manifest_corrupt(format!("bad generation {:?}: {}", after, e))
                    })?;
            instant = floor + time::Duration::nanoseconds(1);
            candidate = format_generation(instant)?;
        }
    }
    Ok(candidate)
}

fn format_generation(instant: time::OffsetDateTime) -> Result<String> {
    instant
        .to_offset(time::UtcOffset::UTC)
        .format(GENERATION_FORMAT)
        .map_err(|e| Error::Other(format!("formatting generation timestamp: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_paths_are_zero_padded() {
        assert_eq!(part_path(0), "parts/msc_manifest_part000000.jsonl");
        assert_eq!(part_path(42), "parts/msc_manifest_part000042.jsonl");
    }

    #[test]
    fn timestamps_are_strictly_increasing() -> Result<(), Box<dyn std::error::Error>> {
        let first = generation_timestamp(None)?;
        let second = generation_timestamp(Some(&first))?;
        assert!(second > first);

        // Even against a generation from the far future the tie is broken
        // forward, never backward.
        let future = "2999-01-01T00:00:00.000000000Z";
        let bumped = generation_timestamp(Some(future))?;
        assert!(bumped.as_str() > future);
        Ok(())
    }

    #[test]
    fn part_lines_round_trip() -> Result<(), Box<dyn std::error::Error>> {
        let line = r#"{"key":"x/1","size_bytes":3,"last_modified":"2024-01-01T00:00:00Z"}"#;
        let entry: PartEntry = serde_json::from_str(line)?;
        let metadata: ObjectMetadata = entry.into();
        assert_eq!(metadata.key, "x/1");
        assert_eq!(metadata.content_length, 3);
        assert_eq!(metadata.etag, None);
        Ok(())
    }
}
