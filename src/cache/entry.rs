use std::path::{Path, PathBuf};

use sha2::Digest;

/// State recorded next to each cached body in `{fingerprint}.meta`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CacheEntry {
    /// Body length in bytes.
    pub size: u64,
    /// Insertion instant, nanoseconds since the Unix epoch.
    pub inserted_at: u64,
    /// Last read instant, nanoseconds since the Unix epoch.
    pub last_accessed: u64,
    /// ETag of the stored body at insertion time, when the backend had one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

impl CacheEntry {
    /// A fresh entry inserted now.
    pub fn new(size: u64, etag: Option<String>) -> Self {
        let now = monotonic_nanos();
        CacheEntry {
            size,
            inserted_at: now,
            last_accessed: now,
            etag,
        }
    }

    /// Marks the entry as just read.
    pub fn touch(&mut self) {
        self.last_accessed = monotonic_nanos();
    }

    /// Whether a caller-supplied ETag invalidates this entry. A caller
    /// without an ETag, or an entry recorded without one, always matches.
    pub fn matches_etag(&self, expected: Option<&str>) -> bool {
        match (expected, &self.etag) {
            (Some(expected), Some(held)) => expected == held,
            _ => true,
        }
    }
}

/// Collision-resistant identifier of `(profile, key)`, used as the cache
/// file name. Stable across processes.
pub fn fingerprint(profile: &str, key: &str) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(profile.as_bytes());
    hasher.update(b"/");
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Path of the cached body.
pub fn body_path(dir: &Path, fingerprint: &str) -> PathBuf {
    dir.join(fingerprint)
}

/// Path of the serialized [`CacheEntry`].
pub fn meta_path(dir: &Path, fingerprint: &str) -> PathBuf {
    dir.join(format!("{}.meta", fingerprint))
}

/// Path of the per-entry inter-process lock file.
pub fn lock_path(dir: &Path, fingerprint: &str) -> PathBuf {
    dir.join(format!("{}.lock", fingerprint))
}

// Wall-clock nanoseconds forced strictly monotonic within the process, so
// insertion and access order stay total even when the clock ticks coarsely.
pub(super) fn monotonic_nanos() -> u64 {
    static LAST: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
    let wall = std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    LAST.fetch_update(
        std::sync::atomic::Ordering::SeqCst,
        std::sync::atomic::Ordering::SeqCst,
        |last| Some(wall.max(last + 1)),
    )
    .map(|last| wall.max(last + 1))
    .unwrap_or(wall)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprints_are_stable_and_distinct() {
        assert_eq!(fingerprint("p", "a/b"), fingerprint("p", "a/b"));
        assert_ne!(fingerprint("p", "a/b"), fingerprint("q", "a/b"));
        assert_ne!(fingerprint("p", "a/b"), fingerprint("p", "a/c"));
        assert_eq!(fingerprint("p", "k").len(), 64);
    }

    #[test]
    fn etag_matching() {
        let entry = CacheEntry::new(3, Some("A".to_string()));
        assert!(entry.matches_etag(None));
        assert!(entry.matches_etag(Some("A")));
        assert!(!entry.matches_etag(Some("B")));

        let untagged = CacheEntry::new(3, None);
        assert!(untagged.matches_etag(Some("A")));
    }
}
