use std::collections::HashMap;

/// Whether a listing entry is an object or a directory placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    /// A regular object.
    File,
    /// A directory; its key ends in `/` and its length is zero.
    Directory,
}

/// A resource describing one object (or directory) on a storage backend.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ObjectMetadata {
    /// The key of the object, relative to the provider's base path.
    pub key: String,
    /// File or directory.
    #[serde(rename = "type")]
    pub object_type: ObjectType,
    /// Content-Length of the data in bytes. Zero for directories.
    pub content_length: u64,
    /// The modification time of the object in RFC 3339 format.
    #[serde(with = "time::serde::rfc3339")]
    pub last_modified: time::OffsetDateTime,
    /// HTTP entity tag. Opaque; presence and format depend on the backend.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    /// Storage class of the object, when the backend reports one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
    /// User-provided metadata, in key/value pairs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
}

impl ObjectMetadata {
    /// Metadata for a regular object.
    pub fn file(key: impl Into<String>, content_length: u64, last_modified: time::OffsetDateTime) -> Self {
        ObjectMetadata {
            key: key.into(),
            object_type: ObjectType::File,
            content_length,
            last_modified,
            etag: None,
            storage_class: None,
            metadata: None,
        }
    }

    /// Metadata for a directory placeholder. The key gains a trailing `/` if
    /// it does not already carry one.
    pub fn directory(key: impl Into<String>) -> Self {
        let mut key = key.into();
        if !key.ends_with('/') {
            key.push('/');
        }
        ObjectMetadata {
            key,
            object_type: ObjectType::Directory,
            content_length: 0,
            last_modified: time::OffsetDateTime::UNIX_EPOCH,
            etag: None,
            storage_class: None,
            metadata: None,
        }
    }

    /// The sentinel returned by non-strict metadata lookups of missing keys.
    pub fn sentinel(key: impl Into<String>) -> Self {
        ObjectMetadata::file(key, 0, time::OffsetDateTime::UNIX_EPOCH)
    }

    /// Whether this entry is a directory placeholder.
    pub fn is_directory(&self) -> bool {
        self.object_type == ObjectType::Directory
    }

    /// Sets the ETag.
    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_keys_end_in_slash() {
        let dir = ObjectMetadata::directory("a/b");
        assert_eq!(dir.key, "a/b/");
        assert_eq!(dir.content_length, 0);
        assert!(dir.is_directory());
    }

    #[test]
    fn serde_round_trip_uses_type_tag() {
        let meta = ObjectMetadata::file("x/1", 3, time::OffsetDateTime::UNIX_EPOCH).with_etag("abc");
        let json = serde_json::to_string(&meta).unwrap();
        assert!(json.contains("\"type\":\"file\""));
        let back: ObjectMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back, meta);
    }
}
