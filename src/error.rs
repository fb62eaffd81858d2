use std::fmt;

/// A specialized `Result` for storage client operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The originating operation of a failure: which call, on which key, through
/// which profile. The profile is filled in by the `StorageClient` once the
/// error crosses out of the provider layer.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// Profile the operation was issued through, empty below the client layer.
    pub profile: String,
    /// Operation name, e.g. `read` or `list`.
    pub operation: &'static str,
    /// Key the operation addressed.
    pub key: String,
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.profile.is_empty() {
            write!(f, "{} {:?}", self.operation, self.key)
        } else {
            write!(f, "{} msc://{}/{}", self.operation, self.profile, self.key)
        }
    }
}

/// Represents any of the ways an operation against a storage backend can fail.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The key or manifest generation does not exist.
    #[error("{ctx}: not found")]
    NotFound {
        /// Originating operation.
        ctx: ErrorContext,
    },
    /// Credentials are missing, invalid, or denied.
    #[error("{ctx}: unauthorized: {message}")]
    Unauthorized {
        /// Originating operation.
        ctx: ErrorContext,
        /// Backend-reported detail.
        message: String,
    },
    /// An ETag precondition did not hold.
    #[error("{ctx}: precondition failed: expected etag {expected:?}, found {found:?}")]
    PreconditionFailed {
        /// Originating operation.
        ctx: ErrorContext,
        /// The ETag the caller required.
        expected: String,
        /// The ETag observed on the backend, when known.
        found: Option<String>,
    },
    /// A transient failure (timeout, throttling, 5xx) survived every retry.
    #[error("{ctx}: unavailable: {message}")]
    Unavailable {
        /// Originating operation.
        ctx: ErrorContext,
        /// Last underlying failure.
        message: String,
    },
    /// Malformed URL, reserved profile name, or configuration schema violation.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// What was malformed.
        message: String,
    },
    /// The manifest index references missing parts, or parts fail to parse.
    #[error("manifest corrupt (profile {profile:?}): {message}")]
    ManifestCorrupt {
        /// Profile whose manifest failed to load.
        profile: String,
        /// What failed.
        message: String,
    },
    /// Local cache disk failure. Callers may retry with cache bypass.
    #[error("cache: {message}")]
    Cache {
        /// Underlying failure.
        message: String,
    },
    /// A concurrent commit or write was rejected by the backend.
    #[error("{ctx}: conflict: {message}")]
    Conflict {
        /// Originating operation.
        ctx: ErrorContext,
        /// Backend-reported detail.
        message: String,
    },
    /// Anything that does not fit the taxonomy above.
    #[error("{0}")]
    Other(String),
}

impl Error {
    pub(crate) fn not_found(operation: &'static str, key: impl Into<String>) -> Self {
        Error::NotFound {
            ctx: ErrorContext {
                profile: String::new(),
                operation,
                key: key.into(),
            },
        }
    }

    pub(crate) fn unauthorized(
        operation: &'static str,
        key: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Unauthorized {
            ctx: ErrorContext {
                profile: String::new(),
                operation,
                key: key.into(),
            },
            message: message.into(),
        }
    }

    pub(crate) fn unavailable(
        operation: &'static str,
        key: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Unavailable {
            ctx: ErrorContext {
                profile: String::new(),
                operation,
                key: key.into(),
            },
            message: message.into(),
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidArgument {
            message: message.into(),
        }
    }

    pub(crate) fn manifest_corrupt(message: impl Into<String>) -> Self {
        Error::ManifestCorrupt {
            profile: String::new(),
            message: message.into(),
        }
    }

    pub(crate) fn cache(message: impl fmt::Display) -> Self {
        Error::Cache {
            message: message.to_string(),
        }
    }

    pub(crate) fn conflict(
        operation: &'static str,
        key: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Conflict {
            ctx: ErrorContext {
                profile: String::new(),
                operation,
                key: key.into(),
            },
            message: message.into(),
        }
    }

    /// Attaches the profile name to an error bubbling out of a provider.
    /// An already-attributed error is left untouched.
    pub(crate) fn with_profile(mut self, profile: &str) -> Self {
        match &mut self {
            Error::NotFound { ctx }
            | Error::Unauthorized { ctx, .. }
            | Error::PreconditionFailed { ctx, .. }
            | Error::Unavailable { ctx, .. }
            | Error::Conflict { ctx, .. } => {
                if ctx.profile.is_empty() {
                    ctx.profile = profile.to_string();
                }
            }
            Error::ManifestCorrupt { profile: p, .. } => {
                if p.is_empty() {
                    *p = profile.to_string();
                }
            }
            _ => {}
        }
        self
    }

    /// Whether a provider retry loop should attempt the operation again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Unavailable { .. })
    }

    /// Returns true when the error means "the key does not exist".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Stable label used as the telemetry `status` tag, e.g. `error.not_found`.
    pub fn status_label(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "error.not_found",
            Error::Unauthorized { .. } => "error.unauthorized",
            Error::PreconditionFailed { .. } => "error.precondition_failed",
            Error::Unavailable { .. } => "error.unavailable",
            Error::InvalidArgument { .. } => "error.invalid_argument",
            Error::ManifestCorrupt { .. } => "error.manifest_corrupt",
            Error::Cache { .. } => "error.cache",
            Error::Conflict { .. } => "error.conflict",
            Error::Other(_) => "error.other",
        }
    }

    /// Classifies an I/O failure observed while operating on `key`.
    pub(crate) fn from_io(err: std::io::Error, operation: &'static str, key: &str) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Error::not_found(operation, key),
            std::io::ErrorKind::PermissionDenied => {
                Error::unauthorized(operation, key, err.to_string())
            }
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::Interrupted => {
                Error::unavailable(operation, key, err.to_string())
            }
            _ => Error::Other(format!("{} {:?}: {}", operation, key, err)),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            return Error::unavailable("request", "", err.to_string());
        }
        match err.status() {
            Some(status) if status.as_u16() == 404 => Error::not_found("request", ""),
            Some(status) if status.as_u16() == 401 || status.as_u16() == 403 => {
                Error::unauthorized("request", "", err.to_string())
            }
            Some(status) if status.as_u16() == 412 => Error::PreconditionFailed {
                ctx: ErrorContext {
                    profile: String::new(),
                    operation: "request",
                    key: String::new(),
                },
                expected: String::new(),
                found: None,
            },
            Some(status)
                if status.as_u16() == 408 || status.as_u16() == 429 || status.is_server_error() =>
            {
                Error::unavailable("request", "", err.to_string())
            }
            Some(status) if status.as_u16() == 409 => {
                Error::conflict("request", "", err.to_string())
            }
            _ => Error::Other(format!("network error: {}", err)),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Other(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::invalid(format!("malformed JSON: {}", err))
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::invalid(format!("malformed YAML: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_is_attached_once() {
        let err = Error::not_found("read", "a/b.txt").with_profile("data");
        assert_eq!(err.to_string(), "read msc://data/a/b.txt: not found");
        let err = err.with_profile("other");
        assert_eq!(err.to_string(), "read msc://data/a/b.txt: not found");
    }

    #[test]
    fn io_not_found_maps_to_not_found() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = Error::from_io(io, "head", "x");
        assert!(err.is_not_found());
        assert_eq!(err.status_label(), "error.not_found");
    }

    #[test]
    fn only_unavailable_is_transient() {
        assert!(Error::unavailable("get", "k", "503").is_transient());
        assert!(!Error::not_found("get", "k").is_transient());
        assert!(!Error::invalid("bad url").is_transient());
    }
}
