//! Error types for fqdnguard
//!
//! Errors carry enough context (object identity, cache key, config field) to
//! be actionable from a single log line.

use thiserror::Error;

/// Main error type for fqdnguard operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Invalid or unreadable configuration
    #[error("config error: {message}")]
    Config {
        /// Description of what's invalid
        message: String,
        /// The offending field path (e.g., "cache.entryTtlSecond")
        field: Option<String>,
    },

    /// Startup cache seeding found a uniqueness violation already in the cluster
    #[error("bootstrap error: fqdn key {key} is claimed by both {first} and {second}")]
    Bootstrap {
        /// Cache key claimed more than once
        key: String,
        /// First object found holding the key
        first: String,
        /// Second object found holding the key
        second: String,
    },

    /// Optimistic-concurrency conflicts persisted past the retry budget
    #[error("conflict updating {object}: {message}")]
    Conflict {
        /// namespace/name of the object being written
        object: String,
        /// Description of the failed write
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where the error occurred (e.g., "controller", "sweeper", "server")
        context: String,
    },
}

impl Error {
    /// Create a config error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a config error pointing at a specific field
    pub fn config_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a bootstrap conflict error
    pub fn bootstrap(
        key: impl Into<String>,
        first: impl Into<String>,
        second: impl Into<String>,
    ) -> Self {
        Self::Bootstrap {
            key: key.into(),
            first: first.into(),
            second: second.into(),
        }
    }

    /// Create a conflict error for an object write
    pub fn conflict(object: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Conflict {
            object: object.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// True if this error is an HTTP 409 from the API server
    pub fn is_api_conflict(&self) -> bool {
        matches!(self, Self::Kube { source: kube::Error::Api(e) } if e.code == 409)
    }

    /// True if this error is an HTTP 404 from the API server
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Kube { source: kube::Error::Api(e) } if e.code == 404)
    }

    /// Whether retrying the failed operation later may succeed.
    ///
    /// Bootstrap and config errors are permanent; everything that touched the
    /// API server is worth requeueing.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Kube { .. } | Self::Conflict { .. } => true,
            Self::Config { .. } | Self::Bootstrap { .. } | Self::Internal { .. } => false,
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::config(e.to_string())
    }
}
