//! Error types for rivven-pool
//!
//! Errors are classified so callers can decide how to react:
//! - Retriable errors (open failures, borrow timeouts)
//! - Programming errors (double release, misconfiguration)

use std::fmt;
use thiserror::Error;

/// Result type for rivven-pool operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// The factory could not open a resource (retriable)
    Connection,
    /// A borrow or validation check ran out of time (retriable)
    Timeout,
    /// Invalid pool configuration
    Configuration,
    /// A connection was released by a caller that does not own it
    Ownership,
    /// A health check rejected the connection
    Validation,
    /// An operation on the raw resource failed
    Resource,
    /// The pool has been closed
    Closed,
    /// Unknown/other errors
    Other,
}

impl ErrorCategory {
    /// Whether errors in this category are generally retriable
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::Connection | Self::Timeout)
    }
}

/// Main error type for rivven-pool
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Opening a resource failed
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Operation timed out
    #[error("timeout: {message}")]
    Timeout { message: String },

    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Connection released by a non-owner, or released twice
    #[error("double release: {message}")]
    DoubleRelease { message: String },

    /// Health check failed
    #[error("validation failed: {message}")]
    Validation { message: String },

    /// Call against the raw resource failed
    #[error("resource error: {message}")]
    Resource {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Pool has been closed
    #[error("pool closed")]
    PoolClosed,

    /// Internal error
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::DoubleRelease { .. } => ErrorCategory::Ownership,
            Self::Validation { .. } => ErrorCategory::Validation,
            Self::Resource { .. } => ErrorCategory::Resource,
            Self::PoolClosed => ErrorCategory::Closed,
            Self::Internal { .. } => ErrorCategory::Other,
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a double-release error
    pub fn double_release(message: impl Into<String>) -> Self {
        Self::DoubleRelease {
            message: message.into(),
        }
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a resource error
    pub fn resource(message: impl Into<String>) -> Self {
        Self::Resource {
            message: message.into(),
            source: None,
        }
    }

    /// Create a resource error with source
    pub fn resource_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Resource {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection => write!(f, "connection"),
            Self::Timeout => write!(f, "timeout"),
            Self::Configuration => write!(f, "configuration"),
            Self::Ownership => write!(f, "ownership"),
            Self::Validation => write!(f, "validation"),
            Self::Resource => write!(f, "resource"),
            Self::Closed => write!(f, "closed"),
            Self::Other => write!(f, "other"),
        }
    }
}
