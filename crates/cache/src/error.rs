//! Error types for the cache crate

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Error type for cache operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// A key-derivation input cannot be digested
    #[error("Invalid cache parameter `{name}`: {reason}")]
    #[diagnostic(
        code(cohorts::cache::invalid_parameter),
        help("Parameters must be strings, integers, finite floats, booleans, lists or maps")
    )]
    InvalidParameter {
        /// Name (or dotted path) of the offending input
        name: String,
        /// Why the input was rejected
        reason: String,
    },

    /// No entry is stored for the key
    #[error("Cache miss: {key}")]
    #[diagnostic(
        code(cohorts::cache::miss),
        help("Compute the value and store it with `put`")
    )]
    CacheMiss {
        /// The cache key that was not found
        key: String,
    },

    /// An entry exists but cannot be read back
    #[error("Corrupt cache entry {}: {reason}", path.display())]
    #[diagnostic(
        code(cohorts::cache::corrupt_entry),
        help("Treat the entry as missing and recompute it, or delete it")
    )]
    CorruptEntry {
        /// Path of the unreadable entry file
        path: Box<Path>,
        /// What was wrong with it
        reason: String,
    },

    /// I/O error during cache operations
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(cohorts::cache::io),
        help("Check file permissions and ensure the path exists")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "read", "write", "rename")
        operation: String,
    },

    /// Configuration or validation error
    #[error("Cache configuration error: {message}")]
    #[diagnostic(code(cohorts::cache::config))]
    Configuration {
        /// Error message describing the configuration issue
        message: String,
    },

    /// Serialization error
    #[error("Serialization error: {message}")]
    #[diagnostic(code(cohorts::cache::serialization))]
    Serialization {
        /// Error message describing the serialization issue
        message: String,
    },

    /// A caller-supplied computation failed for one patient
    #[error("Computation `{computation}` failed for patient {patient_id}: {message}")]
    #[diagnostic(code(cohorts::cache::computation))]
    Computation {
        /// Name of the computation
        computation: String,
        /// Patient the computation ran for
        patient_id: String,
        /// Rendered error from the computation
        message: String,
    },
}

impl Error {
    /// Create an invalid parameter error
    #[must_use]
    pub fn invalid_parameter(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a cache miss error
    #[must_use]
    pub fn cache_miss(key: impl Into<String>) -> Self {
        Self::CacheMiss { key: key.into() }
    }

    /// Create a corrupt entry error
    #[must_use]
    pub fn corrupt(path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        Self::CorruptEntry {
            path: path.as_ref().into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create a serialization error
    #[must_use]
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a computation error
    #[must_use]
    pub fn computation(
        computation: impl Into<String>,
        patient_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Computation {
            computation: computation.into(),
            patient_id: patient_id.into(),
            message: message.into(),
        }
    }

    /// Whether this error means "nothing usable is cached"
    #[must_use]
    pub const fn is_miss(&self) -> bool {
        matches!(self, Self::CacheMiss { .. })
    }

    /// Whether this error means "an entry exists but is unreadable"
    #[must_use]
    pub const fn is_corrupt(&self) -> bool {
        matches!(self, Self::CorruptEntry { .. })
    }
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, Error>;
