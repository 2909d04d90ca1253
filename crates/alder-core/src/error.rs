//! Error types for alder configuration and record validation.

use thiserror::Error;

/// Errors raised while parsing connection configuration.
///
/// All of these are fatal at startup: the daemon refuses to run with a
/// DSN it cannot fully understand.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The DSN does not use the expected URL scheme.
    #[error("DSN must start with {expected}: got '{dsn}'")]
    InvalidScheme {
        /// Expected scheme prefix, e.g. `etcd://`.
        expected: String,
        /// The offending DSN (credentials never echoed; caller redacts).
        dsn: String,
    },

    /// The DSN host part is empty or contains an empty endpoint.
    #[error("DSN contains no usable endpoints")]
    MissingEndpoints,

    /// A query parameter holds a duration that cannot be parsed.
    #[error("invalid duration for '{param}': '{value}'")]
    InvalidDuration {
        /// Name of the query parameter.
        param: String,
        /// The unparseable value.
        value: String,
    },

    /// The DSN is not a well-formed URL.
    #[error("failed to parse DSN: {reason}")]
    Unparseable {
        /// Parser error description.
        reason: String,
    },
}

/// Errors raised by record validation before persistence.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    /// Keys are opaque but must be non-empty.
    #[error("record key must not be empty")]
    EmptyKey,

    /// Revision must be the pending sentinel or a positive etcd revision.
    #[error("revision {revision} is reserved: expected -1 or a positive revision")]
    ReservedRevision {
        /// The invalid revision value.
        revision: i64,
    },

    /// A tombstone row must not carry value bytes.
    #[error("tombstone for key '{key}' carries a value")]
    TombstoneWithValue {
        /// The offending key.
        key: String,
    },
}
