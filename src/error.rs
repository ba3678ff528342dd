//! Error types for `skipshard`.
//!
//! One unified error type for every operation a shard exposes, in the
//! teacher's `[CODE-NNN] message` style so errors read the same whether
//! they bubble up from a single shard or a tree of them.

use thiserror::Error;

/// Result type alias for `skipshard` operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in shard operations.
///
/// Each variant carries a stable error code (`SKSH-NNN`) for log
/// correlation, in addition to a human-readable message.
#[derive(Error, Debug)]
pub enum Error {
    /// Underlying mmap/remap/msync/rename/remove syscall failed (SKSH-001).
    #[error("[SKSH-001] IO error: {0}")]
    Io(#[from] std::io::Error),

    /// File presence on load was inconsistent, or a scan found a broken
    /// invariant (SKSH-002).
    #[error("[SKSH-002] corrupt shard at '{0}': {1}")]
    CorruptShard(String, String),

    /// `put` was called with a key longer than `max_key_len` (SKSH-003).
    #[error("[SKSH-003] key length {len} exceeds max_key_len {max}")]
    KeyTooLong {
        /// Length of the offending key.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// `get` found no entry for the key. Never treated as a structural
    /// failure — callers match on it explicitly (SKSH-004).
    #[error("[SKSH-004] key not found")]
    KeyNotFound,

    /// A structural mutation was requested in a state that forbids it,
    /// e.g. capacity exhausted on a shard that is neither `Normal` nor a
    /// split child (SKSH-005).
    #[error("[SKSH-005] invalid state for operation: {0}")]
    InvalidState(String),

    /// The background splitter could not create a child shard. Parked on
    /// the parent and surfaced to the next foreground caller (SKSH-006).
    #[error("[SKSH-006] splitter error: {0}")]
    Splitter(String),

    /// The configured Router rejected or failed a split notification
    /// (SKSH-007).
    #[error("[SKSH-007] router error: {0}")]
    Router(String),

    /// Configuration could not be loaded or failed validation (SKSH-008).
    #[error("[SKSH-008] configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Returns the stable error code (e.g. `"SKSH-001"`).
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Io(_) => "SKSH-001",
            Self::CorruptShard(..) => "SKSH-002",
            Self::KeyTooLong { .. } => "SKSH-003",
            Self::KeyNotFound => "SKSH-004",
            Self::InvalidState(_) => "SKSH-005",
            Self::Splitter(_) => "SKSH-006",
            Self::Router(_) => "SKSH-007",
            Self::Config(_) => "SKSH-008",
        }
    }

    /// Returns true if a retry (e.g. reopen) could plausibly resolve this
    /// error. Corruption is never recoverable in-process.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !matches!(self, Self::CorruptShard(..))
    }
}

impl From<crate::config::ConfigError> for Error {
    fn from(err: crate::config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_and_unique() {
        let errors: Vec<Error> = vec![
            Error::Io(std::io::Error::other("x")),
            Error::CorruptShard("p".into(), "bad".into()),
            Error::KeyTooLong { len: 10, max: 4 },
            Error::KeyNotFound,
            Error::InvalidState("x".into()),
            Error::Splitter("x".into()),
            Error::Router("x".into()),
            Error::Config("x".into()),
        ];
        let codes: std::collections::HashSet<_> = errors.iter().map(Error::code).collect();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn key_not_found_is_recoverable_and_not_structural() {
        assert!(Error::KeyNotFound.is_recoverable());
    }

    #[test]
    fn corrupt_shard_is_not_recoverable() {
        assert!(!Error::CorruptShard("p".into(), "bad".into()).is_recoverable());
    }
}
