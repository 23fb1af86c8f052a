#![forbid(unsafe_code)]

//! Error types surfaced by the store engine.
//!
//! The engine itself never swallows a failure: user callbacks that panic
//! propagate to whoever triggered them, and the few operations that can fail
//! in a recoverable way report a [`StoreError`] synchronously.

/// Errors reported by store construction and registration calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// `listen_keys` was called with an empty key filter. An empty filter can
    /// never match a change, so this is always a configuration bug.
    EmptyKeyFilter,
    /// A [`Deferred`](crate::runtime::Deferred) was resolved or rejected a
    /// second time. Settlement is permanent; the first outcome wins.
    AlreadySettled,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyKeyFilter => write!(f, "listen_keys requires at least one key"),
            Self::AlreadySettled => write!(f, "deferred has already settled"),
        }
    }
}

impl std::error::Error for StoreError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(
            StoreError::EmptyKeyFilter.to_string(),
            "listen_keys requires at least one key"
        );
        assert_eq!(
            StoreError::AlreadySettled.to_string(),
            "deferred has already settled"
        );
    }
}
