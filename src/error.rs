//! Ledger-level error type.

use thiserror::Error;

/// Failure surfaced by the release ledger.
///
/// Every rusqlite error is wrapped with the operation that produced it so
/// operator logs point at the failing statement rather than a bare driver
/// message.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("release ledger: {0}")]
    Storage(String),
}

impl StoreError {
    pub(crate) fn storage(op: &str, err: impl std::fmt::Display) -> Self {
        StoreError::Storage(format!("{}: {}", op, err))
    }

    pub(crate) fn poisoned() -> Self {
        StoreError::Storage("connection lock poisoned".to_string())
    }
}
