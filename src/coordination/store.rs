//! Shared key-value store contract consumed by the coordination layer.
//!
//! Implementations must make [`SharedStore::set_if_absent`] atomic; lease
//! exclusivity and message deduplication are only as strong as that
//! guarantee.

use async_trait::async_trait;
use thiserror::Error;

/// Errors returned by a [`SharedStore`].
///
/// [`StoreError::Unavailable`] is the connectivity class: it is absorbed by
/// the failover guard and never surfaces past it.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The backend could not be reached (I/O, timeout, dropped connection).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The backend answered but rejected or failed the command.
    #[error("store command failed: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Read a key.  `Ok(None)` means absent, which is not an error.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Unconditionally write a key.
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Write a key only if it does not exist.  Returns `true` if this call
    /// created the key.
    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, StoreError>;

    /// Delete a key.  Deleting an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}
