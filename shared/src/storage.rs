// Durable Storage Module
// Named-blob interface to the non-volatile store. Each typed store built on it
// owns its own mutex and opens, operates and closes within a single call.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// Storage error types
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    Backend(String),
    Corrupt { blob: String, reason: String },
    LockPoisoned(&'static str),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Backend(msg) => write!(f, "Storage backend error: {}", msg),
            StoreError::Corrupt { blob, reason } => {
                write!(f, "Corrupt blob '{}': {}", blob, reason)
            }
            StoreError::LockPoisoned(store) => write!(f, "{} lock poisoned", store),
        }
    }
}

impl std::error::Error for StoreError {}

pub type StoreResult<T> = Result<T, StoreError>;

/// Opaque named byte records in non-volatile memory
pub trait BlobStore: Send + Sync {
    /// Whole blob, or None when it has never been written
    fn read(&self, name: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Replace the blob atomically
    fn write(&self, name: &str, data: &[u8]) -> StoreResult<()>;

    /// Extend the blob, creating it when missing
    fn append(&self, name: &str, data: &[u8]) -> StoreResult<()>;

    /// Byte length, 0 when the blob does not exist
    fn size(&self, name: &str) -> StoreResult<usize>;

    /// Delete the blob; deleting a missing blob succeeds
    fn remove(&self, name: &str) -> StoreResult<()>;
}

pub type SharedBlobStore = Arc<dyn BlobStore>;

/// Take a store's mutex, mapping poisoning onto a store error
pub(crate) fn lock_store<'a>(
    lock: &'a Mutex<()>,
    store: &'static str,
) -> StoreResult<MutexGuard<'a, ()>> {
    lock.lock().map_err(|_| StoreError::LockPoisoned(store))
}
