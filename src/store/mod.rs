//! Storage contract used by the protocol engine.
//!
//! Any backend implementing [`Store`] can sit behind the TCP front end.
//! Keys and values are opaque byte strings. Every operation reports a
//! [`Status`] instead of panicking, and backend error messages may be shown
//! to clients verbatim.

pub mod memory;

pub use memory::{MemoryStore, StoreConfig};

use bytes::Bytes;
use std::fmt;
use std::sync::MutexGuard;

/// Outcome of a store operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status<T = ()> {
    /// The operation succeeded.
    Ok(T),
    /// The key does not exist (only meaningful for get and delete).
    NotFound,
    /// The backend failed; the message is safe to show to clients.
    Error(String),
}

impl Status {
    pub const OK: Status = Status::Ok(());
}

#[cfg(test)]
impl<T> Status<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Status::NotFound)
    }

    /// Error message, if the operation failed.
    pub fn message(&self) -> Option<&str> {
        match self {
            Status::Error(msg) => Some(msg),
            _ => None,
        }
    }
}

impl<T> fmt::Display for Status<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Ok(_) => write!(f, "ok"),
            Status::NotFound => write!(f, "not found"),
            Status::Error(msg) => write!(f, "{msg}"),
        }
    }
}

/// Holds the store-wide lock. Dropping it (or calling [`StoreLock::unlock`])
/// releases the lock, so every exit path unlocks.
#[must_use = "the store lock is released as soon as the guard is dropped"]
pub struct StoreLock<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl<'a> StoreLock<'a> {
    pub fn new(guard: MutexGuard<'a, ()>) -> Self {
        Self { _guard: guard }
    }

    /// Release the lock explicitly.
    pub fn unlock(self) {}
}

/// Key-value backend consumed by the protocol engine.
pub trait Store: Send + Sync {
    /// Fetch the value stored under `key`.
    fn get(&self, key: &[u8]) -> Status<Bytes>;

    /// Store `value` under `key`, replacing any previous value.
    fn put(&self, key: &[u8], value: Bytes) -> Status;

    /// Remove `key`.
    fn delete(&self, key: &[u8]) -> Status;

    /// Acquire the single store-wide lock.
    ///
    /// This is not per key: callers use it to make a short check-then-set
    /// sequence atomic against every other lock holder.
    fn lock(&self) -> StoreLock<'_>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_helpers() {
        assert!(Status::OK.is_ok());
        assert!(Status::<Bytes>::NotFound.is_not_found());

        let err: Status = Status::Error("disk full".to_string());
        assert!(!err.is_ok());
        assert_eq!(err.message(), Some("disk full"));
        assert_eq!(err.to_string(), "disk full");
        assert_eq!(Status::OK.message(), None);
    }
}
