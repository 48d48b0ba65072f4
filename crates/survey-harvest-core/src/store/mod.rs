//! Persistence abstraction for the harvest engine.
//!
//! The [`ObjectStore`] trait is the only way the engine touches durable
//! storage: landed payloads, metadata, quarantine, the record ledger and
//! checkpoints all go through it. Paths are `/`-separated and relative to
//! the store root.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use async_trait::async_trait;

use crate::error::StoreError;

/// Abstract byte store.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`write_bytes`](ObjectStore::write_bytes) | Create or replace an object atomically |
/// | [`read_bytes`](ObjectStore::read_bytes) | Read an object, `NotFound` if missing |
/// | [`exists`](ObjectStore::exists) | Presence check |
/// | [`append_bytes`](ObjectStore::append_bytes) | Append to a log object |
/// | [`list`](ObjectStore::list) | Object paths under a prefix |
/// | [`rename`](ObjectStore::rename) | Move an object |
/// | [`remove`](ObjectStore::remove) | Delete an object if present |
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn write_bytes(&self, path: &str, bytes: &[u8]) -> Result<(), StoreError>;

    async fn read_bytes(&self, path: &str) -> Result<Vec<u8>, StoreError>;

    async fn exists(&self, path: &str) -> Result<bool, StoreError>;

    async fn append_bytes(&self, path: &str, bytes: &[u8]) -> Result<(), StoreError>;

    /// Paths of all objects whose path starts with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    async fn rename(&self, from: &str, to: &str) -> Result<(), StoreError>;

    async fn remove(&self, path: &str) -> Result<(), StoreError>;
}

/// Reject absolute paths and parent traversal.
pub fn check_path(path: &str) -> Result<(), StoreError> {
    let bad = path.is_empty()
        || path.starts_with('/')
        || path.contains('\\')
        || path.split('/').any(|seg| seg.is_empty() || seg == "..");
    if bad {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_path() {
        assert!(check_path("raw/2024/01/a.csv").is_ok());
        assert!(check_path("/etc/passwd").is_err());
        assert!(check_path("raw/../../x").is_err());
        assert!(check_path("raw//x").is_err());
        assert!(check_path("").is_err());
    }
}
