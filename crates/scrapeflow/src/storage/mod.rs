pub mod filesystem;

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::StorageError;

pub use filesystem::FsObjectStore;

/// Where an uploaded object ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    pub size: u64,
    pub location: String,
}

/// Object storage for finished archives. Metadata values are strings only,
/// matching what object stores accept.
pub trait ObjectStore: Send + Sync {
    fn put(
        &self,
        key: &str,
        source: &Path,
        metadata: &BTreeMap<String, String>,
    ) -> Result<StoredObject, StorageError>;

    fn exists(&self, key: &str) -> Result<bool, StorageError>;
}

/// Keys are relative, `/`-separated and never escape the bucket.
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    let invalid = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..");
    if invalid {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("scheduled_scrapes/rust/top/2026-03-01/a.zip").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("/abs/key.zip").is_err());
        assert!(validate_key("a/../b.zip").is_err());
        assert!(validate_key("a//b.zip").is_err());
        assert!(validate_key("a\\b.zip").is_err());
    }
}
