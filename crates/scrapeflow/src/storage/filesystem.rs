use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::{validate_key, ObjectStore, StoredObject};
use crate::error::StorageError;

const METADATA_SUFFIX: &str = ".metadata.json";

/// Copies `src` to `dst` through a temporary sibling and renames it into
/// place, so readers never see a half-written object.
fn copy_atomically(src: &Path, dst: &Path) -> Result<u64, StorageError> {
    let partial = dst.with_extension("partial");
    let size = std::fs::copy(src, &partial).map_err(|e| StorageError::CopyFile {
        from: src.to_path_buf(),
        to: partial.clone(),
        source: e,
    })?;
    std::fs::rename(&partial, dst).map_err(|e| {
        let _ = std::fs::remove_file(&partial);
        StorageError::CopyFile {
            from: partial.clone(),
            to: dst.to_path_buf(),
            source: e,
        }
    })?;
    Ok(size)
}

/// Object store backed by a directory: `{root}/{bucket}/{key}` plus a
/// `{key}.metadata.json` sidecar holding the metadata map.
pub struct FsObjectStore {
    bucket_directory: PathBuf,
}

impl FsObjectStore {
    pub fn new<P: AsRef<Path>>(root: P, bucket: &str) -> Self {
        Self {
            bucket_directory: root.as_ref().join(bucket),
        }
    }

    pub fn bucket_directory(&self) -> &Path {
        &self.bucket_directory
    }

    pub fn object_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.bucket_directory.join(key))
    }

    /// Reads back the metadata stored with `key`.
    pub fn metadata(&self, key: &str) -> Result<Option<BTreeMap<String, String>>, StorageError> {
        let path = sidecar_path(&self.object_path(key)?);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::WriteFile { path, source: e }),
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| StorageError::Upload {
                key: key.to_string(),
                reason: format!("unreadable metadata: {}", e),
            })
    }

    fn ensure_directory(&self, path: &Path) -> Result<(), StorageError> {
        if !path.exists() {
            std::fs::create_dir_all(path).map_err(|e| StorageError::CreateDirectory {
                path: path.to_path_buf(),
                source: e,
            })?;
        }
        Ok(())
    }
}

impl ObjectStore for FsObjectStore {
    fn put(
        &self,
        key: &str,
        source: &Path,
        metadata: &BTreeMap<String, String>,
    ) -> Result<StoredObject, StorageError> {
        let destination = self.object_path(key)?;
        if let Some(parent) = destination.parent() {
            self.ensure_directory(parent)?;
        }

        let size = copy_atomically(source, &destination)?;

        let sidecar = sidecar_path(&destination);
        let encoded = serde_json::to_vec_pretty(metadata).map_err(|e| StorageError::Upload {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        std::fs::write(&sidecar, encoded).map_err(|e| StorageError::WriteFile {
            path: sidecar.clone(),
            source: e,
        })?;

        log::info!("Stored object {} ({} bytes)", key, size);

        Ok(StoredObject {
            key: key.to_string(),
            size,
            location: destination.display().to_string(),
        })
    }

    fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.object_path(key)?.is_file())
    }
}

fn sidecar_path(object: &Path) -> PathBuf {
    let mut name = object.as_os_str().to_os_string();
    name.push(METADATA_SUFFIX);
    PathBuf::from(name)
}
