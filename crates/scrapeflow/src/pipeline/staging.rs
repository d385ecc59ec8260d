//! Copies a run's artifacts aside so archiving does not race persistence,
//! which deletes the originals once they are stored.

use std::path::{Path, PathBuf};

use crate::error::StorageError;

/// Directory holding one batch's staged artifacts.
pub fn batch_directory(staging_root: &Path, batch_id: &str) -> PathBuf {
    staging_root.join(batch_id)
}

/// Copies each artifact into `batch_dir`, keeping its path relative to
/// `scrapes_dir` (or just its file name when it lives elsewhere). Returns
/// the staged paths.
pub fn stage_artifacts<'a, I>(
    scrapes_dir: &Path,
    batch_dir: &Path,
    artifacts: I,
) -> Result<Vec<PathBuf>, StorageError>
where
    I: IntoIterator<Item = &'a PathBuf>,
{
    let mut staged = Vec::new();
    for artifact in artifacts {
        let relative = match artifact.strip_prefix(scrapes_dir) {
            Ok(relative) => relative.to_path_buf(),
            Err(_) => match artifact.file_name() {
                Some(name) => PathBuf::from(name),
                None => continue,
            },
        };
        let target = batch_dir.join(relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::CreateDirectory {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        std::fs::copy(artifact, &target).map_err(|e| StorageError::CopyFile {
            from: artifact.clone(),
            to: target.clone(),
            source: e,
        })?;
        staged.push(target);
    }
    Ok(staged)
}
