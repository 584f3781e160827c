//! Small filesystem helpers shared by the repository implementations.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{RepoError, RepoResult};

/// Create `path` (and its parents) if it does not exist yet.
///
/// Fails if the path exists but is not a directory.
pub fn ensure_dir(path: &Path) -> RepoResult<()> {
    if !path.exists() {
        fs::create_dir_all(path)?;
    }
    if !path.is_dir() {
        return Err(RepoError::NotADirectory(path.to_path_buf()));
    }
    Ok(())
}

/// Copy `src` into `dst`, skipping the copy when a same-named file of
/// identical byte size is already present.
///
/// When `dst` is a directory the source filename is appended. The size check
/// is a cheap idempotence test, not a content hash; a size change always
/// triggers a re-copy. Returns the final destination path.
pub fn copy_if_not_exists(src: &Path, dst: &Path) -> RepoResult<PathBuf> {
    let mut dst = dst.to_path_buf();
    if dst.is_dir() {
        let name = src
            .file_name()
            .ok_or_else(|| RepoError::NotADirectory(src.to_path_buf()))?;
        dst = dst.join(name);
    }
    if dst.exists() && src.metadata()?.len() == dst.metadata()?.len() {
        debug!("{} already exists with the same size, skipping", dst.display());
        return Ok(dst);
    }
    fs::copy(src, &dst)?;
    Ok(dst)
}

/// Recursively copy the directory tree at `src` to `dst`.
///
/// `dst` must not exist yet; intermediate directories are created. Symlinks
/// are followed, which is fine for the index-database trees this is used on.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> RepoResult<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
