//! Crash-safe update protocol for repository index directories.
//!
//! The external indexing tools mutate their config/database trees in place
//! and offer no recovery if interrupted. [`ConfigTransaction`] wraps such a
//! mutation: the current tree is snapshotted into a temporary working copy,
//! the tools run against the copy, and on success the copy atomically
//! replaces the original while the pre-transaction tree is archived as a
//! timestamped tarball with bounded retention. On failure the copy is
//! discarded and the original is never observed half-written.
//!
//! The protocol assumes a single writer; the update gate enforces that at
//! the call sites.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::TempDir;
use tracing::{debug, info};

use crate::error::{RepoError, RepoResult};
use crate::fsutil;

/// Number of archived snapshots kept per archive prefix after a commit.
pub const ARCHIVE_KEEP: usize = 30;

fn txio(context: &str, e: impl std::fmt::Display) -> RepoError {
    RepoError::TransactionIo(format!("{}: {}", context, e))
}

/// An open snapshot transaction over one directory tree.
pub struct ConfigTransaction {
    original: PathBuf,
    archive_dir: PathBuf,
    archive_prefix: String,
    // Sibling of the original so the commit rename stays on one filesystem.
    workdir: TempDir,
    work_tree: PathBuf,
}

impl ConfigTransaction {
    /// Snapshot `original` into a fresh working copy.
    ///
    /// The original is created empty first if this is the very first run.
    /// `archive_prefix` names the retention bucket the pre-transaction tree
    /// is archived under on commit (e.g. `deb`, `rpm-stable`).
    pub fn begin(original: &Path, archive_dir: &Path, archive_prefix: &str) -> RepoResult<Self> {
        fsutil::ensure_dir(original)?;
        let parent = original
            .parent()
            .ok_or_else(|| txio("transaction target has no parent", original.display()))?;
        let workdir = tempfile::Builder::new()
            .prefix(".txn-")
            .tempdir_in(parent)
            .map_err(|e| txio("failed to create working copy directory", e))?;
        let work_tree = workdir.path().join("tree");
        fsutil::copy_dir_recursive(original, &work_tree)
            .map_err(|e| txio("failed to snapshot tree", e))?;
        debug!(
            "Opened transaction for {} in {}",
            original.display(),
            work_tree.display()
        );
        Ok(Self {
            original: original.to_path_buf(),
            archive_dir: archive_dir.to_path_buf(),
            archive_prefix: archive_prefix.to_string(),
            workdir,
            work_tree,
        })
    }

    /// The mutable working copy the indexing tools should run against.
    pub fn work_tree(&self) -> &Path {
        &self.work_tree
    }

    /// Archive the pre-transaction tree and move the working copy into
    /// place.
    ///
    /// The rename is the commit point; everything before it leaves the
    /// original untouched.
    pub fn commit(self) -> RepoResult<()> {
        fsutil::ensure_dir(&self.archive_dir)?;
        prune_archives(&self.archive_dir, &self.archive_prefix, ARCHIVE_KEEP - 1)?;

        let stamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
        let archive_path = self
            .archive_dir
            .join(format!("{}-{}.tar.gz", self.archive_prefix, stamp));
        archive_tree(&self.original, &archive_path)?;

        fs::remove_dir_all(&self.original)
            .map_err(|e| txio("failed to remove original tree", e))?;
        fs::rename(&self.work_tree, &self.original)
            .map_err(|e| txio("failed to move working copy into place", e))?;
        info!(
            "Committed {} (archived to {})",
            self.original.display(),
            archive_path.display()
        );
        Ok(())
    }

    /// Discard the working copy, leaving the original and the archive
    /// directory untouched. Removal of the copy is best-effort.
    pub fn rollback(self) {
        info!(
            "Rolling back transaction for {}, discarding {}",
            self.original.display(),
            self.work_tree.display()
        );
        // TempDir drop removes the working copy and ignores errors.
    }
}

/// Write `src` as a gzip tarball at `dest`, rooted at the tree's own name.
fn archive_tree(src: &Path, dest: &Path) -> RepoResult<()> {
    let root = src
        .file_name()
        .ok_or_else(|| txio("archive source has no name", src.display()))?;
    let file = fs::File::create(dest).map_err(|e| txio("failed to create archive", e))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder
        .append_dir_all(root, src)
        .map_err(|e| txio("failed to archive tree", e))?;
    let encoder = builder
        .into_inner()
        .map_err(|e| txio("failed to finish archive", e))?;
    encoder
        .finish()
        .map_err(|e| txio("failed to flush archive", e))?;
    Ok(())
}

/// Delete the oldest `{prefix}-{timestamp}.tar.gz` archives in `dir` until
/// at most `keep` remain. Archive names are timestamped, so name order is
/// age order.
///
/// The marker must be followed by a digit (the timestamp year), so a prefix
/// never claims the archives of a longer sibling prefix such as
/// `rpm-stable` vs `rpm-stable-foo`.
fn prune_archives(dir: &Path, prefix: &str, keep: usize) -> RepoResult<()> {
    let marker = format!("{}-", prefix);
    let mut names: Vec<String> = fs::read_dir(dir)
        .map_err(|e| txio("failed to list archive directory", e))?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| {
            name.strip_prefix(&marker)
                .and_then(|rest| rest.chars().next())
                .map_or(false, |c| c.is_ascii_digit())
                && name.ends_with(".tar.gz")
        })
        .collect();
    if names.len() <= keep {
        return Ok(());
    }
    names.sort();
    let excess = names.len() - keep;
    for name in names.into_iter().take(excess) {
        info!("Pruning old archive {}", name);
        fs::remove_file(dir.join(&name)).map_err(|e| txio("failed to prune archive", e))?;
    }
    Ok(())
}
