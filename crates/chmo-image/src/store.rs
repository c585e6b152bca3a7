//! Image store.

use std::fs;
use std::path::{Path, PathBuf};

use chmo_common::{ChmoPaths, ChmoResult};

/// Local image store.
///
/// Owns the on-disk layout: tar artifacts under `images/`, unpacked trees
/// under `images_mount/`. Keys are either stage hashes or user tags.
pub struct ImageStore {
    /// Store layout.
    paths: ChmoPaths,
}

impl ImageStore {
    /// Create a store over the given layout.
    #[must_use]
    pub fn new(paths: ChmoPaths) -> Self {
        Self { paths }
    }

    /// The store layout.
    #[must_use]
    pub fn paths(&self) -> &ChmoPaths {
        &self.paths
    }

    /// Tar artifact path for a key.
    #[must_use]
    pub fn tar_path(&self, key: &str) -> PathBuf {
        self.paths.tar(key)
    }

    /// Unpacked tree path for a key.
    #[must_use]
    pub fn mount_path(&self, key: &str) -> PathBuf {
        self.paths.mount(key)
    }

    /// Whether a tar artifact exists for the key.
    #[must_use]
    pub fn exists_tar(&self, key: &str) -> bool {
        self.tar_path(key).exists()
    }

    /// Whether an unpacked tree exists for the key.
    #[must_use]
    pub fn exists_mount(&self, key: &str) -> bool {
        self.mount_path(key).exists()
    }

    /// Remove a path, whatever it is.
    ///
    /// Handles symlinks, regular files and directories uniformly. Callers
    /// check existence first.
    ///
    /// # Errors
    ///
    /// Returns an error if the target cannot be inspected or removed.
    pub fn remove(&self, path: &Path) -> ChmoResult<()> {
        tracing::info!(path = %path.display(), "Removing");
        let meta = fs::symlink_metadata(path)?;
        if meta.file_type().is_symlink() || meta.is_file() {
            fs::remove_file(path)?;
        } else {
            fs::remove_dir_all(path)?;
        }
        Ok(())
    }

    /// Copy the tar artifact of one key to another (promotion).
    ///
    /// # Errors
    ///
    /// Returns an error if the source is missing or the copy fails.
    pub fn copy_tar(&self, source_key: &str, dest_key: &str) -> ChmoResult<()> {
        let source = self.tar_path(source_key);
        let dest = self.tar_path(dest_key);
        tracing::info!(from = %source.display(), to = %dest.display(), "Copying image tar");
        fs::copy(&source, &dest)?;
        tracing::info!(size = %format_size(fs::metadata(&dest)?.len()), "Image tar copied");
        Ok(())
    }

    /// Sorted file names of all tar artifacts in the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the images directory cannot be read.
    pub fn list_tars(&self) -> ChmoResult<Vec<String>> {
        list_dir(&self.paths.images())
    }

    /// Sorted names of all unpacked trees in the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the mounts directory cannot be read.
    pub fn list_mounts(&self) -> ChmoResult<Vec<String>> {
        list_dir(&self.paths.mounts())
    }
}

fn list_dir(dir: &Path) -> ChmoResult<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        names.push(entry?.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

/// Total size in bytes of a file or directory tree.
#[must_use]
pub fn tree_size(path: &Path) -> u64 {
    if path.is_file() {
        return fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    }

    let mut total = 0;
    for entry in walkdir::WalkDir::new(path).into_iter().flatten() {
        if entry.file_type().is_file() {
            if let Ok(meta) = entry.metadata() {
                total += meta.len();
            }
        }
    }
    total
}

/// Format a byte count as a human-readable string.
#[must_use]
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}
