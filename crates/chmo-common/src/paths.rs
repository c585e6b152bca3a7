//! Standard filesystem paths for the Chmocker store.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default root directory for Chmocker data.
pub static CHMO_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("CHMO_ROOT").map_or_else(
        |_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/var/root"))
                .join(".chmo")
        },
        PathBuf::from,
    )
});

/// Standard paths used by the Chmocker store.
#[derive(Debug, Clone)]
pub struct ChmoPaths {
    /// Root data directory (default: `~/.chmo`).
    pub root: PathBuf,
}

impl ChmoPaths {
    /// Create paths with the default location.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory for tar artifacts.
    #[must_use]
    pub fn images(&self) -> PathBuf {
        self.root.join("images")
    }

    /// Directory for unpacked image trees.
    #[must_use]
    pub fn mounts(&self) -> PathBuf {
        self.root.join("images_mount")
    }

    /// Tar artifact for a key (stage hash or tag).
    #[must_use]
    pub fn tar(&self, key: &str) -> PathBuf {
        self.images().join(format!("{key}.tar"))
    }

    /// Unpacked tree for a key.
    #[must_use]
    pub fn mount(&self, key: &str) -> PathBuf {
        self.mounts().join(key)
    }

    /// The cache index file.
    #[must_use]
    pub fn index_file(&self) -> PathBuf {
        self.root.join("index.json")
    }

    /// Create all necessary directories.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.images())?;
        std::fs::create_dir_all(self.mounts())?;
        Ok(())
    }
}

impl Default for ChmoPaths {
    fn default() -> Self {
        Self {
            root: CHMO_ROOT.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_root() {
        let paths = ChmoPaths::with_root("/tmp/chmo-test");
        assert_eq!(paths.images(), PathBuf::from("/tmp/chmo-test/images"));
        assert_eq!(paths.mounts(), PathBuf::from("/tmp/chmo-test/images_mount"));
        assert_eq!(paths.index_file(), PathBuf::from("/tmp/chmo-test/index.json"));
    }

    #[test]
    fn tar_and_mount_keys() {
        let paths = ChmoPaths::with_root("/tmp/chmo-test");
        assert_eq!(
            paths.tar("abc123"),
            PathBuf::from("/tmp/chmo-test/images/abc123.tar")
        );
        assert_eq!(
            paths.mount("abc123"),
            PathBuf::from("/tmp/chmo-test/images_mount/abc123")
        );
    }

    #[test]
    fn create_dirs_is_idempotent() {
        let temp = tempfile::tempdir().unwrap();
        let paths = ChmoPaths::with_root(temp.path());
        paths.create_dirs().unwrap();
        paths.create_dirs().unwrap();
        assert!(paths.images().is_dir());
        assert!(paths.mounts().is_dir());
    }
}
