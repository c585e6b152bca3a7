//! Stage cache index.
//!
//! A single JSON object at `<store>/index.json` mapping tags to the stage
//! hash their tar was built from. Entries are consulted by the build
//! driver to decide whether a named or final stage can be reused.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use chmo_common::{ChmoError, ChmoPaths, ChmoResult};
use serde::{Deserialize, Serialize};

/// One cache record: a tag and the stage hash behind it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// The tag, equal to this entry's key in the index.
    pub tag: String,
    /// Hex SHA-256 of the stage that produced the tar.
    pub hash: String,
}

/// Persistent tag → hash mapping.
///
/// The process assumes exclusive access to the index for the duration of
/// an invocation. Every write goes to a sibling tempfile and is renamed
/// over the index, so the file is never observed truncated.
#[derive(Debug)]
pub struct BuildCache {
    path: PathBuf,
    entries: BTreeMap<String, IndexEntry>,
}

impl BuildCache {
    /// Open the index, creating an empty one on first start.
    ///
    /// # Errors
    ///
    /// [`ChmoError::IndexCorrupt`] if the file exists but does not parse
    /// as a JSON object; I/O errors otherwise.
    pub fn open(paths: &ChmoPaths) -> ChmoResult<Self> {
        let path = paths.index_file();
        let entries = match fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => BTreeMap::new(),
            Ok(text) => {
                serde_json::from_str(&text).map_err(|err| ChmoError::IndexCorrupt {
                    path: path.display().to_string(),
                    message: err.to_string(),
                })?
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };

        let cache = Self { path, entries };
        if !cache.path.exists() {
            cache.persist()?;
        }
        Ok(cache)
    }

    /// Look up a tag.
    #[must_use]
    pub fn get(&self, tag: &str) -> Option<&IndexEntry> {
        self.entries.get(tag)
    }

    /// Set-or-overwrite a tag and persist.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be written.
    pub fn put(&mut self, tag: &str, hash: &str) -> ChmoResult<()> {
        tracing::info!(tag, hash, "Recording cache entry");
        self.entries.insert(
            tag.to_string(),
            IndexEntry {
                tag: tag.to_string(),
                hash: hash.to_string(),
            },
        );
        self.persist()
    }

    /// Number of recorded entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn persist(&self) -> ChmoResult<()> {
        let text = serde_json::to_string(&self.entries)?;
        let dir = self.path.parent().ok_or_else(|| ChmoError::Internal {
            message: format!("index path {} has no parent", self.path.display()),
        })?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(text.as_bytes())?;
        tmp.persist(&self.path).map_err(|err| err.error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn paths() -> (tempfile::TempDir, ChmoPaths) {
        let temp = tempdir().unwrap();
        let paths = ChmoPaths::with_root(temp.path());
        paths.create_dirs().unwrap();
        (temp, paths)
    }

    #[test]
    fn first_open_creates_an_empty_object() {
        let (_temp, paths) = paths();
        let cache = BuildCache::open(&paths).unwrap();
        assert!(cache.is_empty());
        assert_eq!(fs::read_to_string(paths.index_file()).unwrap(), "{}");
    }

    #[test]
    fn put_get_and_overwrite() {
        let (_temp, paths) = paths();
        let mut cache = BuildCache::open(&paths).unwrap();

        cache.put("app", "aaa").unwrap();
        assert_eq!(cache.get("app").unwrap().hash, "aaa");
        assert_eq!(cache.get("app").unwrap().tag, "app");

        cache.put("app", "bbb").unwrap();
        assert_eq!(cache.get("app").unwrap().hash, "bbb");
        assert_eq!(cache.len(), 1);
        assert!(cache.get("other").is_none());
    }

    #[test]
    fn entries_survive_reopen() {
        let (_temp, paths) = paths();
        {
            let mut cache = BuildCache::open(&paths).unwrap();
            cache.put("app", "aaa").unwrap();
        }
        let cache = BuildCache::open(&paths).unwrap();
        assert_eq!(cache.get("app").unwrap().hash, "aaa");
    }

    #[test]
    fn rewrites_are_byte_deterministic() {
        let (_temp, paths) = paths();
        let mut cache = BuildCache::open(&paths).unwrap();
        cache.put("b", "2").unwrap();
        cache.put("a", "1").unwrap();
        let first = fs::read(paths.index_file()).unwrap();

        cache.put("a", "1").unwrap();
        let second = fs::read(paths.index_file()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn corrupt_index_fails_fast() {
        let (_temp, paths) = paths();
        fs::write(paths.index_file(), "{not json").unwrap();
        assert!(matches!(
            BuildCache::open(&paths).unwrap_err(),
            ChmoError::IndexCorrupt { .. }
        ));
    }

    #[test]
    fn empty_file_is_an_empty_index() {
        let (_temp, paths) = paths();
        fs::write(paths.index_file(), "").unwrap();
        let cache = BuildCache::open(&paths).unwrap();
        assert!(cache.is_empty());
    }
}
