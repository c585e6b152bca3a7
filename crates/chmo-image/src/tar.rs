//! Tar packing and extraction for image roots.
//!
//! Artifacts are plain POSIX tars whose root members are the immediate
//! children of the image root, so extracting one into an empty directory
//! reproduces the tree without a wrapping top-level directory.

use std::fs::File;
use std::path::{Component, Path};

use chmo_common::{ChmoError, ChmoResult};

/// Pack a directory tree into a tar archive.
///
/// Each immediate child of `source_dir` is added recursively under its own
/// name. Mode, ownership, mtime and symlink metadata are preserved.
///
/// # Errors
///
/// Returns an error if the source cannot be read or the archive cannot be
/// written.
pub fn pack(source_dir: &Path, tar_path: &Path) -> ChmoResult<()> {
    tracing::info!(tar = %tar_path.display(), "Creating tar archive");

    let file = File::create(tar_path)?;
    let mut builder = tar::Builder::new(file);
    builder.follow_symlinks(false);

    for entry in std::fs::read_dir(source_dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();
        if path.is_dir() && !path.is_symlink() {
            builder.append_dir_all(&name, &path)?;
        } else {
            builder.append_path_with_name(&path, &name)?;
        }
    }

    builder.finish()?;
    Ok(())
}

/// Extract a tar archive into a directory.
///
/// With a non-empty `prefix`, only members whose name starts with it are
/// extracted; selecting no members is an [`ChmoError::EmptyFilter`] error.
/// Members with absolute paths or `..` components are rejected as
/// [`ChmoError::UnsafeArchive`] before anything is unpacked from them.
///
/// # Errors
///
/// Returns [`ChmoError::BaseImageMissing`] if the archive does not exist,
/// plus the filter and safety errors above.
pub fn extract(tar_path: &Path, dest_dir: &Path, prefix: Option<&str>) -> ChmoResult<()> {
    if !tar_path.exists() {
        return Err(ChmoError::BaseImageMissing {
            reference: tar_path.display().to_string(),
        });
    }

    let prefix = prefix.filter(|p| !p.is_empty());
    tracing::info!(tar = %tar_path.display(), dest = %dest_dir.display(), ?prefix, "Extracting");

    std::fs::create_dir_all(dest_dir)?;

    let file = File::open(tar_path)?;
    let mut archive = tar::Archive::new(file);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_unpack_xattrs(true);

    let mut matched = 0usize;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        ensure_member_safe(&name)?;
        if let Some(p) = prefix {
            if !name.starts_with(p) {
                continue;
            }
        }
        matched += 1;
        entry.unpack_in(dest_dir)?;
    }

    if matched == 0 {
        if let Some(p) = prefix {
            return Err(ChmoError::EmptyFilter {
                prefix: p.to_string(),
            });
        }
    }
    Ok(())
}

/// Whether a file parses as a tar archive with at least one entry.
#[must_use]
pub fn is_tar_file(path: &Path) -> bool {
    let Ok(file) = File::open(path) else {
        return false;
    };
    let mut archive = tar::Archive::new(file);
    match archive.entries() {
        Ok(mut entries) => matches!(entries.next(), Some(Ok(_))),
        Err(_) => false,
    }
}

fn ensure_member_safe(name: &str) -> ChmoResult<()> {
    let path = Path::new(name);
    let escapes = path.is_absolute()
        || path
            .components()
            .any(|c| matches!(c, Component::ParentDir));
    if escapes {
        return Err(ChmoError::UnsafeArchive {
            member: name.to_string(),
        });
    }
    Ok(())
}
