//! Base image synthesis from the host system.
//!
//! A base image is assembled by copying a fixed set of host system paths
//! and the dyld shared caches into a fresh tree, laying down the handful
//! of directories and links a chroot needs, and optionally bootstrapping
//! Homebrew inside a chroot session. The result is packed like any other
//! image tar.

use std::ffi::OsStr;
use std::fs;
use std::path::Path;

use chmo_common::{ChmoError, ChmoResult};
use chmo_image::{ImageStore, tar, tree_size, format_size};

use crate::chroot::ChrootSession;

/// Host paths copied into every base image.
const SYSTEM_IMAGE_PATHS: &[&str] = &[
    "/bin",
    "/sbin",
    "/usr/lib",
    "/usr/bin",
    "/usr/sbin",
    "/usr/share",
    "/usr/libexec",
    "/etc/pam.d",
    "/etc/ssl",
    "/etc/sudoers",
    "/var/db/timezone",
    "/System/Library/CoreServices/SystemVersion.plist",
    "/System/Library/CoreServices/SystemVersionCompat.plist",
    "/System/Library/Frameworks",
    "/System/Library/Perl",
    "/Library/Developer/CommandLineTools",
    "/usr/libexec/rosetta",
    "/Library/Apple/usr/libexec/oah",
];

/// Where macOS keeps the dyld shared caches the linker maps at runtime.
const DYLD_CACHE_GLOB: &str =
    "/System/Volumes/Preboot/Cryptexes/OS/System/Library/dyld/dyld_shared_cache_*";

const BREW_INSTALL_CMD: &str =
    r#"bash -c "$(curl -fsSL https://raw.githubusercontent.com/Homebrew/install/HEAD/install.sh)""#;

/// Flags for `image create`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CreateOptions {
    /// Rebuild even when the tree already exists.
    pub recreate: bool,
    /// Do not pack the tree into a tar.
    pub no_tar: bool,
    /// Keep the tree unpacked.
    pub no_remove: bool,
    /// Skip the Homebrew bootstrap.
    pub no_brew: bool,
}

/// Synthesise a base image from the host system.
///
/// # Errors
///
/// Propagates copy, chroot and packing failures.
pub async fn create_system_image(
    store: &ImageStore,
    tag: &str,
    options: CreateOptions,
) -> ChmoResult<()> {
    let mount = store.mount_path(tag);
    if mount.exists() && !options.recreate {
        tracing::warn!(tag, "Image already created, skipping; use --recreate to rebuild");
        return Ok(());
    }

    tracing::info!(tag, "Creating base image");
    copy_dyld_caches(&mount).await?;
    copy_system_paths(&mount).await?;
    create_system_stuff(store, &mount)?;
    if !options.no_brew {
        install_brew(store, tag).await?;
    }
    if !options.no_tar {
        let tar_path = store.tar_path(tag);
        tar::pack(&mount, &tar_path)?;
        tracing::info!(size = %format_size(fs::metadata(&tar_path)?.len()), "Image tar created");
    }
    if !options.no_remove {
        store.remove(&mount)?;
    }
    Ok(())
}

/// Copy the dyld shared caches; without them nothing dynamically linked
/// runs inside the chroot.
async fn copy_dyld_caches(mount: &Path) -> ChmoResult<()> {
    let target = mount.join("System/Library/dyld");
    fs::create_dir_all(&target)?;

    let pattern = glob::glob(DYLD_CACHE_GLOB).map_err(|err| ChmoError::Internal {
        message: format!("bad dyld glob: {err}"),
    })?;
    for cache in pattern.flatten() {
        tracing::info!(cache = %cache.display(), "Copying dyld shared cache");
        copy_with_metadata(&cache, &target).await?;
    }
    Ok(())
}

async fn copy_system_paths(mount: &Path) -> ChmoResult<()> {
    for path in SYSTEM_IMAGE_PATHS {
        let target = mount.join(path.trim_start_matches('/'));
        let target_dir = target.parent().ok_or_else(|| ChmoError::Internal {
            message: format!("system path {path} has no parent"),
        })?;
        tracing::info!(path, "Copying host path");
        fs::create_dir_all(target_dir)?;
        copy_with_metadata(path, target_dir).await?;
    }
    Ok(())
}

/// The skeleton every image needs beyond the copied system paths.
fn create_system_stuff(store: &ImageStore, mount: &Path) -> ChmoResult<()> {
    fs::create_dir_all(mount.join("root"))?;
    fs::create_dir_all(mount.join("var/run"))?;
    fs::create_dir_all(mount.join("dev"))?;
    fs::create_dir_all(mount.join("private/tmp"))?;
    let tmp = mount.join("tmp");
    if tmp.exists() {
        store.remove(&tmp)?;
    }
    std::os::unix::fs::symlink("/private/tmp", &tmp)?;
    fs::write(mount.join(".dockerenv"), b"")?;
    Ok(())
}

async fn install_brew(store: &ImageStore, tag: &str) -> ChmoResult<()> {
    tracing::info!(tag, "Installing Homebrew into image");
    let mut session = ChrootSession::new(store, tag)?;
    session.prepare().await?;
    let outcome = session.exec(BREW_INSTALL_CMD, false, &[]).await;
    session.teardown();
    outcome
}

/// Copy preserving macOS metadata. Apple's `cp -af` understands resource
/// forks and flags the standard library cannot carry.
async fn copy_with_metadata(source: impl AsRef<OsStr>, target: &Path) -> ChmoResult<()> {
    let source = source.as_ref();
    let status = tokio::process::Command::new("cp")
        .arg("-af")
        .arg(source)
        .arg(target)
        .status()
        .await?;
    if !status.success() {
        return Err(ChmoError::CommandFailed {
            command: format!("cp -af {} {}", source.to_string_lossy(), target.display()),
            code: status.code().unwrap_or(-1),
        });
    }
    Ok(())
}

/// Print the store contents: tar artifacts, then unpacked trees.
///
/// # Errors
///
/// Returns an error if a store directory cannot be read.
pub fn list_images(store: &ImageStore) -> ChmoResult<()> {
    println!("Images (as .tar):");
    for (n, name) in store.list_tars()?.iter().enumerate() {
        let size = tree_size(&store.paths().images().join(name));
        println!("{} {} ({})", n + 1, name, format_size(size));
    }
    println!();
    println!("Images (mounted):");
    for (n, name) in store.list_mounts()?.iter().enumerate() {
        println!("{} {}", n + 1, name);
    }
    Ok(())
}
