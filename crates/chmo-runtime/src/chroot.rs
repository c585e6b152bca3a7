//! Chroot session lifecycle.
//!
//! A session scopes an unpacked image root as a chroot target. Preparing
//! it hardlinks the host's mDNSResponder socket into the tree (name
//! resolution inside the chroot) and mounts a devfs on `<root>/dev`.
//! Teardown reverses both and runs on every exit path: callers invoke it
//! explicitly, and `Drop` is the backstop when they cannot.

use std::fs;
use std::path::{Path, PathBuf};

use chmo_common::{ChmoError, ChmoResult};
use chmo_image::ImageStore;

/// Host socket consulted for name resolution.
const DNS_SOCKET_HOST: &str = "/var/run/mDNSResponder";
/// Where the socket is linked inside the image root.
const DNS_SOCKET_RELATIVE: &str = "var/run/mDNSResponder";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Constructed,
    Prepared,
    Torn,
}

/// A scoped chroot over one unpacked image root.
#[derive(Debug)]
pub struct ChrootSession {
    reference: String,
    mount_root: PathBuf,
    state: SessionState,
}

impl ChrootSession {
    /// Open a session over the unpacked tree of `reference`.
    ///
    /// # Errors
    ///
    /// [`ChmoError::NotUnpacked`] if no tree exists for the reference.
    pub fn new(store: &ImageStore, reference: &str) -> ChmoResult<Self> {
        let mount_root = store.mount_path(reference);
        if !mount_root.exists() {
            return Err(ChmoError::NotUnpacked {
                reference: reference.to_string(),
            });
        }
        Ok(Self {
            reference: reference.to_string(),
            mount_root,
            state: SessionState::Constructed,
        })
    }

    /// The image root this session chroots into.
    #[must_use]
    pub fn mount_root(&self) -> &Path {
        &self.mount_root
    }

    /// Wire the tree up for execution: DNS socket hardlink, devfs mount.
    ///
    /// # Errors
    ///
    /// Propagates link failures and a non-zero `mount`; a failed mount
    /// tears the partially prepared session back down first.
    pub async fn prepare(&mut self) -> ChmoResult<()> {
        tracing::info!(reference = %self.reference, "Linking host mDNSResponder socket");
        let dns = self.mount_root.join(DNS_SOCKET_RELATIVE);
        if dns.exists() {
            fs::remove_file(&dns)?;
        }
        fs::hard_link(DNS_SOCKET_HOST, &dns)?;
        self.state = SessionState::Prepared;

        tracing::info!(reference = %self.reference, "Mounting devfs");
        let dev = self.mount_root.join("dev");
        let status = tokio::process::Command::new("mount")
            .args(["-t", "devfs", "devfs"])
            .arg(&dev)
            .status()
            .await?;
        if !status.success() {
            self.teardown();
            return Err(ChmoError::CommandFailed {
                command: format!("mount -t devfs devfs {}", dev.display()),
                code: status.code().unwrap_or(-1),
            });
        }
        Ok(())
    }

    /// Run a command inside the chroot.
    ///
    /// The command is handed to `/bin/sh -c` inside
    /// `chroot <root> env -i <fixed envs> <extra envs>`. Host stdio is
    /// inherited. With `interactive`, a non-zero exit is only a warning.
    ///
    /// # Errors
    ///
    /// [`ChmoError::CommandFailed`] on non-interactive non-zero exit;
    /// [`ChmoError::Internal`] when the session is not prepared.
    pub async fn exec(
        &self,
        command: &str,
        interactive: bool,
        extra_envs: &[String],
    ) -> ChmoResult<()> {
        if self.state != SessionState::Prepared {
            return Err(ChmoError::Internal {
                message: "exec called outside a prepared chroot session".to_string(),
            });
        }

        tracing::debug!(command, interactive, "Executing in chroot");
        let status = tokio::process::Command::new("chroot")
            .arg(&self.mount_root)
            .arg("env")
            .arg("-i")
            .args(base_envs())
            .args(extra_envs)
            .arg("/bin/sh")
            .arg("-c")
            .arg(command)
            .status()
            .await?;

        if !status.success() {
            let code = status.code().unwrap_or(-1);
            if interactive {
                tracing::warn!(command, code, "Interactive command exited non-zero");
            } else {
                return Err(ChmoError::CommandFailed {
                    command: command.to_string(),
                    code,
                });
            }
        }
        Ok(())
    }

    /// Unmount devfs and remove the DNS hardlink.
    ///
    /// Idempotent; errors are logged and suppressed so they never mask a
    /// failure from `exec`.
    pub fn teardown(&mut self) {
        if self.state != SessionState::Prepared {
            return;
        }
        self.state = SessionState::Torn;
        tracing::info!(reference = %self.reference, "Tearing down chroot session");

        let dev = self.mount_root.join("dev");
        match std::process::Command::new("umount").arg(&dev).status() {
            Ok(status) if status.success() => {}
            Ok(status) => tracing::warn!(
                mount = %dev.display(),
                code = status.code().unwrap_or(-1),
                "umount exited non-zero"
            ),
            Err(err) => tracing::warn!(mount = %dev.display(), %err, "Failed to spawn umount"),
        }

        let dns = self.mount_root.join(DNS_SOCKET_RELATIVE);
        if dns.exists() {
            if let Err(err) = fs::remove_file(&dns) {
                tracing::warn!(path = %dns.display(), %err, "Failed to remove DNS hardlink");
            }
        }
    }
}

impl Drop for ChrootSession {
    fn drop(&mut self) {
        if self.state == SessionState::Prepared {
            tracing::warn!(reference = %self.reference, "Session dropped while prepared, tearing down");
            self.teardown();
        }
    }
}

/// The fixed environment handed to every chroot command, in order.
///
/// `TERM` and the `PATH` tail come from the host environment; the rest
/// matches what Homebrew expects inside the image.
fn base_envs() -> Vec<String> {
    let term = std::env::var("TERM").unwrap_or_default();
    let host_path = std::env::var("PATH")
        .map(|p| format!(":{p}"))
        .unwrap_or_default();
    vec![
        "HOME=/root".to_string(),
        format!("TERM={term}"),
        r"PS1=\u:\w\$ ".to_string(),
        format!("PATH=/opt/homebrew/bin:/opt/homebrew/sbin{host_path}"),
        "TMPDIR=/tmp".to_string(),
        "HOMEBREW_CELLAR=/opt/homebrew/Cellar".to_string(),
        "HOMEBREW_PREFIX=/opt/homebrew".to_string(),
        "HOMEBREW_REPOSITORY=/opt/homebrew".to_string(),
        "HOMEBREW_TEMP=/tmp".to_string(),
        "NONINTERACTIVE=1".to_string(),
        "SHELL=/bin/bash".to_string(),
        "CONFIG_SHELL=/bin/bash".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chmo_common::ChmoPaths;
    use tempfile::tempdir;

    fn store_with_mount(key: &str) -> (tempfile::TempDir, ImageStore) {
        let temp = tempdir().unwrap();
        let paths = ChmoPaths::with_root(temp.path());
        paths.create_dirs().unwrap();
        let store = ImageStore::new(paths);
        fs::create_dir_all(store.mount_path(key)).unwrap();
        (temp, store)
    }

    #[test]
    fn missing_tree_is_not_unpacked() {
        let temp = tempdir().unwrap();
        let paths = ChmoPaths::with_root(temp.path());
        paths.create_dirs().unwrap();
        let store = ImageStore::new(paths);

        let err = ChrootSession::new(&store, "ghost").unwrap_err();
        assert!(matches!(err, ChmoError::NotUnpacked { .. }));
    }

    #[tokio::test]
    async fn exec_before_prepare_is_a_contract_violation() {
        let (_temp, store) = store_with_mount("img");
        let session = ChrootSession::new(&store, "img").unwrap();

        let err = session.exec("true", false, &[]).await.unwrap_err();
        assert!(matches!(err, ChmoError::Internal { .. }));
    }

    #[test]
    fn teardown_without_prepare_is_a_no_op() {
        let (_temp, store) = store_with_mount("img");
        let mut session = ChrootSession::new(&store, "img").unwrap();
        session.teardown();
        session.teardown();
    }

    #[test]
    fn fixed_environment_shape() {
        let envs = base_envs();
        assert_eq!(envs.len(), 12);
        assert_eq!(envs[0], "HOME=/root");
        assert!(envs[1].starts_with("TERM="));
        assert!(envs[3].starts_with("PATH=/opt/homebrew/bin:/opt/homebrew/sbin"));
        assert_eq!(envs[9], "NONINTERACTIVE=1");
        assert_eq!(envs.last().unwrap(), "CONFIG_SHELL=/bin/bash");
    }
}
