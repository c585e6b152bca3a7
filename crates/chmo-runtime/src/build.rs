//! Build driver.
//!
//! Walks planned stages in order and decides, per stage, between reusing
//! a cached tar and materialising the stage inside a chroot session. The
//! decision itself is a pure function over the stage, the index and the
//! store ([`resolve`]), which keeps the named / anonymous / final cases
//! in one table instead of three interleaved branches.

use chmo_common::{ChmoError, ChmoResult};
use chmo_image::{ImageStore, format_size, tar};

use crate::cache::BuildCache;
use crate::chroot::ChrootSession;
use crate::exec;
use crate::plan::Stage;

/// What the driver should do for one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Cached artifact is current; nothing to do.
    Skip,
    /// An artifact already exists under `source`; record it under `record`.
    Reuse {
        /// Key whose tar is current.
        source: String,
        /// Tags to promote the tar to and write into the index.
        record: Vec<String>,
    },
    /// Chroot-build under `key`, then record it under `record`.
    Build {
        /// Key the stage is built as (its hash).
        key: String,
        /// Tags to promote the tar to and write into the index.
        record: Vec<String>,
    },
}

/// Decide build-vs-reuse for one stage.
///
/// - Anonymous, non-final: skip iff the hash tar exists.
/// - Named: skip iff the index maps the name to this hash and the named
///   tar exists; a final named stage additionally promotes to the result
///   tag. On a miss the stage is rebuilt only when no hash tar exists.
/// - Anonymous, final: skip iff the index maps the result tag to this
///   hash and the tag tar exists.
#[must_use]
pub fn resolve(stage: &Stage, result_tag: &str, cache: &BuildCache, store: &ImageStore) -> Action {
    if let Some(name) = &stage.stage_name {
        let current =
            cache.get(name).is_some_and(|e| e.hash == stage.hash) && store.exists_tar(name);
        if current {
            if stage.is_last {
                return Action::Reuse {
                    source: name.clone(),
                    record: vec![result_tag.to_string()],
                };
            }
            return Action::Skip;
        }

        let mut record = vec![name.clone()];
        if stage.is_last {
            record.push(result_tag.to_string());
        }
        if store.exists_tar(&stage.hash) {
            return Action::Reuse {
                source: stage.hash.clone(),
                record,
            };
        }
        return Action::Build {
            key: stage.hash.clone(),
            record,
        };
    }

    if stage.is_last {
        let current = cache.get(result_tag).is_some_and(|e| e.hash == stage.hash)
            && store.exists_tar(result_tag);
        if current {
            return Action::Skip;
        }
        let record = vec![result_tag.to_string()];
        if store.exists_tar(&stage.hash) {
            return Action::Reuse {
                source: stage.hash.clone(),
                record,
            };
        }
        return Action::Build {
            key: stage.hash.clone(),
            record,
        };
    }

    if store.exists_tar(&stage.hash) {
        Action::Skip
    } else {
        Action::Build {
            key: stage.hash.clone(),
            record: Vec::new(),
        }
    }
}

/// Build flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOptions {
    /// Re-extract base trees even when already unpacked.
    pub refresh: bool,
    /// Do not pack built trees into tars.
    pub no_tar: bool,
    /// Keep built trees unpacked.
    pub no_remove: bool,
}

/// Drives a whole build invocation for one result tag.
pub struct Builder {
    store: ImageStore,
    cache: BuildCache,
    tag: String,
    options: BuildOptions,
}

impl Builder {
    /// Create a driver over an opened store and cache.
    #[must_use]
    pub fn new(
        store: ImageStore,
        cache: BuildCache,
        tag: impl Into<String>,
        options: BuildOptions,
    ) -> Self {
        Self {
            store,
            cache,
            tag: tag.into(),
            options,
        }
    }

    /// Build all stages in order.
    ///
    /// The first failing stage aborts the build; artifacts of earlier
    /// stages stay cached.
    ///
    /// # Errors
    ///
    /// Propagates the failing stage's error.
    pub async fn build(&mut self, stages: &[Stage]) -> ChmoResult<()> {
        tracing::info!(tag = %self.tag, stages = stages.len(), "Starting build");

        for stage in stages {
            tracing::info!(
                base = %stage.base_ref,
                name = stage.stage_name.as_deref().unwrap_or("<anonymous>"),
                hash = %stage.hash,
                "Consulting cache"
            );
            match resolve(stage, &self.tag, &self.cache, &self.store) {
                Action::Skip => {
                    tracing::info!(hash = %stage.hash, "Nothing to rebuild, skipping stage");
                }
                Action::Reuse { source, record } => {
                    tracing::info!(%source, "Reusing cached stage tar");
                    self.record(&source, &stage.hash, &record)?;
                }
                Action::Build { key, record } => {
                    self.build_stage(stage, &key).await?;
                    self.record(&key, &stage.hash, &record)?;
                }
            }
        }

        tracing::info!(tag = %self.tag, "Build finished");
        Ok(())
    }

    /// Promote a tar under each tag and record the mapping in the index.
    fn record(&mut self, source: &str, hash: &str, tags: &[String]) -> ChmoResult<()> {
        if tags.is_empty() {
            return Ok(());
        }
        if !self.store.exists_tar(source) {
            // only reachable when the stage was built with --no-tar
            tracing::warn!(source, "No tar artifact to promote, index left untouched");
            return Ok(());
        }
        for tag in tags {
            self.store.copy_tar(source, tag)?;
            self.cache.put(tag, hash)?;
        }
        Ok(())
    }

    /// Materialise one stage: unpack its base, run its instructions in a
    /// chroot session, pack the result.
    async fn build_stage(&self, stage: &Stage, key: &str) -> ChmoResult<()> {
        tracing::info!(base = %stage.base_ref, key, "Building stage");

        unpack_image(&self.store, &stage.base_ref, key, self.options.refresh)?;

        let mut session = ChrootSession::new(&self.store, key)?;
        session.prepare().await?;
        let outcome = self.run_instructions(&session, stage).await;
        session.teardown();

        match outcome {
            Ok(()) => {
                if !self.options.no_tar {
                    let tar_path = self.store.tar_path(key);
                    tar::pack(&self.store.mount_path(key), &tar_path)?;
                    tracing::info!(
                        tar = %tar_path.display(),
                        size = %format_size(std::fs::metadata(&tar_path)?.len()),
                        "Stage packed"
                    );
                }
                if !self.options.no_remove {
                    self.store.remove(&self.store.mount_path(key))?;
                }
                Ok(())
            }
            Err(err) => {
                // never leave a stale tar for a failed stage; the tree
                // stays behind for post-mortem inspection
                if self.store.exists_tar(key) {
                    if let Err(remove_err) = self.store.remove(&self.store.tar_path(key)) {
                        tracing::warn!(key, %remove_err, "Failed to remove stale stage tar");
                    }
                }
                tracing::error!(key, %err, "Stage failed, leaving tree unpacked");
                Err(err)
            }
        }
    }

    async fn run_instructions(&self, session: &ChrootSession, stage: &Stage) -> ChmoResult<()> {
        for instruction in &stage.instructions {
            exec::execute(session, &self.store, instruction).await?;
        }
        Ok(())
    }
}

/// Extract a base image tar into the mount tree for `key`.
///
/// An already unpacked tree is reused unless `force_refresh` asks for a
/// clean re-extract (and the base tar is present to re-extract from).
///
/// # Errors
///
/// [`ChmoError::BaseImageMissing`] when an extract is needed but the base
/// tar does not exist.
pub fn unpack_image(
    store: &ImageStore,
    base: &str,
    key: &str,
    force_refresh: bool,
) -> ChmoResult<()> {
    let tar_path = store.tar_path(base);
    let mount = store.mount_path(key);
    tracing::info!(base = %tar_path.display(), mount = %mount.display(), "Unpacking base image");

    if mount.exists() {
        if !force_refresh {
            if base != key {
                tracing::warn!(key, "Tree already unpacked, reusing");
            }
            return Ok(());
        }
        if tar_path.exists() {
            tracing::warn!(key, "Tree already unpacked, refreshing");
            store.remove(&mount)?;
        }
    }

    if !tar_path.exists() {
        return Err(ChmoError::BaseImageMissing {
            reference: base.to_string(),
        });
    }
    tar::extract(&tar_path, &mount, None)
}

/// Run options for executing a command in an unpacked image.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Remove the unpacked tree afterwards.
    pub remove_after: bool,
    /// Attach host stdio and tolerate non-zero exits.
    pub interactive: bool,
    /// Re-extract the tree even when already unpacked.
    pub refresh: bool,
    /// Extra `KEY=VAL` environment entries.
    pub extra_envs: Vec<String>,
}

/// Unpack an image and execute a command inside a chroot session on it.
///
/// # Errors
///
/// Propagates unpack, session and command failures; teardown always runs
/// before the error surfaces.
pub async fn run_image(
    store: &ImageStore,
    reference: &str,
    command: &str,
    options: &RunOptions,
) -> ChmoResult<()> {
    unpack_image(store, reference, reference, options.refresh)?;

    let mut session = ChrootSession::new(store, reference)?;
    session.prepare().await?;
    let outcome = session
        .exec(command, options.interactive, &options.extra_envs)
        .await;
    session.teardown();
    outcome?;

    if options.remove_after {
        store.remove(&store.mount_path(reference))?;
    }
    Ok(())
}
