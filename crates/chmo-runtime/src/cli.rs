//! Chmocker CLI.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::Result;

use chmo_common::{ChmoError, ChmoPaths, ChmoResult};
use chmo_image::ImageStore;

use crate::build::{self, BuildOptions, Builder, RunOptions};
use crate::cache::BuildCache;
use crate::image::{self, CreateOptions};
use crate::{plan, recipe};

/// Chmocker - chroot-based container image toolchain for macOS
#[derive(Parser)]
#[command(name = "chmocker")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Chmocker commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Manage base images
    Image {
        /// Image subcommands.
        #[command(subcommand)]
        command: ImageCommands,
    },

    /// Build an image from the recipe in the working directory
    Build {
        /// Result image tag
        #[arg(short, long)]
        tag: String,

        /// Path to the recipe
        #[arg(short, long, default_value = "Dockerfile")]
        file: PathBuf,

        /// Force refresh already unpacked trees
        #[arg(long)]
        refresh: bool,

        /// Do not produce tar archives
        #[arg(long)]
        no_tar: bool,

        /// Do not remove unpacked trees
        #[arg(long)]
        no_remove: bool,
    },

    /// Run a command inside an image
    Run {
        /// Image tag
        tag: String,

        /// Remove the unpacked tree after the run
        #[arg(long)]
        rm: bool,

        /// Interactive mode: attach stdio, tolerate non-zero exits
        #[arg(long)]
        it: bool,

        /// Force refresh an already unpacked tree
        #[arg(long)]
        refresh: bool,

        /// Extra container environment variables
        #[arg(short = 'e', value_name = "KEY=VAL")]
        env: Vec<String>,

        /// Command to execute (defaults to a shell)
        command: Option<String>,
    },
}

/// Base image subcommands.
#[derive(Subcommand)]
pub enum ImageCommands {
    /// Synthesise a base image from the host system
    Create {
        /// Image tag
        #[arg(short, long)]
        tag: String,

        /// Force recreate the image
        #[arg(long)]
        recreate: bool,

        /// Do not produce a tar archive
        #[arg(long)]
        no_tar: bool,

        /// Do not remove the unpacked image
        #[arg(long)]
        no_remove: bool,

        /// Do not install Homebrew into the image
        #[arg(long)]
        no_brew: bool,
    },
    /// List store contents
    Ls,
}

impl Cli {
    /// Execute the CLI command.
    ///
    /// # Errors
    ///
    /// Any toolchain error; rendered by color-eyre at the binary boundary.
    pub async fn execute(self) -> Result<()> {
        check_privileges()?;

        let paths = ChmoPaths::default();
        paths.create_dirs()?;
        let store = ImageStore::new(paths.clone());
        let cache = BuildCache::open(&paths)?;

        match self.command {
            Commands::Image { command } => match command {
                ImageCommands::Create {
                    tag,
                    recreate,
                    no_tar,
                    no_remove,
                    no_brew,
                } => {
                    let options = CreateOptions {
                        recreate,
                        no_tar,
                        no_remove,
                        no_brew,
                    };
                    image::create_system_image(&store, &tag, options).await?;
                }
                ImageCommands::Ls => image::list_images(&store)?,
            },

            Commands::Build {
                tag,
                file,
                refresh,
                no_tar,
                no_remove,
            } => {
                tracing::info!(tag = %tag, file = %file.display(), "Starting build process");

                let instructions = recipe::parse_file(&file)?;
                let stages = plan::plan(&instructions)?;

                let options = BuildOptions {
                    refresh,
                    no_tar,
                    no_remove,
                };
                let mut builder = Builder::new(store, cache, tag, options);
                builder.build(&stages).await?;
            }

            Commands::Run {
                tag,
                rm,
                it,
                refresh,
                env,
                command,
            } => {
                let command = command.unwrap_or_else(|| "/bin/bash".to_string());
                let options = RunOptions {
                    remove_after: rm,
                    interactive: it,
                    refresh,
                    extra_envs: env,
                };
                build::run_image(&store, &tag, &command, &options).await?;
            }
        }

        Ok(())
    }
}

/// The whole engine needs euid 0 on the host: `chroot`, devfs mounts and
/// hardlinks to privileged sockets all refuse otherwise.
fn check_privileges() -> ChmoResult<()> {
    if rustix::process::geteuid().is_root() {
        Ok(())
    } else {
        Err(ChmoError::NotPrivileged)
    }
}
