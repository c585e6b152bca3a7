//! Common error types for the Chmocker toolchain.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`ChmoError`].
pub type ChmoResult<T> = Result<T, ChmoError>;

/// Common errors across the Chmocker toolchain.
#[derive(Error, Diagnostic, Debug)]
pub enum ChmoError {
    /// The process is not running as root.
    #[error("This command must be run as root")]
    #[diagnostic(
        code(chmo::not_privileged),
        help("chroot, devfs mounts and socket hardlinks all require euid 0; re-run with sudo")
    )]
    NotPrivileged,

    /// A recipe line could not be parsed.
    #[error("Failed to parse recipe line: {line}")]
    #[diagnostic(code(chmo::recipe::parse))]
    RecipeParse {
        /// The offending line.
        line: String,
    },

    /// The recipe contains no FROM instruction.
    #[error("Recipe has no FROM instruction")]
    #[diagnostic(
        code(chmo::recipe::no_base),
        help("Every stage must start with 'FROM <image> [AS <name>]'")
    )]
    NoBase,

    /// An instruction the executor does not implement.
    #[error("Unsupported instruction: {instruction}")]
    #[diagnostic(
        code(chmo::recipe::unsupported),
        help("Implemented instructions are FROM, RUN, ADD and COPY --from=<stage>")
    )]
    UnsupportedInstruction {
        /// The instruction token.
        instruction: String,
    },

    /// A base image tar is missing from the store.
    #[error("Base image not found: {reference}")]
    #[diagnostic(code(chmo::image::base_missing))]
    BaseImageMissing {
        /// The image reference that was not found.
        reference: String,
    },

    /// An image tree is not unpacked in the store.
    #[error("Image {reference} is not unpacked")]
    #[diagnostic(code(chmo::image::not_unpacked))]
    NotUnpacked {
        /// The image reference whose tree is missing.
        reference: String,
    },

    /// An ADD source does not exist on the host.
    #[error("No such file or directory: {path}")]
    #[diagnostic(code(chmo::add::source_not_found))]
    SourceNotFound {
        /// The missing source path or URL.
        path: String,
    },

    /// A COPY --from path matches nothing in the source stage.
    #[error("Path {path} not found in stage {stage}")]
    #[diagnostic(code(chmo::copy::path_not_found))]
    PathNotFoundInStage {
        /// The requested path.
        path: String,
        /// The source stage name.
        stage: String,
    },

    /// A command executed inside the chroot exited non-zero.
    #[error("Command '{command}' exited with code {code}")]
    #[diagnostic(code(chmo::chroot::command_failed))]
    CommandFailed {
        /// The command line that failed.
        command: String,
        /// Its exit code.
        code: i32,
    },

    /// A tar extraction filter selected no members.
    #[error("Filter '{prefix}' selects no archive members")]
    #[diagnostic(code(chmo::tar::empty_filter))]
    EmptyFilter {
        /// The prefix that matched nothing.
        prefix: String,
    },

    /// An archive member would escape the extraction root.
    #[error("Archive member has an unsafe path: {member}")]
    #[diagnostic(
        code(chmo::tar::unsafe_archive),
        help("Members with absolute paths or '..' components are rejected")
    )]
    UnsafeArchive {
        /// The offending member name.
        member: String,
    },

    /// The index file exists but is not a valid JSON object.
    #[error("Cache index at {path} is corrupt: {message}")]
    #[diagnostic(
        code(chmo::index::corrupt),
        help("Remove the index file to start with an empty cache")
    )]
    IndexCorrupt {
        /// Path to the index file.
        path: String,
        /// The parse failure.
        message: String,
    },

    /// An ADD URL download failed.
    #[error("Failed to download {url}: {message}")]
    #[diagnostic(code(chmo::add::download))]
    Download {
        /// The requested URL.
        url: String,
        /// The transport or status failure.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(chmo::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(chmo::serialization))]
    Serialization(String),

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(chmo::internal),
        help("This is a bug, please report it at https://github.com/chmo-containers/chmocker/issues")
    )]
    Internal {
        /// The error message.
        message: String,
    },
}

impl From<serde_json::Error> for ChmoError {
    fn from(err: serde_json::Error) -> Self {
        ChmoError::Serialization(err.to_string())
    }
}
