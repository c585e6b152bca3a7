//! # chmo-runtime
//!
//! The Chmocker build engine.
//!
//! Chmocker builds macOS root filesystems from Dockerfile-style recipes
//! without a kernel container runtime:
//! - Recipes are parsed and sliced into stages at `FROM` boundaries
//! - Each stage is fingerprinted by the SHA-256 of its raw text
//! - A persistent index reuses stage tars across invocations
//! - Instructions run inside a `chroot` session with devfs and host
//!   name resolution wired in

#![warn(missing_docs)]

pub mod build;
pub mod cache;
pub mod chroot;
pub mod cli;
pub mod exec;
pub mod image;
pub mod plan;
pub mod recipe;

pub use build::Builder;
pub use cache::BuildCache;
pub use chroot::ChrootSession;
pub use plan::Stage;
pub use recipe::Instruction;
