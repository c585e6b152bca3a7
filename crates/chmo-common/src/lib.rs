//! # chmo-common
//!
//! Shared types for the Chmocker toolchain.
//!
//! This crate provides the pieces every other Chmocker crate needs:
//! - The common error type and result alias
//! - The on-disk store layout under `~/.chmo`

#![warn(missing_docs)]

pub mod error;
pub mod paths;

pub use error::{ChmoError, ChmoResult};
pub use paths::ChmoPaths;
