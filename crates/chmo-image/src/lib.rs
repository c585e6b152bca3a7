//! # chmo-image
//!
//! Image storage for Chmocker.
//!
//! This crate provides:
//! - The on-disk image store (tar artifacts and unpacked trees)
//! - The tar codec used for packing and extracting image roots

#![warn(missing_docs)]

/// Local image store.
pub mod store;
/// Tar packing and extraction.
pub mod tar;

pub use store::{ImageStore, format_size, tree_size};
