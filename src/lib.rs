//! An incremental, content-addressed backup engine. Snapshots are commits
//! on named branches; file content is cut into content-defined chunks,
//! deduplicated against the repository and stored in encrypted, randomly
//! named packs with per-pack indexes.

#![deny(unused_must_use, deprecated)]
#![warn(clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss
)]

pub mod config;
pub mod defaults;
pub mod hashsplit;
pub mod index;
pub mod keys;
pub mod metadata;
pub mod object;
pub mod repo;
pub mod save;
pub mod split;
pub mod storage;
pub mod tree;
pub mod vint;

pub use repo::{open_repository, RepoError, Repository};
