//! Database module: entity models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: view models returned by repositories for callers like the
//!   progress endpoint and the binaries.
//! - `repo`: SQL-only functions that map rows into entities.
//!
//! External modules should import from `segment_batcher::db` — we re-export
//! the repository API and commonly used models for convenience.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{JobProgress, LedgerSnapshot, TaskProgress};
