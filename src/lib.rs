//! byoe - Bring Your Own Environment
//!
//! Builds rolling, reproducible snapshots of scientific software stacks
//! that span Spack, a Python package index and isolated conda apps.
//! Every environment is concretized into lock records, missing nodes are
//! built into a shared content-addressed cache, and a snapshot that
//! validates is published by atomically moving a channel pointer.

pub mod cache;
pub mod cli;
pub mod concretize;
pub mod config;
pub mod ecosystem;
pub mod error;
pub mod journal;
pub mod scheduler;
pub mod snapshot;
pub mod ui;

pub use error::{ByoeError, ByoeResult};
