//! Snapshots: allocation, build orchestration, publish and retention
//!
//! A snapshot is an immutable directory of lock records plus views onto
//! cache artifacts. Readers (activation tooling) only ever follow the
//! `channels/<channel>` pointer and read lock records through
//! [`SnapshotStore::current`] and [`Snapshot::lock_records`].

pub mod id;
mod manager;
pub mod policy;
pub mod state;
mod store;

pub use id::SnapId;
pub use manager::{SnapshotManager, UpdateOptions, UpdateReport};
pub use state::{
    EnvOutcome, EnvStatus, FailedNode, LayerOutcome, LayerStatus, Snapshot, SnapshotStatus,
};
pub use store::{period_start, GcReport, SnapshotStore};
