//! Content-addressed build cache
//!
//! Artifacts are keyed by node hash and immutable once committed. The
//! cache root may live on a filesystem shared by many concurrent runs;
//! leases keep two runs from building the same node at once.
//!
//! # Layout
//!
//! | Path | Description |
//! |------|-------------|
//! | `artifacts/<hh>/<hash>/entry.json` | Written last; presence means committed |
//! | `artifacts/<hh>/<hash>/artifact/` | Installed tree |
//! | `leases/<hash>.lease` | Held while a node is being built |
//! | `staging/` | Install prefixes before commit |
//! | `jobs/<job-id>/` | Build job manifests, scripts and status files |
//!
//! # Reservation states
//!
//! | State | Meaning |
//! |-------|---------|
//! | Cached | Committed entry exists, nothing to build |
//! | Granted | Caller holds the lease and must commit or abandon |
//! | AlreadyBuilding | Another holder's lease is live |

pub mod entry;
pub mod lease;
mod store;

pub use entry::{dir_size, format_bytes, CacheEntry};
pub use lease::{hostname, Lease, LeaseInfo};
pub use store::{BuildCache, Reservation};
