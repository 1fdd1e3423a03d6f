//! CLI command implementations

pub mod cache;
pub mod init_dir;
pub mod show;
pub mod snapshots;
pub mod update;

pub use cache::execute as cache;
pub use init_dir::execute as init_dir;
pub use show::execute as show;
pub use snapshots::execute as snapshots;
pub use update::execute as update;
