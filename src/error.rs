//! Error types for byoe
//!
//! All modules use `ByoeResult<T>` as their return type. Node- and
//! layer-scoped failures are recorded in the snapshot record instead of
//! being propagated, so only run-level problems surface through here.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for byoe operations
pub type ByoeResult<T> = Result<T, ByoeError>;

/// All errors that can occur in byoe
#[derive(Error, Debug)]
pub enum ByoeError {
    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Configuration file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Resolution errors
    #[error("Concretization failed for {env}/{layer} ({ecosystem}): {reason}")]
    Concretization {
        env: String,
        layer: String,
        ecosystem: String,
        unsatisfiable: bool,
        reason: String,
    },

    #[error("Unsatisfiable constraints: {reason}")]
    Unsatisfiable { reason: String },

    #[error("Ecosystem tool not available: {command} ({ecosystem})")]
    AdapterUnavailable { ecosystem: String, command: String },

    // Build errors
    #[error("Build of {node} ({ecosystem}) failed, see {}", log.display())]
    BuildJob {
        node: String,
        ecosystem: String,
        log: PathBuf,
    },

    #[error("Batch backend {backend} error: {reason}")]
    SchedulerBackend { backend: String, reason: String },

    #[error("Cache lease for {hash}: {reason}")]
    CacheLease { hash: String, reason: String },

    // Snapshot errors
    #[error("Failed to parse lock record {path}: {reason}")]
    LockRecordParse { path: PathBuf, reason: String },

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("Invalid snapshot id: {0}")]
    InvalidSnapId(String),

    #[error("No published snapshot for channel {0}")]
    NoCurrentSnapshot(String),

    #[error("Channel {0} is locked by another publisher")]
    ChannelLocked(String),

    #[error("Could not allocate a snapshot id after {0} attempts")]
    SnapshotAllocation(u32),

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Process errors
    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command execution error: {command}, stderr: {stderr}")]
    CommandExecution { command: String, stderr: String },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

impl ByoeError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create a command execution error
    pub fn command_exec(command: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::CommandExecution {
            command: command.into(),
            stderr: stderr.into(),
        }
    }

    /// Create a batch backend error
    pub fn backend(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SchedulerBackend {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    /// Create a cache lease error
    pub fn lease(hash: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        Self::CacheLease {
            hash: hash.to_string(),
            reason: reason.into(),
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SchedulerBackend { .. } | Self::CacheLease { .. } | Self::ChannelLocked(_)
        )
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::ConfigNotFound(_) => Some("Run: byoe init-dir --base-dir <path>"),
            Self::NoCurrentSnapshot(_) => Some("Run: byoe update"),
            Self::AdapterUnavailable { .. } => {
                Some("Install the tool or set its command under [ecosystems] in byoe.toml")
            }
            Self::ChannelLocked(_) => {
                Some("Another update is publishing; remove a stale channels/.<channel>.lock if none is")
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ByoeError::Concretization {
            env: "science".to_string(),
            layer: "0-base".to_string(),
            ecosystem: "spack".to_string(),
            unsatisfiable: true,
            reason: "no version of foo matches @9".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("science/0-base"));
        assert!(msg.contains("no version of foo"));
    }

    #[test]
    fn error_hint() {
        let err = ByoeError::NoCurrentSnapshot("fresh".to_string());
        assert_eq!(err.hint(), Some("Run: byoe update"));
    }

    #[test]
    fn error_retryable() {
        assert!(ByoeError::backend("slurm", "sbatch: connection refused").is_retryable());
        assert!(ByoeError::lease("abc", "contended").is_retryable());
        assert!(!ByoeError::Internal("boom".to_string()).is_retryable());
    }
}
