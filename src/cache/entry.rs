//! Committed cache entries

use crate::concretize::{BuildMetadata, NodeHash};
use crate::ecosystem::Ecosystem;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Metadata of one committed artifact, stored as `entry.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub hash: NodeHash,
    pub ecosystem: Ecosystem,
    pub name: String,
    pub version: String,

    /// Directory holding the installed artifact
    pub artifact: PathBuf,

    pub build: BuildMetadata,
    pub committed_at: DateTime<Utc>,
}

impl CacheEntry {
    /// `name@version` for messages
    pub fn label(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }

    /// Size of the artifact tree in bytes
    pub fn size_bytes(&self) -> u64 {
        dir_size(&self.artifact)
    }
}

/// Format bytes as human-readable size (e.g., "1.5 GB")
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Total size of regular files under `path`, not following symlinks
pub fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| match entry.file_type() {
            Ok(ft) if ft.is_dir() => dir_size(&entry.path()),
            Ok(ft) if ft.is_file() => entry.metadata().map(|m| m.len()).unwrap_or(0),
            _ => 0,
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.0 KB");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.0 MB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.0 GB");
    }

    #[test]
    fn sums_nested_files() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("lib")).unwrap();
        std::fs::write(temp.path().join("a"), vec![0u8; 100]).unwrap();
        std::fs::write(temp.path().join("lib").join("b"), vec![0u8; 50]).unwrap();
        assert_eq!(dir_size(temp.path()), 150);
        assert_eq!(dir_size(&temp.path().join("missing")), 0);
    }
}
