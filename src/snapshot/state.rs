//! Persisted snapshot record (`snapshots/<id>/snapshot.json`)

use crate::concretize::{LockRecord, NodeHash};
use crate::config::{Channel, LayerKind};
use crate::ecosystem::Ecosystem;
use crate::error::ByoeResult;
use crate::snapshot::id::SnapId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

pub const RECORD_FILE: &str = "snapshot.json";
pub const SITE_CONF_FILE: &str = "site_conf.toml";
pub const LOCKS_DIR: &str = "locks";
pub const VIEWS_DIR: &str = "views";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStatus {
    Building,
    Validated,
    Published,
    Failed,
}

impl SnapshotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Building => "building",
            Self::Validated => "validated",
            Self::Published => "published",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SnapshotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerStatus {
    Pending,
    Succeeded,
    /// Some nodes failed, the rest built
    Partial,
    Failed,
    /// Not attempted because a required layer below it failed
    Skipped,
}

impl fmt::Display for LayerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvStatus {
    Succeeded,
    Partial,
    Failed,
}

impl fmt::Display for EnvStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Succeeded => "succeeded",
            Self::Partial => "partial",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A node that did not build, with where to look
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedNode {
    pub hash: NodeHash,
    pub name: String,
    pub version: String,
    pub ecosystem: Ecosystem,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerOutcome {
    pub index: usize,
    pub kind: LayerKind,
    pub ecosystem: Ecosystem,
    pub required: bool,
    pub status: LayerStatus,

    /// Lock record path relative to the snapshot directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_digest: Option<String>,

    /// Whether the lock digest matches the previous published snapshot
    #[serde(default)]
    pub unchanged: bool,

    /// Concretization error, if the layer never got a lock record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_nodes: Vec<FailedNode>,

    #[serde(default)]
    pub node_count: usize,
}

impl LayerOutcome {
    pub fn pending(index: usize, kind: LayerKind, required: bool) -> Self {
        Self {
            index,
            kind,
            ecosystem: kind.ecosystem(),
            required,
            status: LayerStatus::Pending,
            lock: None,
            lock_digest: None,
            unchanged: false,
            error: None,
            failed_nodes: Vec::new(),
            node_count: 0,
        }
    }

    /// `<index>-<kind>` as used in paths
    pub fn name(&self) -> String {
        format!("{}-{}", self.index, self.kind)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvOutcome {
    pub name: String,
    pub required: bool,
    pub best_effort: bool,
    pub status: EnvStatus,
    pub layers: Vec<LayerOutcome>,
}

/// Everything known about one snapshot run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapId,
    pub channel: Channel,
    pub status: SnapshotStatus,

    /// Views removed by retention; only lock records remain
    #[serde(default)]
    pub pruned: bool,

    #[serde(default)]
    pub envs: BTreeMap<String, EnvOutcome>,

    /// Nodes built by this run, as opposed to cache hits
    #[serde(default)]
    pub installs: usize,

    #[serde(default)]
    pub aborted: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    #[serde(skip)]
    pub dir: PathBuf,
}

impl Snapshot {
    pub fn new(id: SnapId, channel: Channel, dir: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id,
            channel,
            status: SnapshotStatus::Building,
            pruned: false,
            envs: BTreeMap::new(),
            installs: 0,
            aborted: false,
            created_at: now,
            updated_at: now,
            finished_at: None,
            dir,
        }
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.dir.join(LOCKS_DIR)
    }

    pub fn views_dir(&self) -> PathBuf {
        self.dir.join(VIEWS_DIR)
    }

    pub fn record_path(&self) -> PathBuf {
        self.dir.join(RECORD_FILE)
    }

    pub fn site_conf_path(&self) -> PathBuf {
        self.dir.join(SITE_CONF_FILE)
    }

    /// Relative path of a lock record inside the snapshot
    pub fn lock_path(env: &str, record: &LockRecord) -> PathBuf {
        Path::new(LOCKS_DIR).join(env).join(record.file_name())
    }

    /// Load every lock record the snapshot wrote, in environment and
    /// layer order
    pub async fn lock_records(&self) -> ByoeResult<Vec<LockRecord>> {
        let mut records = Vec::new();
        for env in self.envs.values() {
            for layer in &env.layers {
                if let Some(lock) = &layer.lock {
                    records.push(LockRecord::load(&self.dir.join(lock)).await?);
                }
            }
        }
        Ok(records)
    }

    pub fn failed_envs(&self) -> impl Iterator<Item = &EnvOutcome> {
        self.envs.values().filter(|e| e.status == EnvStatus::Failed)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_json_shape() {
        let id: SnapId = "20260301000000".parse().unwrap();
        let mut snap = Snapshot::new(id, Channel::Fresh, PathBuf::from("/s/20260301000000"));
        let mut layer = LayerOutcome::pending(0, LayerKind::Base, true);
        layer.status = LayerStatus::Succeeded;
        snap.envs.insert(
            "science".to_string(),
            EnvOutcome {
                name: "science".to_string(),
                required: true,
                best_effort: false,
                status: EnvStatus::Succeeded,
                layers: vec![layer],
            },
        );

        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["id"], "20260301000000");
        assert_eq!(json["status"], "building");
        assert_eq!(json["channel"], "fresh");
        assert_eq!(json["envs"]["science"]["layers"][0]["kind"], "base");
        assert!(json.get("dir").is_none());

        let back: Snapshot = serde_json::from_value(json).unwrap();
        assert_eq!(back.envs, snap.envs);
        assert_eq!(back.dir, PathBuf::new());
    }

    #[test]
    fn layer_names() {
        let layer = LayerOutcome::pending(1, LayerKind::PackageIndex, true);
        assert_eq!(layer.name(), "1-index");
        assert_eq!(layer.ecosystem, Ecosystem::Pip);
    }
}
