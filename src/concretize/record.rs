//! Lock records: the reproducibility artifact of one environment layer
//!
//! A lock record is a TOML document with a `[record]` header followed by
//! `[[nodes]]` in canonical order. It is enough to request the exact
//! same build later.

use crate::concretize::node::{ConcreteNode, NodeHash};
use crate::config::LayerKind;
use crate::ecosystem::Ecosystem;
use crate::error::{ByoeError, ByoeResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs;

/// Lock record format version
pub const FORMAT_VERSION: u32 = 1;

/// Header of a lock record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordHeader {
    pub format: u32,
    pub env: String,
    pub index: usize,
    pub kind: LayerKind,
    pub ecosystem: Ecosystem,
    pub created_at: DateTime<Utc>,

    /// Abstract requests the layer was resolved from
    pub requests: Vec<String>,

    /// Hashes of the requested packages, in request order
    pub roots: Vec<NodeHash>,
}

/// Ordered, hashed node sequence for one environment layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub record: RecordHeader,

    #[serde(default)]
    pub nodes: Vec<ConcreteNode>,
}

impl LockRecord {
    /// `<env>/<index>-<kind>`
    pub fn layer_id(&self) -> String {
        layer_id(&self.record.env, self.record.index, self.record.kind)
    }

    /// File name inside `locks/<env>/`
    pub fn file_name(&self) -> String {
        format!("{}-{}.lock.toml", self.record.index, self.record.kind)
    }

    /// Digest of the node sequence, independent of the creation time
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for node in &self.nodes {
            hasher.update(format!(
                "{} {} {} {}\n",
                node.ecosystem, node.name, node.version, node.hash
            ));
        }
        hex::encode(&hasher.finalize()[..16])
    }

    pub fn node(&self, hash: &NodeHash) -> Option<&ConcreteNode> {
        self.nodes.iter().find(|n| &n.hash == hash)
    }

    pub fn to_toml(&self) -> ByoeResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Parse and verify every node hash
    pub fn from_toml(content: &str, path: &Path) -> ByoeResult<Self> {
        let record: LockRecord =
            toml::from_str(content).map_err(|e| ByoeError::LockRecordParse {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        if record.record.format != FORMAT_VERSION {
            return Err(ByoeError::LockRecordParse {
                path: path.to_path_buf(),
                reason: format!("unsupported format version {}", record.record.format),
            });
        }
        if let Some(bad) = record.nodes.iter().find(|n| !n.verify_hash()) {
            return Err(ByoeError::LockRecordParse {
                path: path.to_path_buf(),
                reason: format!("hash mismatch for {}", bad.label()),
            });
        }
        Ok(record)
    }

    pub async fn load(path: &Path) -> ByoeResult<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| ByoeError::io(format!("reading lock record {}", path.display()), e))?;
        Self::from_toml(&content, path)
    }

    /// Write via a temporary file and rename
    pub async fn save(&self, path: &Path) -> ByoeResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ByoeError::io(format!("creating {}", parent.display()), e))?;
        }
        write_atomic(path, self.to_toml()?.as_bytes()).await
    }
}

/// `<env>/<index>-<kind>`
pub fn layer_id(env: &str, index: usize, kind: LayerKind) -> String {
    format!("{env}/{index}-{kind}")
}

/// Write `content` next to `path` and rename it into place
pub(crate) async fn write_atomic(path: &Path, content: &[u8]) -> ByoeResult<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));
    fs::write(&tmp, content)
        .await
        .map_err(|e| ByoeError::io(format!("writing {}", tmp.display()), e))?;
    fs::rename(&tmp, path)
        .await
        .map_err(|e| ByoeError::io(format!("renaming into {}", path.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concretize::node::BuildMetadata;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn sample() -> LockRecord {
        let zlib = ConcreteNode::new(
            Ecosystem::Spack,
            "zlib",
            "1.3.1",
            BTreeMap::from([("target".to_string(), "zen2".to_string())]),
            Some("3ek2hmqc".to_string()),
            vec![],
        );
        let mut hdf5 = ConcreteNode::new(
            Ecosystem::Spack,
            "hdf5",
            "1.14.3",
            BTreeMap::from([
                ("compiler".to_string(), "gcc@12.2.0".to_string()),
                ("target".to_string(), "zen2".to_string()),
            ]),
            Some("u7w4kqpa".to_string()),
            vec![zlib.hash.clone()],
        );
        hdf5.build = Some(BuildMetadata {
            duration_ms: 183_000,
            backend: "slurm".to_string(),
            job_id: Some("4711".to_string()),
            built_at: "2026-03-01T10:00:00Z".parse().unwrap(),
        });

        LockRecord {
            record: RecordHeader {
                format: FORMAT_VERSION,
                env: "science".to_string(),
                index: 0,
                kind: LayerKind::Base,
                ecosystem: Ecosystem::Spack,
                created_at: "2026-03-01T09:00:00Z".parse().unwrap(),
                requests: vec!["hdf5@1.14".to_string()],
                roots: vec![hdf5.hash.clone()],
            },
            nodes: vec![zlib, hdf5],
        }
    }

    #[test]
    fn toml_roundtrip_is_exact() {
        let record = sample();
        let text = record.to_toml().unwrap();
        assert!(text.contains("[record]"));
        assert!(text.contains("[[nodes]]"));

        let parsed = LockRecord::from_toml(&text, Path::new("x.lock.toml")).unwrap();
        assert_eq!(parsed, record);
        assert_eq!(parsed.to_toml().unwrap(), text);
    }

    #[test]
    fn digest_ignores_timestamp() {
        let a = sample();
        let mut b = sample();
        b.record.created_at = Utc::now();
        assert_eq!(a.digest(), b.digest());

        b.nodes.pop();
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn rejects_tampered_version() {
        let text = sample().to_toml().unwrap().replace("1.14.3", "1.14.4");
        let err = LockRecord::from_toml(&text, Path::new("x.lock.toml")).unwrap_err();
        assert!(err.to_string().contains("hash mismatch"));
    }

    #[test]
    fn names() {
        let record = sample();
        assert_eq!(record.layer_id(), "science/0-base");
        assert_eq!(record.file_name(), "0-base.lock.toml");
    }

    #[tokio::test]
    async fn save_and_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("locks").join("science").join("0-base.lock.toml");
        let record = sample();

        record.save(&path).await.unwrap();
        let loaded = LockRecord::load(&path).await.unwrap();
        assert_eq!(loaded, record);
    }
}
