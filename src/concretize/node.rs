//! Concrete nodes and their content hashes

use crate::ecosystem::Ecosystem;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Hex characters kept from the SHA-256 digest
pub const HASH_LEN: usize = 32;

/// Identity of a concrete node: equal hashes mean the same artifact
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeHash(String);

impl NodeHash {
    /// Accept a lowercase hex string of the right length
    pub fn parse(s: &str) -> Option<Self> {
        let valid = s.len() == HASH_LEN
            && s.chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        valid.then(|| Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form for display and file names
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }

    /// First two characters, used to shard cache directories
    pub fn shard(&self) -> &str {
        &self.0[..self.0.len().min(2)]
    }
}

impl fmt::Display for NodeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How and where a node was built
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildMetadata {
    pub duration_ms: u64,
    pub backend: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub built_at: DateTime<Utc>,
}

/// A fully pinned package
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcreteNode {
    pub ecosystem: Ecosystem,
    pub name: String,
    pub version: String,
    pub hash: NodeHash,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native_id: Option<String>,

    /// Sorted dependency hashes
    #[serde(default)]
    pub deps: Vec<NodeHash>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildMetadata>,
}

impl ConcreteNode {
    /// Build a node, computing its hash
    pub fn new(
        ecosystem: Ecosystem,
        name: impl Into<String>,
        version: impl Into<String>,
        options: BTreeMap<String, String>,
        native_id: Option<String>,
        mut deps: Vec<NodeHash>,
    ) -> Self {
        deps.sort();
        deps.dedup();
        let name = name.into();
        let version = version.into();
        let hash = compute_hash(ecosystem, &name, &version, native_id.as_deref(), &options, &deps);
        Self {
            ecosystem,
            name,
            version,
            hash,
            native_id,
            deps,
            options,
            build: None,
        }
    }

    /// Recompute the hash and compare with the stored one
    pub fn verify_hash(&self) -> bool {
        compute_hash(
            self.ecosystem,
            &self.name,
            &self.version,
            self.native_id.as_deref(),
            &self.options,
            &self.deps,
        ) == self.hash
    }

    /// `name@version` for messages
    pub fn label(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

/// SHA-256 over a line-oriented canonical encoding.
///
/// Options and deps must already be sorted; `BTreeMap` iteration and the
/// sorted `deps` vector guarantee that for every caller.
fn compute_hash(
    ecosystem: Ecosystem,
    name: &str,
    version: &str,
    native_id: Option<&str>,
    options: &BTreeMap<String, String>,
    deps: &[NodeHash],
) -> NodeHash {
    let mut hasher = Sha256::new();
    hasher.update(format!("ecosystem\0{}\n", ecosystem));
    hasher.update(format!("name\0{}\n", name));
    hasher.update(format!("version\0{}\n", version));
    if let Some(id) = native_id {
        hasher.update(format!("native\0{}\n", id));
    }
    for (key, value) in options {
        hasher.update(format!("option\0{}\0{}\n", key, value));
    }
    for dep in deps {
        hasher.update(format!("dep\0{}\n", dep));
    }
    let digest = hasher.finalize();
    NodeHash(hex::encode(&digest[..HASH_LEN / 2]))
}
