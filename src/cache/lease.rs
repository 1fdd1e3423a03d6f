//! Build leases: who is building a node right now
//!
//! A lease is a small JSON file created with an exclusive link, so only one
//! process on a shared filesystem can hold it. Holders refresh the
//! heartbeat while they build; a lease that stops beating, or whose holder
//! is a dead process on this host, is stale and may be reclaimed.

use crate::concretize::NodeHash;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Contents of a lease file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseInfo {
    pub holder: Uuid,
    pub host: String,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

impl LeaseInfo {
    /// Fresh lease for this process
    pub fn new(holder: Uuid) -> Self {
        let now = Utc::now();
        Self {
            holder,
            host: hostname(),
            pid: std::process::id(),
            acquired_at: now,
            heartbeat_at: now,
        }
    }

    /// Missing heartbeats, or a dead holder on this host
    pub fn is_stale(&self, stale_after: Duration, now: DateTime<Utc>) -> bool {
        if now - self.heartbeat_at > stale_after {
            return true;
        }
        self.host == hostname() && !process_alive(self.pid)
    }
}

/// A granted lease, owned by the process building the node
#[derive(Debug, Clone)]
pub struct Lease {
    pub hash: NodeHash,
    pub info: LeaseInfo,
    pub(crate) path: PathBuf,
}

impl Lease {
    pub fn holder(&self) -> Uuid {
        self.info.holder
    }
}

/// Host name of this machine
pub fn hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Signal 0 checks for existence without delivering anything
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: kill with signal 0 performs only the permission and existence check
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
