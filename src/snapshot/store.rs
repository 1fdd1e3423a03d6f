//! On-disk snapshot store
//!
//! ```text
//! <base_dir>/
//!   snapshots/<id>/{snapshot.json, site_conf.toml, locks/, views/}
//!   snapshots/.in-progress-<id>
//!   channels/<channel> -> ../snapshots/<id>
//! ```
//!
//! Snapshot directories are private to their run until published. The
//! only shared mutable state is the channel pointer, swapped by renaming
//! a fresh symlink over it while holding `channels/.<channel>.lock`.

use crate::cache::{hostname, lease::process_alive, BuildCache, CacheEntry};
use crate::concretize::record::write_atomic;
use crate::concretize::NodeHash;
use crate::config::schema::StorageConfig;
use crate::config::Channel;
use crate::error::{ByoeError, ByoeResult};
use crate::snapshot::id::SnapId;
use crate::snapshot::state::{Snapshot, SnapshotStatus};
use chrono::{Datelike, NaiveDate, NaiveDateTime};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MARKER_PREFIX: &str = ".in-progress-";
const ALLOCATION_ATTEMPTS: u32 = 3;
const CHANNEL_LOCK_ATTEMPTS: u32 = 50;
const CHANNEL_LOCK_RETRY: Duration = Duration::from_millis(100);
const CHANNEL_LOCK_STALE: Duration = Duration::from_secs(300);

/// Result of a cache garbage collection
#[derive(Debug, Default)]
pub struct GcReport {
    pub removed: Vec<CacheEntry>,
    pub kept: usize,
    /// Unreferenced entries left alone because a build holds their lease
    pub leased: usize,
    pub freed_bytes: u64,
    pub dry_run: bool,
}

/// Snapshot directories and channel pointers under one base directory
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    snapshots_dir: PathBuf,
    channels_dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(storage: &StorageConfig) -> Self {
        Self {
            snapshots_dir: storage.snapshots_dir(),
            channels_dir: storage.channels_dir(),
        }
    }

    pub async fn init(&self) -> ByoeResult<()> {
        for dir in [&self.snapshots_dir, &self.channels_dir] {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| ByoeError::io(format!("creating {}", dir.display()), e))?;
        }
        Ok(())
    }

    pub fn snapshot_dir(&self, id: &SnapId) -> PathBuf {
        self.snapshots_dir.join(id.to_string())
    }

    fn marker_path(&self, id: &SnapId) -> PathBuf {
        self.snapshots_dir.join(format!("{}{}", MARKER_PREFIX, id))
    }

    fn channel_link(&self, channel: Channel) -> PathBuf {
        self.channels_dir.join(channel.as_str())
    }

    /// Reserve a fresh snapshot id.
    ///
    /// The `.in-progress-<id>` marker is created exclusively; a taken id
    /// bumps the version and tries again.
    pub async fn allocate(&self, label: Option<&str>) -> ByoeResult<SnapId> {
        self.allocate_at(label, chrono::Local::now().naive_local()).await
    }

    async fn allocate_at(&self, label: Option<&str>, now: NaiveDateTime) -> ByoeResult<SnapId> {
        if let Some(label) = label {
            if label.is_empty() || !label.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(ByoeError::User(format!(
                    "invalid snapshot label '{label}': use letters only"
                )));
            }
        }
        self.init().await?;

        let mut id = SnapId::new(now, label.map(str::to_string), 0);
        for _ in 0..ALLOCATION_ATTEMPTS {
            if !self.snapshot_dir(&id).exists() {
                let marker = self.marker_path(&id);
                match fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&marker)
                    .await
                {
                    Ok(mut file) => {
                        let owner = format!("{}\n{}\n", hostname(), std::process::id());
                        file.write_all(owner.as_bytes())
                            .await
                            .map_err(|e| ByoeError::io(format!("writing {}", marker.display()), e))?;
                        debug!("Allocated snapshot {}", id);
                        return Ok(id);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                    Err(e) => {
                        return Err(ByoeError::io(format!("creating {}", marker.display()), e))
                    }
                }
            }
            debug!("Snapshot id {} is taken", id);
            id = id.bump();
        }
        Err(ByoeError::SnapshotAllocation(ALLOCATION_ATTEMPTS))
    }

    /// Drop the in-progress marker
    pub async fn release(&self, id: &SnapId) {
        let marker = self.marker_path(id);
        if let Err(e) = fs::remove_file(&marker).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Could not remove {}: {}", marker.display(), e);
            }
        }
    }

    /// Runs currently holding a marker. Markers left by dead processes on
    /// this host are ignored.
    pub async fn in_progress(&self) -> ByoeResult<Vec<SnapId>> {
        let mut ids = Vec::new();
        let mut entries = match fs::read_dir(&self.snapshots_dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => {
                return Err(ByoeError::io(format!("reading {}", self.snapshots_dir.display()), e))
            }
        };
        let me = hostname();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ByoeError::io("reading snapshot entry", e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(id) = name.strip_prefix(MARKER_PREFIX).and_then(|s| s.parse::<SnapId>().ok()) else {
                continue;
            };
            let owner = fs::read_to_string(entry.path()).await.unwrap_or_default();
            let mut lines = owner.lines();
            let host = lines.next().unwrap_or_default();
            let pid = lines.next().and_then(|p| p.trim().parse::<u32>().ok());
            if host == me && pid.is_some_and(|pid| !process_alive(pid)) {
                debug!("Ignoring stale marker for {}", id);
                continue;
            }
            ids.push(id);
        }
        ids.sort();
        Ok(ids)
    }

    /// All snapshots with a readable record, oldest first
    pub async fn list(&self) -> ByoeResult<Vec<Snapshot>> {
        let mut snapshots = Vec::new();
        let mut entries = match fs::read_dir(&self.snapshots_dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(snapshots),
            Err(e) => {
                return Err(ByoeError::io(format!("reading {}", self.snapshots_dir.display()), e))
            }
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ByoeError::io("reading snapshot entry", e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            let Ok(id) = name.parse::<SnapId>() else {
                continue;
            };
            match self.load(&id).await {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => debug!("Skipping {}: {}", name, e),
            }
        }
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(snapshots)
    }

    pub async fn load(&self, id: &SnapId) -> ByoeResult<Snapshot> {
        let dir = self.snapshot_dir(id);
        let path = dir.join(crate::snapshot::state::RECORD_FILE);
        let content = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ByoeError::SnapshotNotFound(id.to_string()))
            }
            Err(e) => return Err(ByoeError::io(format!("reading {}", path.display()), e)),
        };
        let mut snapshot: Snapshot = serde_json::from_str(&content)?;
        snapshot.dir = dir;
        Ok(snapshot)
    }

    pub async fn save(&self, snapshot: &Snapshot) -> ByoeResult<()> {
        fs::create_dir_all(&snapshot.dir)
            .await
            .map_err(|e| ByoeError::io(format!("creating {}", snapshot.dir.display()), e))?;
        write_atomic(&snapshot.record_path(), &serde_json::to_vec_pretty(snapshot)?).await
    }

    /// The snapshot a channel currently points at
    pub async fn current(&self, channel: Channel) -> ByoeResult<Option<SnapId>> {
        let link = self.channel_link(channel);
        let target = match fs::read_link(&link).await {
            Ok(target) => target,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ByoeError::io(format!("reading {}", link.display()), e)),
        };
        let id = target
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ByoeError::InvalidSnapId(target.display().to_string()))?
            .parse()?;
        Ok(Some(id))
    }

    /// Load a snapshot by id, or the channel's current one
    pub async fn resolve(&self, id: Option<&SnapId>, channel: Channel) -> ByoeResult<Snapshot> {
        match id {
            Some(id) => self.load(id).await,
            None => {
                let id = self
                    .current(channel)
                    .await?
                    .ok_or_else(|| ByoeError::NoCurrentSnapshot(channel.to_string()))?;
                self.load(&id).await
            }
        }
    }

    /// Point the snapshot's channel at it. Returns the previous target.
    pub async fn publish(&self, snapshot: &Snapshot) -> ByoeResult<Option<SnapId>> {
        self.init().await?;
        let lock = self.acquire_channel_lock(snapshot.channel).await?;
        let result = self.swap_channel(snapshot).await;
        if let Err(e) = fs::remove_file(&lock).await {
            warn!("Could not remove channel lock {}: {}", lock.display(), e);
        }
        result
    }

    async fn swap_channel(&self, snapshot: &Snapshot) -> ByoeResult<Option<SnapId>> {
        let channel = snapshot.channel;
        let previous = self.current(channel).await?;
        let link = self.channel_link(channel);
        let tmp = self
            .channels_dir
            .join(format!(".{}.{}.tmp", channel, Uuid::new_v4()));
        let target = Path::new("..").join("snapshots").join(snapshot.id.to_string());

        fs::symlink(&target, &tmp)
            .await
            .map_err(|e| ByoeError::io(format!("creating {}", tmp.display()), e))?;
        if let Err(e) = fs::rename(&tmp, &link).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(ByoeError::io(format!("updating {}", link.display()), e));
        }
        info!("Channel {} now points at {}", channel, snapshot.id);
        Ok(previous)
    }

    async fn acquire_channel_lock(&self, channel: Channel) -> ByoeResult<PathBuf> {
        let lock = self.channels_dir.join(format!(".{}.lock", channel));
        for _ in 0..CHANNEL_LOCK_ATTEMPTS {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock)
                .await
            {
                Ok(_) => return Ok(lock),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let age = fs::metadata(&lock)
                        .await
                        .ok()
                        .and_then(|m| m.modified().ok())
                        .and_then(|t| t.elapsed().ok());
                    if age.is_some_and(|age| age > CHANNEL_LOCK_STALE) {
                        warn!("Removing stale channel lock {}", lock.display());
                        let _ = fs::remove_file(&lock).await;
                        continue;
                    }
                    tokio::time::sleep(CHANNEL_LOCK_RETRY).await;
                }
                Err(e) => return Err(ByoeError::io(format!("creating {}", lock.display()), e)),
            }
        }
        Err(ByoeError::ChannelLocked(channel.to_string()))
    }

    /// Reduce old snapshots of a channel to their lock records.
    ///
    /// The newest `keep` published snapshots and the channel's current
    /// target keep their views. Failed snapshots older than the oldest
    /// retained one are pruned too. Returns the pruned ids.
    pub async fn apply_retention(&self, channel: Channel, keep: usize) -> ByoeResult<Vec<SnapId>> {
        let snapshots = self.list().await?;
        let current = self.current(channel).await?;

        let mut published: Vec<&SnapId> = snapshots
            .iter()
            .filter(|s| s.channel == channel && s.status == SnapshotStatus::Published)
            .map(|s| &s.id)
            .collect();
        published.sort_by(|a, b| b.cmp(a));
        let retained: Vec<SnapId> = published.into_iter().take(keep.max(1)).cloned().collect();
        let oldest_retained = retained.last().cloned();

        let mut pruned = Vec::new();
        for mut snapshot in snapshots {
            if snapshot.channel != channel || snapshot.pruned {
                continue;
            }
            let prune = match snapshot.status {
                SnapshotStatus::Published => {
                    !retained.contains(&snapshot.id) && current.as_ref() != Some(&snapshot.id)
                }
                SnapshotStatus::Failed => oldest_retained
                    .as_ref()
                    .is_some_and(|oldest| snapshot.id < *oldest),
                SnapshotStatus::Building | SnapshotStatus::Validated => false,
            };
            if !prune {
                continue;
            }

            let views = snapshot.views_dir();
            match fs::remove_dir_all(&views).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(ByoeError::io(format!("removing {}", views.display()), e)),
            }
            snapshot.pruned = true;
            snapshot.touch();
            self.save(&snapshot).await?;
            info!("Pruned snapshot {} to its lock records", snapshot.id);
            pruned.push(snapshot.id);
        }
        Ok(pruned)
    }

    /// Hashes referenced by any snapshot that still has views
    pub async fn referenced_hashes(&self) -> ByoeResult<HashSet<NodeHash>> {
        let mut hashes = HashSet::new();
        for snapshot in self.list().await? {
            if snapshot.pruned {
                continue;
            }
            for record in snapshot.lock_records().await? {
                hashes.extend(record.nodes.into_iter().map(|n| n.hash));
            }
        }
        Ok(hashes)
    }

    /// Remove cache entries no full snapshot references.
    ///
    /// Refuses to run while a snapshot build is in progress, since its
    /// lock records are not final yet.
    pub async fn gc(&self, cache: &BuildCache, dry_run: bool) -> ByoeResult<GcReport> {
        let running = self.in_progress().await?;
        if let Some(id) = running.first() {
            return Err(ByoeError::User(format!(
                "snapshot {id} is being built; run cache gc after it finishes"
            )));
        }

        let referenced = self.referenced_hashes().await?;
        let mut report = GcReport {
            dry_run,
            ..Default::default()
        };
        for entry in cache.list().await? {
            if referenced.contains(&entry.hash) {
                report.kept += 1;
                continue;
            }
            if cache.is_leased(&entry.hash).await {
                report.leased += 1;
                continue;
            }
            report.freed_bytes += entry.size_bytes();
            if !dry_run {
                cache.remove(&entry.hash).await?;
                debug!("Removed {} from cache", entry.label());
            }
            report.removed.push(entry);
        }
        Ok(report)
    }

    /// The published, unlabeled snapshot a channel should use at `now`.
    ///
    /// Picks the first snapshot taken since the start of the channel's
    /// current update period, or the newest one before it.
    pub async fn select_for_period(
        &self,
        channel: Channel,
        now: NaiveDateTime,
    ) -> ByoeResult<Option<SnapId>> {
        let mut candidates: Vec<SnapId> = self
            .list()
            .await?
            .into_iter()
            .filter(|s| s.status == SnapshotStatus::Published && !s.id.is_labeled())
            .map(|s| s.id)
            .collect();
        candidates.sort();
        Ok(select_for_period(&candidates, channel.update_months(), now))
    }

    /// Load the snapshot a reader following `channel`'s update period gets
    pub async fn resolve_for_period(
        &self,
        channel: Channel,
        now: NaiveDateTime,
    ) -> ByoeResult<Snapshot> {
        let id = self
            .select_for_period(channel, now)
            .await?
            .ok_or_else(|| ByoeError::NoCurrentSnapshot(channel.to_string()))?;
        debug!("Channel {} selects snapshot {}", channel, id);
        self.load(&id).await
    }
}

/// First instant of the update period containing `now`
pub fn period_start(months: u32, now: NaiveDateTime) -> NaiveDateTime {
    let months = months.max(1);
    let date = if months >= 12 {
        let years = (months / 12) as i32;
        let year = now.year() - now.year().rem_euclid(years);
        NaiveDate::from_ymd_opt(year, 1, 1)
    } else {
        let month = now.month() - ((now.month() - 1) % months);
        NaiveDate::from_ymd_opt(now.year(), month, 1)
    };
    date.and_then(|d| d.and_hms_opt(0, 0, 0)).unwrap_or(now)
}

fn select_for_period(sorted: &[SnapId], months: u32, now: NaiveDateTime) -> Option<SnapId> {
    let start = period_start(months, now);
    sorted
        .iter()
        .find(|id| id.timestamp >= start && id.timestamp <= now)
        .or_else(|| sorted.iter().rev().find(|id| id.timestamp < start))
        .cloned()
}
