//! Filesystem-backed build cache

use crate::cache::entry::CacheEntry;
use crate::cache::lease::{Lease, LeaseInfo};
use crate::concretize::record::write_atomic;
use crate::concretize::{BuildMetadata, ConcreteNode, NodeHash};
use crate::error::{ByoeError, ByoeResult};
use chrono::{Duration, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

const ENTRY_FILE: &str = "entry.json";
const ARTIFACT_DIR: &str = "artifact";
const RESERVE_ATTEMPTS: usize = 5;
const RECLAIM_LOCK_TIMEOUT_SECS: i64 = 60;
const RECLAIM_RETRY_MS: u64 = 20;

/// Outcome of [`BuildCache::reserve`]
#[derive(Debug, Clone)]
pub enum Reservation {
    /// Already committed, nothing to build
    Cached(CacheEntry),
    /// The caller must build, then commit or abandon
    Granted(Lease),
    /// Another live holder is building it
    AlreadyBuilding(LeaseInfo),
}

/// Content-addressed artifact store with exclusive build leases
#[derive(Debug, Clone)]
pub struct BuildCache {
    root: PathBuf,
    holder: Uuid,
    stale_after: Duration,
}

impl BuildCache {
    /// Open (creating if needed) a cache rooted at `root`
    pub async fn open(root: impl Into<PathBuf>, stale_after_secs: u64) -> ByoeResult<Self> {
        let cache = Self {
            root: root.into(),
            holder: Uuid::new_v4(),
            stale_after: Duration::seconds(i64::try_from(stale_after_secs).unwrap_or(i64::MAX)),
        };
        for dir in [
            cache.artifacts_dir(),
            cache.leases_dir(),
            cache.staging_dir(),
            cache.jobs_dir(),
        ] {
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| ByoeError::io(format!("creating {}", dir.display()), e))?;
        }
        Ok(cache)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Holder id stamped on every lease this handle takes
    pub fn holder(&self) -> Uuid {
        self.holder
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.root.join("artifacts")
    }

    pub fn leases_dir(&self) -> PathBuf {
        self.root.join("leases")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join("staging")
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.root.join("jobs")
    }

    pub fn entry_dir(&self, hash: &NodeHash) -> PathBuf {
        self.artifacts_dir().join(hash.shard()).join(hash.as_str())
    }

    fn lease_path(&self, hash: &NodeHash) -> PathBuf {
        self.leases_dir().join(format!("{}.lease", hash))
    }

    fn reclaim_lock_path(&self, hash: &NodeHash) -> PathBuf {
        self.leases_dir().join(format!("{}.reclaim", hash))
    }

    /// Committed entry for `hash`, if any
    pub async fn lookup(&self, hash: &NodeHash) -> ByoeResult<Option<CacheEntry>> {
        let path = self.entry_dir(hash).join(ENTRY_FILE);
        match fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ByoeError::io(format!("reading {}", path.display()), e)),
        }
    }

    pub async fn is_leased(&self, hash: &NodeHash) -> bool {
        fs::try_exists(self.lease_path(hash)).await.unwrap_or(false)
    }

    /// Claim the right to build `hash`.
    ///
    /// The lease file is linked into place, which fails if it exists, so
    /// exactly one caller across all processes gets `Granted`.
    pub async fn reserve(&self, hash: &NodeHash) -> ByoeResult<Reservation> {
        let path = self.lease_path(hash);

        for _ in 0..RESERVE_ATTEMPTS {
            if let Some(entry) = self.lookup(hash).await? {
                return Ok(Reservation::Cached(entry));
            }

            let info = LeaseInfo::new(self.holder);
            if self.create_lease(&path, &info).await? {
                // A holder may have committed between lookup and create
                if let Some(entry) = self.lookup(hash).await? {
                    remove_if_exists(&path).await?;
                    return Ok(Reservation::Cached(entry));
                }
                debug!("Lease granted for {}", hash.short());
                return Ok(Reservation::Granted(Lease {
                    hash: hash.clone(),
                    info,
                    path,
                }));
            }

            let Some(current) = read_lease(&path).await? else {
                continue;
            };
            if current.holder == self.holder {
                return Ok(Reservation::AlreadyBuilding(current));
            }
            if !current.is_stale(self.stale_after, Utc::now()) {
                return Ok(Reservation::AlreadyBuilding(current));
            }
            self.reclaim(hash, &path, &current).await?;
        }

        Err(ByoeError::lease(hash, "lease contended, giving up"))
    }

    /// Write the lease to a private file and hard-link it into place
    async fn create_lease(&self, path: &Path, info: &LeaseInfo) -> ByoeResult<bool> {
        let tmp = self
            .leases_dir()
            .join(format!(".{}.tmp", Uuid::new_v4()));
        fs::write(&tmp, serde_json::to_vec(info)?)
            .await
            .map_err(|e| ByoeError::io(format!("writing {}", tmp.display()), e))?;

        let linked = fs::hard_link(&tmp, path).await;
        remove_if_exists(&tmp).await?;
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(ByoeError::io(format!("creating lease {}", path.display()), e)),
        }
    }

    /// Remove the stale lease `stale` read from `path`.
    ///
    /// Reclaimers of one hash take turns through a `.reclaim` lock file, so
    /// a reclaimer that read the stale lease late cannot remove the fresh
    /// lease an earlier reclaimer was granted. The lock is skipped over once
    /// it is older than a minute.
    async fn reclaim(&self, hash: &NodeHash, path: &Path, stale: &LeaseInfo) -> ByoeResult<()> {
        let lock = self.reclaim_lock_path(hash);
        let mine = LeaseInfo::new(self.holder);
        if !self.create_lease(&lock, &mine).await? {
            if let Some(other) = read_lease(&lock).await? {
                if Utc::now() - other.acquired_at > Duration::seconds(RECLAIM_LOCK_TIMEOUT_SECS) {
                    warn!("Clearing abandoned reclaim lock for {}", hash.short());
                    remove_if_exists(&lock).await?;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(RECLAIM_RETRY_MS)).await;
            return Ok(());
        }

        let result = self.reclaim_locked(hash, path, stale).await;
        match read_lease(&lock).await {
            Ok(Some(current)) if current.holder == self.holder => remove_if_exists(&lock).await?,
            Ok(_) => {}
            Err(e) => warn!("{}", e),
        }
        result
    }

    async fn reclaim_locked(&self, hash: &NodeHash, path: &Path, stale: &LeaseInfo) -> ByoeResult<()> {
        if read_lease(path).await?.as_ref() != Some(stale) {
            return Ok(());
        }

        let aside = self
            .leases_dir()
            .join(format!(".stale-{}-{}", hash, Uuid::new_v4()));
        match fs::rename(path, &aside).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(ByoeError::io(format!("reclaiming {}", path.display()), e)),
        }

        match read_lease(&aside).await? {
            Some(moved) if moved == *stale => {
                info!(
                    "Reclaimed stale lease for {} (holder {} on {}, pid {})",
                    hash.short(),
                    moved.holder,
                    moved.host,
                    moved.pid
                );
            }
            Some(moved) => {
                // Released and re-granted since it was read
                if let Err(e) = fs::hard_link(&aside, path).await {
                    warn!(
                        "Lease for {} held by {} was displaced during reclaim; the holder will see it lost: {}",
                        hash.short(),
                        moved.holder,
                        e
                    );
                }
            }
            None => {}
        }
        remove_if_exists(&aside).await
    }

    /// Refresh the heartbeat of a lease this process holds
    pub async fn heartbeat(&self, lease: &mut Lease) -> ByoeResult<()> {
        match read_lease(&lease.path).await? {
            Some(current) if current.holder == lease.info.holder => {}
            _ => return Err(ByoeError::lease(&lease.hash, "lease lost")),
        }
        lease.info.heartbeat_at = Utc::now();
        write_atomic(&lease.path, &serde_json::to_vec(&lease.info)?).await
    }

    /// Fresh staging directory; the install prefix is `<dir>/artifact`
    pub async fn prepare_staging(&self, lease: &Lease) -> ByoeResult<PathBuf> {
        let dir = self
            .staging_dir()
            .join(format!("{}.{}", lease.hash, Uuid::new_v4()));
        let prefix = dir.join(ARTIFACT_DIR);
        fs::create_dir_all(&prefix)
            .await
            .map_err(|e| ByoeError::io(format!("creating {}", prefix.display()), e))?;
        Ok(dir)
    }

    /// Install prefix inside a staging directory
    pub fn staged_prefix(staging: &Path) -> PathBuf {
        staging.join(ARTIFACT_DIR)
    }

    /// Move a staged artifact into the cache and release the lease.
    ///
    /// The artifact is renamed in first; `entry.json` goes last, so readers
    /// never see an entry without its artifact. The lease is released even
    /// when the move fails.
    pub async fn commit(
        &self,
        lease: Lease,
        node: &ConcreteNode,
        staging: &Path,
        build: BuildMetadata,
    ) -> ByoeResult<CacheEntry> {
        let result = match self.lookup(&lease.hash).await {
            Ok(Some(existing)) => Ok(existing),
            Ok(None) => self.move_into_place(&lease.hash, node, staging, build).await,
            Err(e) => Err(e),
        };
        let released = self.abandon(lease, Some(staging)).await;
        let entry = result?;
        released?;
        Ok(entry)
    }

    async fn move_into_place(
        &self,
        hash: &NodeHash,
        node: &ConcreteNode,
        staging: &Path,
        build: BuildMetadata,
    ) -> ByoeResult<CacheEntry> {
        let dir = self.entry_dir(hash);
        let artifact = dir.join(ARTIFACT_DIR);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| ByoeError::io(format!("creating {}", dir.display()), e))?;
        if fs::try_exists(&artifact).await.unwrap_or(false) {
            // Leftover of a commit that died before writing entry.json
            fs::remove_dir_all(&artifact)
                .await
                .map_err(|e| ByoeError::io(format!("removing {}", artifact.display()), e))?;
        }
        fs::rename(Self::staged_prefix(staging), &artifact)
            .await
            .map_err(|e| ByoeError::io(format!("moving artifact into {}", dir.display()), e))?;

        let entry = CacheEntry {
            hash: hash.clone(),
            ecosystem: node.ecosystem,
            name: node.name.clone(),
            version: node.version.clone(),
            artifact,
            build,
            committed_at: Utc::now(),
        };
        write_atomic(&dir.join(ENTRY_FILE), &serde_json::to_vec_pretty(&entry)?).await?;
        info!("Cached {} ({})", entry.label(), entry.hash.short());
        Ok(entry)
    }

    /// Release a lease without committing, discarding any staged files
    pub async fn abandon(&self, lease: Lease, staging: Option<&Path>) -> ByoeResult<()> {
        if let Some(dir) = staging {
            if let Err(e) = fs::remove_dir_all(dir).await {
                if e.kind() != ErrorKind::NotFound {
                    warn!("Could not remove staging {}: {}", dir.display(), e);
                }
            }
        }
        match read_lease(&lease.path).await? {
            Some(current) if current.holder == lease.info.holder => {
                remove_if_exists(&lease.path).await
            }
            _ => {
                debug!("Lease for {} no longer ours", lease.hash.short());
                Ok(())
            }
        }
    }

    /// All committed entries, ordered by hash
    pub async fn list(&self) -> ByoeResult<Vec<CacheEntry>> {
        let mut entries = Vec::new();
        let mut shards = match fs::read_dir(self.artifacts_dir()).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(ByoeError::io("reading cache artifacts", e)),
        };
        while let Some(shard) = shards
            .next_entry()
            .await
            .map_err(|e| ByoeError::io("reading cache artifacts", e))?
        {
            let mut dirs = fs::read_dir(shard.path())
                .await
                .map_err(|e| ByoeError::io(format!("reading {}", shard.path().display()), e))?;
            while let Some(dir) = dirs
                .next_entry()
                .await
                .map_err(|e| ByoeError::io("reading cache shard", e))?
            {
                let Some(hash) = NodeHash::parse(&dir.file_name().to_string_lossy()) else {
                    continue;
                };
                if let Some(entry) = self.lookup(&hash).await? {
                    entries.push(entry);
                }
            }
        }
        entries.sort_by(|a, b| a.hash.cmp(&b.hash));
        Ok(entries)
    }

    /// Delete a committed entry.
    ///
    /// The directory is renamed out of `artifacts/` first so a reader never
    /// sees a half-deleted artifact.
    pub async fn remove(&self, hash: &NodeHash) -> ByoeResult<()> {
        let dir = self.entry_dir(hash);
        let trash = self
            .staging_dir()
            .join(format!(".trash-{}-{}", hash, Uuid::new_v4()));
        match fs::rename(&dir, &trash).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(ByoeError::io(format!("removing {}", dir.display()), e)),
        }
        fs::remove_dir_all(&trash)
            .await
            .map_err(|e| ByoeError::io(format!("removing {}", trash.display()), e))
    }
}

async fn read_lease(path: &Path) -> ByoeResult<Option<LeaseInfo>> {
    match fs::read_to_string(path).await {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(info) => Ok(Some(info)),
            Err(e) => {
                // Treat as stale: a torn write from a crashed holder
                warn!("Unreadable lease {}: {}", path.display(), e);
                Ok(Some(LeaseInfo {
                    holder: Uuid::nil(),
                    host: String::new(),
                    pid: 0,
                    acquired_at: chrono::DateTime::<Utc>::UNIX_EPOCH,
                    heartbeat_at: chrono::DateTime::<Utc>::UNIX_EPOCH,
                }))
            }
        },
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ByoeError::io(format!("reading {}", path.display()), e)),
    }
}

async fn remove_if_exists(path: &Path) -> ByoeResult<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ByoeError::io(format!("removing {}", path.display()), e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecosystem::Ecosystem;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn node(name: &str) -> ConcreteNode {
        ConcreteNode::new(Ecosystem::Spack, name, "1.0", BTreeMap::new(), None, vec![])
    }

    fn meta() -> BuildMetadata {
        BuildMetadata {
            duration_ms: 10,
            backend: "local".to_string(),
            job_id: None,
            built_at: Utc::now(),
        }
    }

    async fn granted(cache: &BuildCache, hash: &NodeHash) -> Lease {
        match cache.reserve(hash).await.unwrap() {
            Reservation::Granted(lease) => lease,
            other => panic!("expected grant, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reserve_build_commit_lookup() {
        let temp = TempDir::new().unwrap();
        let cache = BuildCache::open(temp.path(), 600).await.unwrap();
        let zlib = node("zlib");

        assert!(cache.lookup(&zlib.hash).await.unwrap().is_none());
        let lease = granted(&cache, &zlib.hash).await;
        assert!(cache.is_leased(&zlib.hash).await);

        let staging = cache.prepare_staging(&lease).await.unwrap();
        std::fs::write(BuildCache::staged_prefix(&staging).join("lib.so"), b"x").unwrap();

        let entry = cache.commit(lease, &zlib, &staging, meta()).await.unwrap();
        assert!(entry.artifact.join("lib.so").exists());
        assert!(!staging.exists());
        assert!(!cache.is_leased(&zlib.hash).await);

        match cache.reserve(&zlib.hash).await.unwrap() {
            Reservation::Cached(hit) => assert_eq!(hit, entry),
            other => panic!("expected cache hit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_reserver_sees_building() {
        let temp = TempDir::new().unwrap();
        let a = BuildCache::open(temp.path(), 600).await.unwrap();
        let b = BuildCache::open(temp.path(), 600).await.unwrap();
        let zlib = node("zlib");

        let lease = granted(&a, &zlib.hash).await;
        match b.reserve(&zlib.hash).await.unwrap() {
            Reservation::AlreadyBuilding(info) => assert_eq!(info.holder, a.holder()),
            other => panic!("expected building, got {other:?}"),
        }

        a.abandon(lease, None).await.unwrap();
        granted(&b, &zlib.hash).await;
    }

    #[tokio::test]
    async fn concurrent_reserves_grant_once() {
        let temp = TempDir::new().unwrap();
        let hash = node("hdf5").hash;
        let mut handles = Vec::new();
        for _ in 0..8 {
            let root = temp.path().to_path_buf();
            let hash = hash.clone();
            handles.push(tokio::spawn(async move {
                let cache = BuildCache::open(root, 600).await.unwrap();
                matches!(cache.reserve(&hash).await.unwrap(), Reservation::Granted(_))
            }));
        }
        let mut grants = 0;
        for h in handles {
            if h.await.unwrap() {
                grants += 1;
            }
        }
        assert_eq!(grants, 1);
    }

    #[tokio::test]
    async fn stale_lease_is_reclaimed() {
        let temp = TempDir::new().unwrap();
        let cache = BuildCache::open(temp.path(), 600).await.unwrap();
        let hash = node("zlib").hash;

        let mut dead = LeaseInfo::new(Uuid::new_v4());
        dead.heartbeat_at = Utc::now() - Duration::hours(2);
        std::fs::write(
            cache.lease_path(&hash),
            serde_json::to_vec(&dead).unwrap(),
        )
        .unwrap();

        let lease = granted(&cache, &hash).await;
        assert_eq!(lease.holder(), cache.holder());
    }

    #[tokio::test]
    async fn late_reclaimer_keeps_fresh_lease() {
        let temp = TempDir::new().unwrap();
        let a = BuildCache::open(temp.path(), 600).await.unwrap();
        let b = BuildCache::open(temp.path(), 600).await.unwrap();
        let hash = node("zlib").hash;
        let path = a.lease_path(&hash);

        let mut dead = LeaseInfo::new(Uuid::new_v4());
        dead.heartbeat_at = Utc::now() - Duration::hours(2);
        std::fs::write(&path, serde_json::to_vec(&dead).unwrap()).unwrap();

        // b reads the stale lease, then a reclaims it and is granted first
        let seen_by_b = read_lease(&path).await.unwrap().unwrap();
        let mut lease = granted(&a, &hash).await;
        b.reclaim(&hash, &path, &seen_by_b).await.unwrap();

        assert_eq!(read_lease(&path).await.unwrap().unwrap().holder, a.holder());
        assert!(matches!(
            b.reserve(&hash).await.unwrap(),
            Reservation::AlreadyBuilding(_)
        ));
        a.heartbeat(&mut lease).await.unwrap();
        assert!(!b.reclaim_lock_path(&hash).exists());
    }

    #[tokio::test]
    async fn abandoned_reclaim_lock_is_cleared() {
        let temp = TempDir::new().unwrap();
        let cache = BuildCache::open(temp.path(), 600).await.unwrap();
        let hash = node("zlib").hash;

        let mut dead = LeaseInfo::new(Uuid::new_v4());
        dead.heartbeat_at = Utc::now() - Duration::hours(2);
        std::fs::write(cache.lease_path(&hash), serde_json::to_vec(&dead).unwrap()).unwrap();
        let mut crashed = LeaseInfo::new(Uuid::new_v4());
        crashed.acquired_at = Utc::now() - Duration::hours(1);
        std::fs::write(
            cache.reclaim_lock_path(&hash),
            serde_json::to_vec(&crashed).unwrap(),
        )
        .unwrap();

        let lease = granted(&cache, &hash).await;
        assert_eq!(lease.holder(), cache.holder());
    }

    #[tokio::test]
    async fn failed_commit_releases_the_lease() {
        let temp = TempDir::new().unwrap();
        let cache = BuildCache::open(temp.path(), 600).await.unwrap();
        let zlib = node("zlib");
        let lease = granted(&cache, &zlib.hash).await;
        let staging = cache.prepare_staging(&lease).await.unwrap();
        std::fs::remove_dir_all(BuildCache::staged_prefix(&staging)).unwrap();

        assert!(cache.commit(lease, &zlib, &staging, meta()).await.is_err());
        assert!(!cache.is_leased(&zlib.hash).await);
        assert!(cache.lookup(&zlib.hash).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn heartbeat_refreshes_and_detects_loss() {
        let temp = TempDir::new().unwrap();
        let cache = BuildCache::open(temp.path(), 600).await.unwrap();
        let hash = node("zlib").hash;
        let mut lease = granted(&cache, &hash).await;

        let before = lease.info.heartbeat_at;
        cache.heartbeat(&mut lease).await.unwrap();
        assert!(lease.info.heartbeat_at >= before);

        std::fs::remove_file(cache.lease_path(&hash)).unwrap();
        assert!(cache.heartbeat(&mut lease).await.is_err());
    }

    #[tokio::test]
    async fn list_and_remove() {
        let temp = TempDir::new().unwrap();
        let cache = BuildCache::open(temp.path(), 600).await.unwrap();
        for name in ["a", "b"] {
            let n = node(name);
            let lease = granted(&cache, &n.hash).await;
            let staging = cache.prepare_staging(&lease).await.unwrap();
            cache.commit(lease, &n, &staging, meta()).await.unwrap();
        }
        assert_eq!(cache.list().await.unwrap().len(), 2);

        cache.remove(&node("a").hash).await.unwrap();
        let left = cache.list().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].name, "b");
    }
}
