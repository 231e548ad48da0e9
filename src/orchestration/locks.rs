//! Resource lock manager.
//!
//! The single source of truth for "who may write where". Locks are exclusive,
//! time-bounded claims on normalized resource paths. Acquisition is
//! all-or-nothing across a task's path set, so a task never sits on half of
//! what it needs while waiting for the rest.
//!
//! Paths registered as critical additionally take a shared critical-section
//! token, which serializes every task touching any critical path.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::core::task::TaskId;
use crate::error::{Error, Result};
use crate::util::chrono_duration;
use crate::{mlog_debug, mlog_warn};

/// Resource name of the token shared by all critical paths.
pub const CRITICAL_SECTION: &str = "@critical";

/// An exclusive claim on one resource path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub resource_path: String,
    pub holder_task_id: TaskId,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lock {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// A requested path that is held by another task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConflict {
    pub path: String,
    pub holder: TaskId,
}

/// Result of an acquisition attempt. Nothing is held when `granted` is false.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockGrant {
    pub granted: bool,
    pub conflicts: Vec<LockConflict>,
}

impl LockGrant {
    pub fn into_result(self, task: &TaskId) -> Result<()> {
        if self.granted {
            Ok(())
        } else {
            Err(Error::LockConflict {
                task: task.clone(),
                conflicts: self.conflicts,
            })
        }
    }
}

/// Normalize a resource path: `./a//b/` and `a\b` both become `a/b`.
pub fn normalize_path(path: &str) -> String {
    let unified = path.trim().replace('\\', "/");
    unified
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Internally synchronized lock table with optional on-disk mirror.
#[derive(Debug, Default)]
pub struct ResourceLockManager {
    locks: Mutex<HashMap<String, Lock>>,
    critical: HashSet<String>,
    lock_dir: Option<PathBuf>,
}

impl ResourceLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_critical_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.critical = paths
            .into_iter()
            .map(|p| normalize_path(p.as_ref()))
            .filter(|p| !p.is_empty())
            .collect();
        self
    }

    /// Mirror every lock as a JSON file under `dir` so stuck runs can be
    /// inspected from outside the process.
    pub fn with_lock_dir(mut self, dir: PathBuf) -> Self {
        self.lock_dir = Some(dir);
        self
    }

    /// Rebuild a manager from the lock files a previous run left behind.
    pub fn from_lock_dir(dir: &Path) -> Result<Self> {
        let locks = list_lock_files(dir)?
            .into_iter()
            .map(|lock| (lock.resource_path.clone(), lock))
            .collect();
        Ok(Self {
            locks: Mutex::new(locks),
            critical: HashSet::new(),
            lock_dir: Some(dir.to_path_buf()),
        })
    }

    pub fn is_critical(&self, path: &str) -> bool {
        self.critical.contains(&normalize_path(path))
    }

    /// Normalized, de-duplicated resource set for a request, including the
    /// critical-section token when any critical path is touched.
    fn resources_for(&self, paths: &[String]) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut resources: Vec<String> = paths
            .iter()
            .map(|p| normalize_path(p))
            .filter(|p| !p.is_empty() && seen.insert(p.clone()))
            .collect();
        if resources.iter().any(|p| self.critical.contains(p)) {
            resources.push(CRITICAL_SECTION.to_string());
        }
        resources
    }

    pub async fn try_acquire(&self, task: &TaskId, paths: &[String], ttl: Duration) -> LockGrant {
        self.try_acquire_at(task, paths, ttl, Utc::now()).await
    }

    /// Grant every requested path to `task`, or none of them.
    ///
    /// Paths already held by `task` are refreshed. Expired locks held by other
    /// tasks are reclaimed on the spot.
    pub async fn try_acquire_at(
        &self,
        task: &TaskId,
        paths: &[String],
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> LockGrant {
        let resources = self.resources_for(paths);
        let mut locks = self.locks.lock().await;

        let mut conflicts = Vec::new();
        for resource in &resources {
            let Some(existing) = locks.get(resource) else {
                continue;
            };
            if existing.holder_task_id == *task {
                continue;
            }
            if existing.is_expired_at(now) {
                mlog_warn!(
                    "Reclaiming expired lock on {} held by {} (expired {})",
                    resource,
                    existing.holder_task_id,
                    existing.expires_at
                );
                locks.remove(resource);
                self.remove_file(resource);
                continue;
            }
            conflicts.push(LockConflict {
                path: resource.clone(),
                holder: existing.holder_task_id.clone(),
            });
        }

        if !conflicts.is_empty() {
            mlog_debug!(
                "Lock request by {} denied: {} conflict(s)",
                task,
                conflicts.len()
            );
            return LockGrant {
                granted: false,
                conflicts,
            };
        }

        let expires_at = now + chrono_duration(ttl);
        for resource in resources {
            let acquired_at = locks
                .get(&resource)
                .map(|l| l.acquired_at)
                .unwrap_or(now);
            let lock = Lock {
                resource_path: resource.clone(),
                holder_task_id: task.clone(),
                acquired_at,
                expires_at,
            };
            self.write_file(&lock);
            locks.insert(resource, lock);
        }
        mlog_debug!("Locks granted to {} until {}", task, expires_at);
        LockGrant {
            granted: true,
            conflicts: Vec::new(),
        }
    }

    /// Drop every lock held by `task`. Returns how many were released.
    pub async fn release(&self, task: &TaskId) -> usize {
        let mut locks = self.locks.lock().await;
        let held: Vec<String> = locks
            .iter()
            .filter(|(_, l)| l.holder_task_id == *task)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &held {
            locks.remove(path);
            self.remove_file(path);
        }
        if !held.is_empty() {
            mlog_debug!("Released {} lock(s) held by {}", held.len(), task);
        }
        held.len()
    }

    pub async fn renew(&self, task: &TaskId, ttl: Duration) -> usize {
        self.renew_at(task, ttl, Utc::now()).await
    }

    /// Push the expiry of every lock held by `task` to `now + ttl`.
    ///
    /// Returns 0 when the task holds nothing, which tells a running task its
    /// locks were reclaimed underneath it.
    pub async fn renew_at(&self, task: &TaskId, ttl: Duration, now: DateTime<Utc>) -> usize {
        let mut locks = self.locks.lock().await;
        let expires_at = now + chrono_duration(ttl);
        let mut renewed = 0;
        for lock in locks.values_mut().filter(|l| l.holder_task_id == *task) {
            lock.expires_at = expires_at;
            self.write_file(lock);
            renewed += 1;
        }
        renewed
    }

    pub async fn reclaim_expired(&self) -> Vec<Lock> {
        self.reclaim_expired_at(Utc::now()).await
    }

    /// Remove every lock whose expiry has passed. A no-op when none have.
    pub async fn reclaim_expired_at(&self, now: DateTime<Utc>) -> Vec<Lock> {
        let mut locks = self.locks.lock().await;
        let expired: Vec<String> = locks
            .iter()
            .filter(|(_, l)| l.is_expired_at(now))
            .map(|(path, _)| path.clone())
            .collect();

        let mut reclaimed = Vec::with_capacity(expired.len());
        for path in expired {
            if let Some(lock) = locks.remove(&path) {
                mlog_warn!(
                    "Reclaimed stale lock on {} held by {} (expired {})",
                    lock.resource_path,
                    lock.holder_task_id,
                    lock.expires_at
                );
                self.remove_file(&path);
                reclaimed.push(lock);
            }
        }
        reclaimed
    }

    pub async fn holder_of(&self, path: &str) -> Option<TaskId> {
        let locks = self.locks.lock().await;
        locks
            .get(&normalize_path(path))
            .map(|l| l.holder_task_id.clone())
    }

    pub async fn held_by(&self, task: &TaskId) -> Vec<Lock> {
        let locks = self.locks.lock().await;
        let mut held: Vec<Lock> = locks
            .values()
            .filter(|l| l.holder_task_id == *task)
            .cloned()
            .collect();
        held.sort_by(|a, b| a.resource_path.cmp(&b.resource_path));
        held
    }

    /// All live locks, sorted by path.
    pub async fn snapshot(&self) -> Vec<Lock> {
        let locks = self.locks.lock().await;
        let mut all: Vec<Lock> = locks.values().cloned().collect();
        all.sort_by(|a, b| a.resource_path.cmp(&b.resource_path));
        all
    }

    fn write_file(&self, lock: &Lock) {
        let Some(dir) = &self.lock_dir else {
            return;
        };
        let path = lock_file_path(dir, &lock.resource_path);
        let written = std::fs::create_dir_all(dir)
            .map_err(Error::from)
            .and_then(|_| Ok(serde_json::to_string_pretty(lock)?))
            .and_then(|json| Ok(std::fs::write(&path, json)?));
        if let Err(e) = written {
            mlog_warn!("Could not write lock file {}: {}", path.display(), e);
        }
    }

    fn remove_file(&self, resource: &str) {
        let Some(dir) = &self.lock_dir else {
            return;
        };
        let path = lock_file_path(dir, resource);
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                mlog_warn!("Could not remove lock file {}: {}", path.display(), e);
            }
        }
    }
}

/// `<dir>/<escaped path>.lock`; the escape keeps one flat directory.
pub fn lock_file_path(dir: &Path, resource: &str) -> PathBuf {
    let mut name = String::with_capacity(resource.len() + 5);
    for byte in resource.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' => name.push(byte as char),
            other => name.push_str(&format!("%{:02X}", other)),
        }
    }
    name.push_str(".lock");
    dir.join(name)
}

/// Read every lock file in `dir`, sorted by resource path. Unreadable files
/// are skipped with a warning.
pub fn list_lock_files(dir: &Path) -> Result<Vec<Lock>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut locks = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("lock") {
            continue;
        }
        match std::fs::read_to_string(&path)
            .map_err(Error::from)
            .and_then(|raw| Ok(serde_json::from_str::<Lock>(&raw)?))
        {
            Ok(lock) => locks.push(lock),
            Err(e) => mlog_warn!("Skipping unreadable lock file {}: {}", path.display(), e),
        }
    }
    locks.sort_by(|a, b| a.resource_path.cmp(&b.resource_path));
    Ok(locks)
}
