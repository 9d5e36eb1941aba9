//! Durable store keeping one JSON manifest per job under `<state_dir>/jobs`.
//!
//! Disk is authoritative: every read goes back to the manifests so several
//! `hashq` processes can share one state directory. Writers are serialized
//! in-process by an async mutex and across processes by a lock file held for
//! the whole read-modify-write cycle. When a manifest cannot be written (or
//! the lock cannot be taken) the change is held in a pending overlay, reads
//! keep seeing it, and `persistence_warning` reports the degraded state until
//! a later write flushes it.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use hashq_core::{acquire_lock, remove_file_if_exists, write_text_atomic, FileLockGuard};
use hashq_types::JobRecord;
use tracing::warn;

use crate::{sort_newest_first, JobBatch, JobMutation, JobStore, JobStoreError, StoreResult};

const JOB_MANIFEST_DIR: &str = "jobs";
const STORE_LOCK_FILE: &str = ".store.lock";
const STORE_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const STORE_LOCK_STALE_AFTER: Duration = Duration::from_secs(30);

/// The held cross-process lock, or why it could not be taken.
type ProcessLock = Result<FileLockGuard, String>;

#[derive(Debug, Default)]
struct PendingWrites {
    records: HashMap<String, JobRecord>,
    removed: BTreeSet<String>,
    last_error: Option<String>,
}

impl PendingWrites {
    fn is_empty(&self) -> bool {
        self.records.is_empty() && self.removed.is_empty()
    }
}

/// Manifest-per-job store rooted at a state directory.
#[derive(Debug)]
pub struct FileJobStore {
    state_dir: PathBuf,
    writer: tokio::sync::Mutex<()>,
    pending: Mutex<PendingWrites>,
}

impl FileJobStore {
    /// Opens (creating if needed) the manifest directory under `state_dir`.
    pub fn open(state_dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let state_dir = state_dir.into();
        let jobs_dir = manifests_dir(&state_dir);
        std::fs::create_dir_all(&jobs_dir)?;
        Ok(Self {
            state_dir,
            writer: tokio::sync::Mutex::new(()),
            pending: Mutex::new(PendingWrites::default()),
        })
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Path of the manifest backing `job_id`.
    pub fn manifest_path(&self, job_id: &str) -> PathBuf {
        manifest_path(&self.state_dir, job_id)
    }

    fn read_current(&self, job_id: &str) -> StoreResult<Option<JobRecord>> {
        {
            let pending = lock_unpoisoned(&self.pending);
            if pending.removed.contains(job_id) {
                return Ok(None);
            }
            if let Some(record) = pending.records.get(job_id) {
                return Ok(Some(record.clone()));
            }
        }
        load_manifest(&self.manifest_path(job_id))
    }

    /// Writes `record` to disk, falling back to the pending overlay.
    fn commit(&self, lock: &ProcessLock, record: &JobRecord) {
        let outcome = match lock {
            Ok(_) => persist_manifest(&self.state_dir, record),
            Err(message) => Err(anyhow::anyhow!("{message}")),
        };
        let mut pending = lock_unpoisoned(&self.pending);
        pending.removed.remove(&record.id);
        match outcome {
            Ok(()) => {
                pending.records.remove(&record.id);
            }
            Err(error) => {
                let message = format!("{error:#}");
                warn!(job_id = %record.id, error = %message, "job manifest write failed; keeping change in memory");
                pending.records.insert(record.id.clone(), record.clone());
                pending.last_error = Some(message);
            }
        }
    }

    fn commit_removal(&self, lock: &ProcessLock, job_id: &str) {
        let outcome = match lock {
            Ok(_) => remove_file_if_exists(&self.manifest_path(job_id)).map(|_| ()),
            Err(message) => Err(anyhow::anyhow!("{message}")),
        };
        let mut pending = lock_unpoisoned(&self.pending);
        pending.records.remove(job_id);
        match outcome {
            Ok(()) => {
                pending.removed.remove(job_id);
            }
            Err(error) => {
                let message = format!("{error:#}");
                warn!(job_id, error = %message, "job manifest removal failed; hiding job in memory");
                pending.removed.insert(job_id.to_string());
                pending.last_error = Some(message);
            }
        }
    }

    /// Retries every change still held in the overlay.
    fn flush_pending(&self, lock: &ProcessLock) {
        if lock.is_err() {
            return;
        }
        let (records, removed) = {
            let pending = lock_unpoisoned(&self.pending);
            if pending.is_empty() {
                return;
            }
            (
                pending.records.values().cloned().collect::<Vec<_>>(),
                pending.removed.iter().cloned().collect::<Vec<_>>(),
            )
        };
        for record in &records {
            self.commit(lock, record);
        }
        for job_id in &removed {
            self.commit_removal(lock, job_id);
        }
        let mut pending = lock_unpoisoned(&self.pending);
        if pending.is_empty() {
            pending.last_error = None;
        }
    }

    /// Takes the cross-process lock for one read-modify-write cycle.
    ///
    /// A lock that cannot be taken is reported, not raised: the cycle still
    /// runs and its writes land in the pending overlay.
    async fn lock_process(&self) -> ProcessLock {
        let lock_path = manifests_dir(&self.state_dir).join(STORE_LOCK_FILE);
        acquire_lock(&lock_path, STORE_LOCK_TIMEOUT, STORE_LOCK_STALE_AFTER)
            .await
            .map_err(|error| format!("{error:#}"))
    }

    fn list_current(&self) -> StoreResult<Vec<JobRecord>> {
        let mut by_id = HashMap::new();
        for path in collect_manifest_paths(&self.state_dir)? {
            if let Some(record) = load_manifest(&path)? {
                by_id.insert(record.id.clone(), record);
            }
        }
        {
            let pending = lock_unpoisoned(&self.pending);
            for job_id in &pending.removed {
                by_id.remove(job_id);
            }
            for (job_id, record) in &pending.records {
                by_id.insert(job_id.clone(), record.clone());
            }
        }
        let mut records = by_id.into_values().collect::<Vec<_>>();
        sort_newest_first(&mut records);
        Ok(records)
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn insert(&self, record: JobRecord) -> StoreResult<()> {
        let _writer = self.writer.lock().await;
        let lock = self.lock_process().await;
        if self.read_current(&record.id)?.is_some() {
            return Err(JobStoreError::AlreadyExists(record.id));
        }
        self.flush_pending(&lock);
        self.commit(&lock, &record);
        Ok(())
    }

    async fn get(&self, job_id: &str) -> StoreResult<Option<JobRecord>> {
        self.read_current(job_id)
    }

    async fn list(&self) -> StoreResult<Vec<JobRecord>> {
        self.list_current()
    }

    async fn update(&self, job_id: &str, mutation: JobMutation<'_>) -> StoreResult<JobRecord> {
        let _writer = self.writer.lock().await;
        let lock = self.lock_process().await;
        let current = self
            .read_current(job_id)?
            .ok_or_else(|| JobStoreError::NotFound(job_id.to_string()))?;
        let mut next = current.clone();
        mutation(&mut next)?;
        self.flush_pending(&lock);
        if next != current {
            self.commit(&lock, &next);
        }
        Ok(next)
    }

    async fn remove(&self, job_id: &str) -> StoreResult<Option<JobRecord>> {
        let _writer = self.writer.lock().await;
        let lock = self.lock_process().await;
        let Some(current) = self.read_current(job_id)? else {
            return Ok(None);
        };
        self.flush_pending(&lock);
        self.commit_removal(&lock, job_id);
        Ok(Some(current))
    }

    async fn transact(&self, batch: JobBatch<'_>) -> StoreResult<Vec<JobRecord>> {
        let _writer = self.writer.lock().await;
        let lock = self.lock_process().await;
        let current = self.list_current()?;
        let written = batch(&current)?;
        self.flush_pending(&lock);
        for record in &written {
            self.commit(&lock, record);
        }
        Ok(written)
    }

    fn persistence_warning(&self) -> Option<String> {
        let pending = lock_unpoisoned(&self.pending);
        if pending.is_empty() {
            return None;
        }
        Some(format!(
            "job state is not durable: {} change(s) held in memory ({})",
            pending.records.len() + pending.removed.len(),
            pending
                .last_error
                .as_deref()
                .unwrap_or("unknown write failure")
        ))
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn manifests_dir(state_dir: &Path) -> PathBuf {
    state_dir.join(JOB_MANIFEST_DIR)
}

fn manifest_path(state_dir: &Path, job_id: &str) -> PathBuf {
    manifests_dir(state_dir).join(format!("{job_id}.json"))
}

fn persist_manifest(state_dir: &Path, record: &JobRecord) -> anyhow::Result<()> {
    let path = manifest_path(state_dir, &record.id);
    let mut payload = serde_json::to_string_pretty(record).context("failed to encode job record")?;
    payload.push('\n');
    write_text_atomic(&path, &payload).with_context(|| format!("failed to write {}", path.display()))
}

/// Loads one manifest; unreadable or corrupt manifests are skipped with a warning.
fn load_manifest(path: &Path) -> StoreResult<Option<JobRecord>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(error) => return Err(error.into()),
    };
    match serde_json::from_str::<JobRecord>(&raw) {
        Ok(record) => Ok(Some(record)),
        Err(error) => {
            warn!(path = %path.display(), %error, "skipping corrupt job manifest");
            Ok(None)
        }
    }
}

fn collect_manifest_paths(state_dir: &Path) -> StoreResult<Vec<PathBuf>> {
    let dir = manifests_dir(state_dir);
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let is_json = path
            .extension()
            .and_then(|value| value.to_str())
            .map(|value| value.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        if is_json {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}
