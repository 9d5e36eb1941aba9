//! Job store abstractions with in-memory and manifest-file backends.

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

mod file;

pub use file::FileJobStore;
pub use hashq_types::{JobRecord, JobStatus, StatusTransitionError};

/// Result type for job store operations.
pub type StoreResult<T> = Result<T, JobStoreError>;

/// Mutation applied to a record inside the store's write critical section.
///
/// Returning an error leaves the stored record untouched.
pub type JobMutation<'a> = Box<dyn FnOnce(&mut JobRecord) -> StoreResult<()> + Send + 'a>;

/// Decision over the full job set, made inside the store's write critical
/// section. Every returned record is written back, inserted if new.
pub type JobBatch<'a> =
    Box<dyn FnOnce(&[JobRecord]) -> StoreResult<Vec<JobRecord>> + Send + 'a>;

/// Errors returned by store implementations.
#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("job '{0}' not found")]
    NotFound(String),
    #[error("job '{0}' already exists")]
    AlreadyExists(String),
    #[error("invalid job status transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("job store persistence failed: {0}")]
    Persistence(String),
}

impl From<StatusTransitionError> for JobStoreError {
    fn from(error: StatusTransitionError) -> Self {
        Self::InvalidTransition {
            from: error.from,
            to: error.to,
        }
    }
}

/// Async store contract; the single owner of job records.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, record: JobRecord) -> StoreResult<()>;
    async fn get(&self, job_id: &str) -> StoreResult<Option<JobRecord>>;
    /// Returns every record, newest first.
    async fn list(&self) -> StoreResult<Vec<JobRecord>>;
    /// Applies `mutation` atomically and returns the resulting record.
    async fn update(&self, job_id: &str, mutation: JobMutation<'_>) -> StoreResult<JobRecord>;
    async fn remove(&self, job_id: &str) -> StoreResult<Option<JobRecord>>;
    /// Reads every record and writes back what `batch` returns, with no other
    /// writer in between. Returns the written records.
    async fn transact(&self, batch: JobBatch<'_>) -> StoreResult<Vec<JobRecord>>;

    /// Describes degraded durability, if any write has failed to reach disk.
    fn persistence_warning(&self) -> Option<String> {
        None
    }
}

/// Orders records newest first, falling back to id for equal timestamps.
pub fn sort_newest_first(records: &mut [JobRecord]) {
    records.sort_by(|left, right| {
        right
            .created_at
            .cmp(&left.created_at)
            .then_with(|| right.id.cmp(&left.id))
    });
}

/// In-memory implementation for tests and embedded use.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    records: RwLock<HashMap<String, JobRecord>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, record: JobRecord) -> StoreResult<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.id) {
            return Err(JobStoreError::AlreadyExists(record.id));
        }
        records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get(&self, job_id: &str) -> StoreResult<Option<JobRecord>> {
        Ok(self.records.read().await.get(job_id).cloned())
    }

    async fn list(&self) -> StoreResult<Vec<JobRecord>> {
        let mut records = self
            .records
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        sort_newest_first(&mut records);
        Ok(records)
    }

    async fn update(&self, job_id: &str, mutation: JobMutation<'_>) -> StoreResult<JobRecord> {
        let mut records = self.records.write().await;
        let current = records
            .get_mut(job_id)
            .ok_or_else(|| JobStoreError::NotFound(job_id.to_string()))?;
        let mut next = current.clone();
        mutation(&mut next)?;
        *current = next.clone();
        Ok(next)
    }

    async fn remove(&self, job_id: &str) -> StoreResult<Option<JobRecord>> {
        Ok(self.records.write().await.remove(job_id))
    }

    async fn transact(&self, batch: JobBatch<'_>) -> StoreResult<Vec<JobRecord>> {
        let mut records = self.records.write().await;
        let mut current = records.values().cloned().collect::<Vec<_>>();
        sort_newest_first(&mut current);
        let written = batch(&current)?;
        for record in &written {
            records.insert(record.id.clone(), record.clone());
        }
        Ok(written)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{DateTime, Duration, Utc};
    use hashq_types::{JobRecord, JobRequest};
    use std::path::PathBuf;

    pub fn record(id: &str, created_offset_secs: i64) -> JobRecord {
        let base = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap_or_else(Utc::now);
        let request = JobRequest {
            hash_mode: "0".to_string(),
            attack_mode: "0".to_string(),
            hash_input_path: PathBuf::from(format!("/tmp/{id}.hashes")),
            wordlist_path: PathBuf::from("/tmp/wordlist.txt"),
            ..JobRequest::default()
        };
        JobRecord::from_request(
            id,
            &request,
            PathBuf::from(format!("/tmp/hashcat_{id}.txt")),
            PathBuf::from(format!("/tmp/hashcat_{id}.cracked")),
            base + Duration::seconds(created_offset_secs),
        )
    }
}
