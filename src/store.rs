//! Job record storage.
//!
//! A [`JobStore`] holds one record per job, keyed by id. After `create`, the
//! only write primitive is [`JobStore::compare_and_swap`], conditioned on the
//! record version observed by the writer. [`Records`] builds everything else
//! on top of that: read-modify-CAS loops, field-level patches and bounded
//! retry of transient backend failures.
//!
//! Because every status transition and lease write is a CAS on the version, a
//! worker holding a stale copy of a record can never overwrite a newer one,
//! in particular it cannot resurrect a job past its terminal write.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::config::RetryConfig;
use crate::error::{Error, Result};
use crate::job::{Job, JobId, PhaseFault};
use crate::retry::with_backoff;

/// A record together with the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new record at version 1. Fails with `AlreadyExists` on id collision.
    async fn create(&self, job: Job) -> Result<Versioned<Job>>;

    /// Fails with `NotFound` for unknown or purged ids.
    async fn get(&self, id: JobId) -> Result<Versioned<Job>>;

    /// Replace the record only if its version is still `expected_version`.
    /// Fails with `VersionConflict` otherwise.
    async fn compare_and_swap(
        &self,
        id: JobId,
        expected_version: u64,
        job: Job,
    ) -> Result<Versioned<Job>>;

    /// Schedule purge `retention` after the record's terminal write. Fails
    /// with `Conflict` if the job is not terminal yet.
    async fn expire_after(&self, id: JobId, retention: Duration) -> Result<()>;

    /// Drop every record whose purge deadline has passed. Returns how many.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize>;

    async fn len(&self) -> Result<usize>;
}

fn is_purged(job: &Job, now: DateTime<Utc>) -> bool {
    job.purge_at.is_some_and(|at| now >= at)
}

/// In-process store. Cloning shares the underlying map, so every worker
/// holding a clone coordinates through the same records.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: Arc<RwLock<HashMap<JobId, Versioned<Job>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create(&self, job: Job) -> Result<Versioned<Job>> {
        let mut records = self.records.write().await;
        if let Some(existing) = records.get(&job.id) {
            if !is_purged(&existing.value, Utc::now()) {
                return Err(Error::AlreadyExists(job.id));
            }
        }
        let record = Versioned {
            version: 1,
            value: job,
        };
        records.insert(record.value.id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: JobId) -> Result<Versioned<Job>> {
        let records = self.records.read().await;
        match records.get(&id) {
            Some(record) if !is_purged(&record.value, Utc::now()) => Ok(record.clone()),
            _ => Err(Error::NotFound(id)),
        }
    }

    async fn compare_and_swap(
        &self,
        id: JobId,
        expected_version: u64,
        job: Job,
    ) -> Result<Versioned<Job>> {
        let mut records = self.records.write().await;
        let record = match records.get_mut(&id) {
            Some(record) if !is_purged(&record.value, Utc::now()) => record,
            _ => return Err(Error::NotFound(id)),
        };
        if record.version != expected_version {
            return Err(Error::VersionConflict(id));
        }
        record.version += 1;
        record.value = job;
        Ok(record.clone())
    }

    async fn expire_after(&self, id: JobId, retention: Duration) -> Result<()> {
        let mut records = self.records.write().await;
        let record = match records.get_mut(&id) {
            Some(record) if !is_purged(&record.value, Utc::now()) => record,
            _ => return Err(Error::NotFound(id)),
        };
        let terminal_at = match (record.value.is_terminal(), record.value.terminal_at) {
            (true, Some(at)) => at,
            _ => {
                return Err(Error::Conflict(format!(
                    "job {} is {}, retention applies to terminal jobs only",
                    id, record.value.status
                )))
            }
        };
        let retention = chrono::Duration::from_std(retention)
            .map_err(|e| Error::InvalidConfig(format!("retention out of range: {}", e)))?;
        record.value.purge_at = Some(terminal_at + retention);
        record.version += 1;
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| !is_purged(&record.value, now));
        Ok(before - records.len())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.records.read().await.len())
    }
}

/// Progress fields written after each phase. Progress and elapsed time never
/// move backwards.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub current_phase_index: Option<usize>,
    pub phases_completed: Option<usize>,
    pub progress_percent: Option<u8>,
    pub elapsed: Option<Duration>,
    pub attempts: Option<u64>,
    pub fault: Option<PhaseFault>,
}

impl JobPatch {
    pub fn apply(self, job: &mut Job) {
        if let Some(index) = self.current_phase_index {
            job.current_phase_index = index;
        }
        if let Some(done) = self.phases_completed {
            job.phases_completed = job.phases_completed.max(done);
        }
        if let Some(progress) = self.progress_percent {
            job.progress_percent = job.progress_percent.max(progress.min(100));
        }
        if let Some(elapsed) = self.elapsed {
            job.elapsed = job.elapsed.max(elapsed);
        }
        if let Some(attempts) = self.attempts {
            job.attempts = job.attempts.max(attempts);
        }
        if let Some(fault) = self.fault {
            job.faults.push(fault);
        }
    }
}

/// Shared handle over a [`JobStore`] with retry and CAS-loop helpers.
#[derive(Clone)]
pub struct Records {
    store: Arc<dyn JobStore>,
    retry: RetryConfig,
}

impl Records {
    pub fn new(store: Arc<dyn JobStore>, retry: RetryConfig) -> Self {
        Self { store, retry }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), RetryConfig::default())
    }

    pub async fn create(&self, job: Job) -> Result<Job> {
        let record = with_backoff(&self.retry, "create", || self.store.create(job.clone())).await?;
        Ok(record.value)
    }

    pub async fn get(&self, id: JobId) -> Result<Job> {
        Ok(self.get_versioned(id).await?.value)
    }

    pub async fn get_versioned(&self, id: JobId) -> Result<Versioned<Job>> {
        with_backoff(&self.retry, "get", || self.store.get(id)).await
    }

    /// Read-modify-write `id` atomically. `mutate` sees the latest record and
    /// may veto the write by returning an error, which is passed through
    /// untouched. The closure runs again on every lost CAS round.
    pub async fn modify<F>(&self, id: JobId, mut mutate: F) -> Result<Job>
    where
        F: FnMut(&mut Job) -> Result<()> + Send,
    {
        for round in 0..self.retry.max_cas_attempts {
            let current = self.get_versioned(id).await?;
            let mut next = current.value.clone();
            mutate(&mut next)?;
            if next == current.value {
                return Ok(next);
            }

            let written = with_backoff(&self.retry, "compare_and_swap", || {
                self.store
                    .compare_and_swap(id, current.version, next.clone())
            })
            .await;
            match written {
                Ok(record) => return Ok(record.value),
                Err(Error::VersionConflict(_)) => {
                    tracing::debug!(job_id = %id, round, "CAS lost, re-reading record");
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::VersionConflict(id))
    }

    /// Apply a progress patch with no ownership check.
    pub async fn update(&self, id: JobId, patch: JobPatch) -> Result<Job> {
        self.modify(id, |job| {
            patch.clone().apply(job);
            Ok(())
        })
        .await
    }

    pub async fn expire_after(&self, id: JobId, retention: Duration) -> Result<()> {
        with_backoff(&self.retry, "expire_after", || {
            self.store.expire_after(id, retention)
        })
        .await
    }

    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        with_backoff(&self.retry, "purge_expired", || self.store.purge_expired(now)).await
    }

    pub async fn len(&self) -> Result<usize> {
        with_backoff(&self.retry, "len", || self.store.len()).await
    }
}
