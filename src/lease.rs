use std::time::Duration;

use chrono::Utc;

use crate::error::{Error, Result};
use crate::job::{Job, JobId, JobResult, JobStatus, Lease};
use crate::store::{JobPatch, Records};

/// How a leased job ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// `Found` results become `success`, `Failed` results become `failed`.
    Completed(JobResult),
    Cancelled { attempts: u64 },
}

impl Outcome {
    pub fn status(&self) -> JobStatus {
        match self {
            Outcome::Completed(JobResult::Found { .. }) => JobStatus::Success,
            Outcome::Completed(JobResult::Failed { .. }) => JobStatus::Failed,
            Outcome::Cancelled { .. } => JobStatus::Cancelled,
        }
    }
}

fn chrono_ttl(ttl: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(ttl)
        .map_err(|e| Error::InvalidConfig(format!("lease ttl out of range: {}", e)))
}

fn lease_lost(job_id: JobId, owner_id: &str) -> Error {
    Error::LeaseLost {
        job_id,
        owner: owner_id.to_string(),
    }
}

/// Claim, renew and release exclusive leases on job records.
///
/// Every operation is a single conditional write on the record (see
/// [`Records::modify`]), so two workers racing for the same job cannot both
/// observe it as free: whichever CAS lands second re-reads the record, sees
/// the winner's live lease and fails with `LeaseHeld`.
#[derive(Clone)]
pub struct LeaseManager {
    records: Records,
    retention: Duration,
}

impl LeaseManager {
    pub fn new(records: Records, retention: Duration) -> Self {
        Self { records, retention }
    }

    pub fn records(&self) -> &Records {
        &self.records
    }

    /// Claim `job_id` for `owner_id`. Succeeds only if the job has no lease
    /// or its lease has expired; moves the job to `running` and stamps
    /// `started_at` on first claim.
    pub async fn acquire(&self, job_id: JobId, owner_id: &str, ttl: Duration) -> Result<Job> {
        let ttl = chrono_ttl(ttl)?;
        let job = self
            .records
            .modify(job_id, |job| {
                let now = Utc::now();
                if job.is_terminal() {
                    return Err(Error::Conflict(format!(
                        "job {} is already {}",
                        job_id, job.status
                    )));
                }
                if let Some(lease) = job.lease.as_ref().filter(|l| !l.is_expired_at(now)) {
                    return Err(Error::LeaseHeld {
                        job_id,
                        owner: lease.owner_id.clone(),
                    });
                }
                if let Some(stale) = &job.lease {
                    tracing::info!(
                        job_id = %job_id,
                        previous_owner = %stale.owner_id,
                        owner = owner_id,
                        "Reclaiming expired lease"
                    );
                }
                job.status = JobStatus::Running;
                job.started_at.get_or_insert(now);
                job.lease = Some(Lease {
                    job_id,
                    owner_id: owner_id.to_string(),
                    acquired_at: now,
                    expires_at: now + ttl,
                });
                job.claims += 1;
                Ok(())
            })
            .await?;
        tracing::info!(job_id = %job_id, owner = owner_id, claims = job.claims, "Lease acquired");
        Ok(job)
    }

    /// Extend the owner's live lease to `now + ttl`. An expired or foreign
    /// lease fails with `LeaseLost`: the caller must stop working on the job.
    pub async fn renew(&self, job_id: JobId, owner_id: &str, ttl: Duration) -> Result<Lease> {
        let ttl = chrono_ttl(ttl)?;
        let job = self
            .records
            .modify(job_id, |job| {
                let now = Utc::now();
                if job.status != JobStatus::Running {
                    return Err(lease_lost(job_id, owner_id));
                }
                match job.lease.as_mut() {
                    Some(lease) if lease.is_held_by(owner_id, now) => {
                        lease.expires_at = now + ttl;
                        Ok(())
                    }
                    _ => Err(lease_lost(job_id, owner_id)),
                }
            })
            .await
            .map_err(|e| match e {
                Error::NotFound(_) => lease_lost(job_id, owner_id),
                other => other,
            })?;
        job.lease.ok_or_else(|| lease_lost(job_id, owner_id))
    }

    /// Clear the lease if `owner_id` still owns it, expired or not. The job
    /// stays `running` and any worker may claim it next.
    pub async fn release(&self, job_id: JobId, owner_id: &str) -> Result<()> {
        self.records
            .modify(job_id, |job| match &job.lease {
                Some(lease) if lease.owner_id == owner_id => {
                    job.lease = None;
                    Ok(())
                }
                _ => Err(lease_lost(job_id, owner_id)),
            })
            .await?;
        tracing::debug!(job_id = %job_id, owner = owner_id, "Lease released");
        Ok(())
    }

    /// Write progress fields on behalf of the live lease owner.
    pub async fn record_progress(
        &self,
        job_id: JobId,
        owner_id: &str,
        patch: JobPatch,
    ) -> Result<Job> {
        self.records
            .modify(job_id, |job| {
                if !job.has_live_lease(Utc::now())
                    || job.lease.as_ref().map(|l| l.owner_id.as_str()) != Some(owner_id)
                {
                    return Err(lease_lost(job_id, owner_id));
                }
                patch.clone().apply(job);
                Ok(())
            })
            .await
    }

    /// Terminal write: set the final status and result, clear the lease and
    /// schedule the record for purge in one conditional write.
    pub async fn finish(
        &self,
        job_id: JobId,
        owner_id: &str,
        outcome: Outcome,
        elapsed: Duration,
    ) -> Result<Job> {
        self.finish_with(job_id, owner_id, JobPatch::default(), outcome, elapsed)
            .await
    }

    /// [`finish`](Self::finish), applying `progress` in the same write. A
    /// phase that found the value must not advance `phases_completed` on its
    /// own: if that write landed and the terminal one did not, a worker
    /// resuming the job would skip the finding phase.
    pub async fn finish_with(
        &self,
        job_id: JobId,
        owner_id: &str,
        progress: JobPatch,
        outcome: Outcome,
        elapsed: Duration,
    ) -> Result<Job> {
        let status = outcome.status();
        let retention = chrono::Duration::from_std(self.retention)
            .map_err(|e| Error::InvalidConfig(format!("retention out of range: {}", e)))?;
        let job = self
            .records
            .modify(job_id, |job| {
                let now = Utc::now();
                if !job.has_live_lease(now)
                    || job.lease.as_ref().map(|l| l.owner_id.as_str()) != Some(owner_id)
                {
                    return Err(lease_lost(job_id, owner_id));
                }
                progress.clone().apply(job);
                job.status = status;
                job.elapsed = job.elapsed.max(elapsed);
                match &outcome {
                    Outcome::Completed(result) => {
                        job.attempts = job.attempts.max(result.attempts());
                        job.result = Some(result.clone());
                    }
                    Outcome::Cancelled { attempts } => {
                        job.attempts = job.attempts.max(*attempts);
                    }
                }
                job.terminal_at = Some(now);
                job.purge_at = Some(now + retention);
                job.lease = None;
                Ok(())
            })
            .await?;

        tracing::info!(
            job_id = %job_id,
            owner = owner_id,
            status = %job.status,
            attempts = job.attempts,
            elapsed_ms = job.elapsed.as_millis() as u64,
            "Job finished"
        );
        Ok(job)
    }
}
