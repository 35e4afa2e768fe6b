use std::time::Duration;

use chrono::Utc;

use crate::error::{Error, Result};
use crate::queue::WorkQueue;
use crate::store::Records;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub inspected: usize,
    /// Orphans moved back to their tier queue.
    pub requeued: usize,
    /// Terminal or purged ids dropped from the in-flight set.
    pub dropped: usize,
}

/// Requeue in-flight jobs nobody is working on.
///
/// An entry is an orphan when its job has no live lease and either
/// - it carries an expired lease (its worker stopped heartbeating), or
/// - it has sat in the in-flight set for a full `lease_ttl` without ever
///   being claimed (its worker died between dequeue and acquire).
///
/// Entries whose job is terminal or gone are cleaned up. Per-entry failures
/// are logged and skipped so one bad record cannot stall recovery.
pub async fn sweep_orphans(
    records: &Records,
    queue: &dyn WorkQueue,
    lease_ttl: Duration,
) -> Result<SweepReport> {
    let mut report = SweepReport::default();
    let now = Utc::now();
    let ttl = chrono::Duration::from_std(lease_ttl)
        .map_err(|e| Error::InvalidConfig(format!("lease ttl out of range: {}", e)))?;

    for entry in queue.in_flight().await? {
        report.inspected += 1;
        let job = match records.get(entry.job_id).await {
            Ok(job) => job,
            Err(Error::NotFound(_)) => {
                queue.complete(entry.job_id).await?;
                report.dropped += 1;
                continue;
            }
            Err(e) => {
                tracing::warn!(job_id = %entry.job_id, error = %e, "Sweep could not read job, skipping");
                continue;
            }
        };

        if job.is_terminal() {
            queue.complete(entry.job_id).await?;
            report.dropped += 1;
            continue;
        }
        if job.has_live_lease(now) {
            continue;
        }
        let stale_lease = job.lease.is_some();
        let unclaimed_too_long = now - entry.since >= ttl;
        if !(stale_lease || unclaimed_too_long) {
            continue;
        }

        match queue.requeue(entry.job_id).await {
            Ok(()) => {
                report.requeued += 1;
                tracing::info!(
                    job_id = %entry.job_id,
                    status = %job.status,
                    previous_owner = job.lease.as_ref().map(|l| l.owner_id.as_str()).unwrap_or("-"),
                    "Orphaned job requeued"
                );
            }
            // Completed or requeued by someone else since we listed it.
            Err(Error::NotFound(_)) => {}
            Err(e) => {
                tracing::warn!(job_id = %entry.job_id, error = %e, "Failed to requeue orphan");
            }
        }
    }

    Ok(report)
}
