use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::job::JobId;
use crate::lease::LeaseManager;

/// Renews a job's lease on a fixed interval while the pipeline runs.
pub struct Heartbeat {
    interval: Duration,
}

/// Running heartbeat task. Stop it once the job is done.
pub struct HeartbeatHandle {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    pub async fn stop(self) {
        self.stop.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Heartbeat task panicked");
        }
    }
}

impl Heartbeat {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Renew until `stop` fires. The first renewal happens one interval after
    /// start, since acquiring just set a fresh expiry. On `LeaseLost` the
    /// `lost` token is fired and the loop ends; transient store errors are
    /// logged and retried on the next tick.
    pub async fn run(
        &self,
        leases: LeaseManager,
        job_id: JobId,
        owner_id: String,
        ttl: Duration,
        lost: CancellationToken,
        stop: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match leases.renew(job_id, &owner_id, ttl).await {
                Ok(lease) => {
                    tracing::debug!(job_id = %job_id, owner = %owner_id, expires_at = %lease.expires_at, "Heartbeat");
                }
                Err(Error::LeaseLost { .. }) => {
                    tracing::warn!(job_id = %job_id, owner = %owner_id, "Heartbeat rejected, lease lost");
                    lost.cancel();
                    break;
                }
                Err(e) => {
                    tracing::warn!(job_id = %job_id, owner = %owner_id, error = %e, "Heartbeat failed");
                }
            }
        }
    }

    pub fn spawn(
        self,
        leases: LeaseManager,
        job_id: JobId,
        owner_id: String,
        ttl: Duration,
        lost: CancellationToken,
    ) -> HeartbeatHandle {
        let stop = CancellationToken::new();
        let task_stop = stop.clone();
        let task = tokio::spawn(async move {
            self.run(leases, job_id, owner_id, ttl, lost, task_stop)
                .await;
        });
        HeartbeatHandle { stop, task }
    }
}
