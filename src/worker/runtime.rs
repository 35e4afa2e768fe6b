use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use crate::job::JobId;
use crate::lease::LeaseManager;
use crate::pipeline::{Orchestrator, RunOutcome, RunSignals};
use crate::queue::WorkQueue;
use crate::worker::heartbeat::Heartbeat;
use crate::worker::sweep::{sweep_orphans, SweepReport};

/// A single worker: pulls ids off the queues, claims them, and drives each
/// job through the pipeline while a heartbeat keeps its lease alive.
///
/// Any number of workers may share one queue and store. Exclusive execution
/// comes from the lease, not from the queue.
#[derive(Clone)]
pub struct Worker {
    config: WorkerConfig,
    queue: Arc<dyn WorkQueue>,
    leases: LeaseManager,
    orchestrator: Orchestrator,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        queue: Arc<dyn WorkQueue>,
        leases: LeaseManager,
        orchestrator: Orchestrator,
    ) -> Self {
        Self {
            config,
            queue,
            leases,
            orchestrator,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.worker_id
    }

    /// One orphan-recovery pass over the in-flight set.
    pub async fn sweep(&self) -> Result<SweepReport> {
        sweep_orphans(
            self.leases.records(),
            self.queue.as_ref(),
            self.config.lease_ttl(),
        )
        .await
    }

    /// Main loop. Runs a recovery sweep on startup and then every
    /// `sweep_interval`; otherwise blocks on the queues. Returns once
    /// `shutdown` fires and the current job, if any, has been handed back.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(
            worker_id = %self.id(),
            lease_ttl_ms = self.config.lease_ttl().as_millis() as u64,
            "Worker started"
        );

        self.sweep_logged().await;
        let mut sweep_timer = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.sweep_interval,
            self.config.sweep_interval,
        );
        sweep_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = sweep_timer.tick() => self.sweep_logged().await,
                next = self.queue.dequeue_any(self.config.poll_timeout) => match next {
                    Ok(Some(job_id)) => self.process(job_id, &shutdown).await,
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(worker_id = %self.id(), error = %e, "Dequeue failed");
                        tokio::time::sleep(self.config.poll_timeout).await;
                    }
                },
            }
        }

        tracing::info!(worker_id = %self.id(), "Worker stopped");
    }

    async fn sweep_logged(&self) {
        match self.sweep().await {
            Ok(report) if report.requeued > 0 || report.dropped > 0 => {
                tracing::info!(
                    worker_id = %self.id(),
                    inspected = report.inspected,
                    requeued = report.requeued,
                    dropped = report.dropped,
                    "Orphan sweep"
                );
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(worker_id = %self.id(), error = %e, "Orphan sweep failed"),
        }
    }

    /// Claim and run one dequeued job.
    pub async fn process(&self, job_id: JobId, shutdown: &CancellationToken) {
        let ttl = self.config.lease_ttl();
        let owner = self.config.worker_id.clone();

        let job = match self.leases.acquire(job_id, &owner, ttl).await {
            Ok(job) => job,
            Err(Error::Conflict(_)) | Err(Error::NotFound(_)) => {
                tracing::debug!(job_id = %job_id, worker_id = %owner, "Dequeued job already terminal or purged");
                self.complete(job_id).await;
                return;
            }
            Err(Error::LeaseHeld { owner: holder, .. }) => {
                // The holder keeps the in-flight entry; the sweep covers it if
                // the holder dies.
                tracing::debug!(job_id = %job_id, worker_id = %owner, holder = %holder, "Job leased elsewhere, skipping");
                return;
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, worker_id = %owner, error = %e, "Acquire failed, requeueing");
                self.requeue(job_id).await;
                return;
            }
        };

        let signals = RunSignals {
            lease_lost: CancellationToken::new(),
            shutdown: shutdown.child_token(),
        };
        let heartbeat = Heartbeat::new(self.config.heartbeat_interval).spawn(
            self.leases.clone(),
            job_id,
            owner.clone(),
            ttl,
            signals.lease_lost.clone(),
        );

        let outcome = self.orchestrator.run(job, &owner, ttl, &signals).await;
        heartbeat.stop().await;

        match outcome {
            Ok(RunOutcome::Finished(_)) => self.complete(job_id).await,
            Ok(RunOutcome::LeaseLost) => {
                tracing::warn!(job_id = %job_id, worker_id = %owner, "Lease lost, job abandoned to its new owner");
            }
            Ok(RunOutcome::Interrupted) => self.hand_back(job_id, &owner).await,
            Err(e) => {
                tracing::error!(job_id = %job_id, worker_id = %owner, error = %e, "Pipeline failed, handing job back");
                self.hand_back(job_id, &owner).await;
            }
        }
    }

    /// Give up a claimed job so another worker picks it up right away instead
    /// of waiting for the lease to expire.
    async fn hand_back(&self, job_id: JobId, owner: &str) {
        match self.leases.release(job_id, owner).await {
            Ok(()) => self.requeue(job_id).await,
            Err(Error::LeaseLost { .. }) => {
                tracing::debug!(job_id = %job_id, worker_id = owner, "Lease already gone, not requeueing");
            }
            Err(e) => {
                // The lease will expire on its own and the sweep will pick the
                // job up.
                tracing::warn!(job_id = %job_id, worker_id = owner, error = %e, "Release failed");
            }
        }
    }

    async fn requeue(&self, job_id: JobId) {
        if let Err(e) = self.queue.requeue(job_id).await {
            tracing::warn!(job_id = %job_id, worker_id = %self.id(), error = %e, "Requeue failed");
        }
    }

    async fn complete(&self, job_id: JobId) {
        if let Err(e) = self.queue.complete(job_id).await {
            tracing::warn!(job_id = %job_id, worker_id = %self.id(), error = %e, "Failed to clear in-flight entry");
        }
    }
}
