use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::api::{self, ApiState};
use crate::config::{PipelineConfig, ServiceConfig, StoreConfig, WorkerConfig};
use crate::error::{Error, Result};
use crate::job::{Job, JobId, Priority, Target};
use crate::lease::LeaseManager;
use crate::pipeline::{Orchestrator, PhasePlan};
use crate::queue::{MemoryQueue, QueueDepths, WorkQueue};
use crate::store::{JobStore, MemoryStore, Records};
use crate::worker::Worker;

/// Client-facing operations: submit, read status, request cancellation.
///
/// Cheap to clone; every clone talks to the same store and queues.
#[derive(Clone)]
pub struct JobService {
    records: Records,
    queue: Arc<dyn WorkQueue>,
    min_budget: Duration,
    max_budget: Duration,
}

impl JobService {
    pub fn new(records: Records, queue: Arc<dyn WorkQueue>, pipeline: &PipelineConfig) -> Self {
        Self {
            records,
            queue,
            min_budget: pipeline.min_total_budget,
            max_budget: pipeline.max_total_budget,
        }
    }

    /// Create a `pending` record and enqueue its id on the priority tier.
    ///
    /// The record is written before the id is queued, so a worker can never
    /// dequeue an id whose record does not exist yet.
    pub async fn submit(
        &self,
        target: Target,
        priority: Priority,
        total_budget: Duration,
    ) -> Result<JobId> {
        if target.value.trim().is_empty() {
            return Err(Error::InvalidSubmission("target must not be empty".into()));
        }
        if total_budget < self.min_budget || total_budget > self.max_budget {
            return Err(Error::InvalidSubmission(format!(
                "total budget {:?} outside [{:?}, {:?}]",
                total_budget, self.min_budget, self.max_budget
            )));
        }

        let job = self
            .records
            .create(Job::new(target, priority, total_budget))
            .await?;
        if let Err(e) = self.queue.enqueue(priority, job.id).await {
            tracing::error!(job_id = %job.id, error = %e, "Job recorded but could not be enqueued");
            return Err(e);
        }

        tracing::info!(
            job_id = %job.id,
            priority = %priority,
            total_budget_ms = total_budget.as_millis() as u64,
            "Job submitted"
        );
        Ok(job.id)
    }

    /// Read-only snapshot of the record.
    pub async fn get_status(&self, job_id: JobId) -> Result<Job> {
        self.records.get(job_id).await
    }

    /// Flag the job for cancellation. Takes effect at the next phase boundary.
    /// Repeating the request is a no-op; a terminal job is a `Conflict`.
    pub async fn request_cancel(&self, job_id: JobId) -> Result<Job> {
        let job = self
            .records
            .modify(job_id, |job| {
                if job.is_terminal() {
                    return Err(Error::Conflict(format!(
                        "job {} is already {}",
                        job_id, job.status
                    )));
                }
                job.cancel_requested = true;
                Ok(())
            })
            .await?;
        tracing::info!(job_id = %job_id, status = %job.status, "Cancellation requested");
        Ok(job)
    }

    pub async fn depths(&self) -> Result<QueueDepths> {
        self.queue.depths().await
    }

    /// Records currently held by the store, terminal ones awaiting purge included.
    pub async fn record_count(&self) -> Result<usize> {
        self.records.len().await
    }
}

/// The assembled process: client service, worker pool, purge loop, and the
/// optional HTTP adapter, all sharing one store and one set of queues.
pub struct Service {
    config: ServiceConfig,
    jobs: JobService,
    workers: Vec<Worker>,
    records: Records,
}

impl Service {
    /// Wire everything over in-memory backends.
    pub fn new(config: ServiceConfig, plan: PhasePlan) -> Self {
        let store: Arc<dyn JobStore> = Arc::new(MemoryStore::new());
        let queue: Arc<dyn WorkQueue> = Arc::new(MemoryQueue::new());
        Self::with_backends(config, plan, store, queue)
    }

    pub fn with_backends(
        config: ServiceConfig,
        plan: PhasePlan,
        store: Arc<dyn JobStore>,
        queue: Arc<dyn WorkQueue>,
    ) -> Self {
        let StoreConfig {
            retention, retry, ..
        } = config.store.clone();
        let records = Records::new(store, retry);
        let leases = LeaseManager::new(records.clone(), retention);
        let orchestrator = Orchestrator::new(Arc::new(plan), leases.clone());

        let workers = (0..config.workers)
            .map(|i| {
                let worker_config = WorkerConfig {
                    worker_id: worker_id(&config.worker.worker_id, i, config.workers),
                    ..config.worker.clone()
                };
                Worker::new(
                    worker_config,
                    queue.clone(),
                    leases.clone(),
                    orchestrator.clone(),
                )
            })
            .collect();

        let jobs = JobService::new(records.clone(), queue, &config.pipeline);
        Self {
            config,
            jobs,
            workers,
            records,
        }
    }

    pub fn jobs(&self) -> &JobService {
        &self.jobs
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    /// Run until `shutdown` fires, then wait for every worker to hand back or
    /// finish its current job.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let mut tasks = Vec::new();

        for worker in self.workers {
            let token = shutdown.clone();
            tasks.push(tokio::spawn(async move { worker.run(token).await }));
        }

        let records = self.records.clone();
        let purge_interval = self.config.store.purge_interval;
        let token = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            purge_loop(records, purge_interval, token).await
        }));

        if let Some(addr) = self.config.listen_addr {
            let state = ApiState {
                jobs: self.jobs.clone(),
            };
            let token = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = api::serve(addr, state, token).await {
                    tracing::error!(addr = %addr, error = %e, "HTTP adapter failed");
                }
            }));
        }

        tracing::info!(
            workers = self.config.workers,
            listen_addr = ?self.config.listen_addr,
            "Service running"
        );

        shutdown.cancelled().await;
        tracing::info!("Shutdown requested, draining workers");
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Service task panicked");
            }
        }
        tracing::info!("Service stopped");
        Ok(())
    }
}

fn worker_id(base: &str, index: usize, count: usize) -> String {
    if count <= 1 {
        base.to_string()
    } else {
        format!("{}-{}", base, index)
    }
}

async fn purge_loop(records: Records, every: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match records.purge_expired(Utc::now()).await {
            Ok(0) => {}
            Ok(purged) => tracing::info!(purged, "Purged expired job records"),
            Err(e) => tracing::warn!(error = %e, "Purge of expired records failed"),
        }
    }
}
