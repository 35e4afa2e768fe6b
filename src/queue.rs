use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Notify};

use crate::error::{Error, Result};
use crate::job::{JobId, Priority};

/// A claimed-but-unfinished job id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlight {
    pub job_id: JobId,
    pub priority: Priority,
    /// When the id last moved from a tier queue into the in-flight set.
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepths {
    pub high: usize,
    pub normal: usize,
    pub low: usize,
    pub in_flight: usize,
}

/// Three FIFO tiers plus an in-flight set.
///
/// Every job id lives in exactly one place until its terminal write has been
/// cleaned up: one of the tier queues, or the in-flight set.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn enqueue(&self, priority: Priority, job_id: JobId) -> Result<()>;

    /// Pop the oldest id of the highest non-empty tier and move it into the
    /// in-flight set in the same step. Blocks up to `timeout` when every tier
    /// is empty.
    async fn dequeue_any(&self, timeout: Duration) -> Result<Option<JobId>>;

    /// Move an in-flight id back to the tail of its original tier. No-op if
    /// the id is already queued.
    async fn requeue(&self, job_id: JobId) -> Result<()>;

    /// Drop an id from the in-flight set once its job is terminal or gone.
    async fn complete(&self, job_id: JobId) -> Result<()>;

    async fn in_flight(&self) -> Result<Vec<InFlight>>;

    async fn depths(&self) -> Result<QueueDepths>;
}

#[derive(Debug, Default)]
struct Tiers {
    queues: [VecDeque<JobId>; 3],
    tier_of: HashMap<JobId, Priority>,
    in_flight: HashMap<JobId, InFlight>,
}

impl Tiers {
    fn is_queued(&self, job_id: &JobId) -> bool {
        self.tier_of.contains_key(job_id) && !self.in_flight.contains_key(job_id)
    }

    fn pop(&mut self) -> Option<JobId> {
        for priority in Priority::DRAIN_ORDER {
            if let Some(job_id) = self.queues[priority.slot()].pop_front() {
                self.in_flight.insert(
                    job_id,
                    InFlight {
                        job_id,
                        priority,
                        since: Utc::now(),
                    },
                );
                return Some(job_id);
            }
        }
        None
    }
}

/// In-process queues shared by cloning.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueue {
    tiers: Arc<Mutex<Tiers>>,
    ready: Arc<Notify>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn enqueue(&self, priority: Priority, job_id: JobId) -> Result<()> {
        {
            let mut tiers = self.tiers.lock().await;
            if tiers.tier_of.contains_key(&job_id) {
                return Err(Error::AlreadyExists(job_id));
            }
            tiers.tier_of.insert(job_id, priority);
            tiers.queues[priority.slot()].push_back(job_id);
        }
        self.ready.notify_one();
        tracing::debug!(job_id = %job_id, priority = %priority, "Job enqueued");
        Ok(())
    }

    async fn dequeue_any(&self, timeout: Duration) -> Result<Option<JobId>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking so a concurrent enqueue
            // between the check and the wait is not missed.
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(job_id) = self.tiers.lock().await.pop() {
                return Ok(Some(job_id));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn requeue(&self, job_id: JobId) -> Result<()> {
        {
            let mut tiers = self.tiers.lock().await;
            if tiers.is_queued(&job_id) {
                return Ok(());
            }
            let priority = match tiers.in_flight.remove(&job_id) {
                Some(entry) => entry.priority,
                None => return Err(Error::NotFound(job_id)),
            };
            tiers.queues[priority.slot()].push_back(job_id);
        }
        self.ready.notify_one();
        tracing::debug!(job_id = %job_id, "Job requeued");
        Ok(())
    }

    async fn complete(&self, job_id: JobId) -> Result<()> {
        let mut tiers = self.tiers.lock().await;
        if tiers.in_flight.remove(&job_id).is_some() {
            tiers.tier_of.remove(&job_id);
        }
        Ok(())
    }

    async fn in_flight(&self) -> Result<Vec<InFlight>> {
        let tiers = self.tiers.lock().await;
        let mut entries: Vec<InFlight> = tiers.in_flight.values().cloned().collect();
        entries.sort_by_key(|e| e.since);
        Ok(entries)
    }

    async fn depths(&self) -> Result<QueueDepths> {
        let tiers = self.tiers.lock().await;
        Ok(QueueDepths {
            high: tiers.queues[Priority::High.slot()].len(),
            normal: tiers.queues[Priority::Normal.slot()].len(),
            low: tiers.queues[Priority::Low.slot()].len(),
            in_flight: tiers.in_flight.len(),
        })
    }
}
