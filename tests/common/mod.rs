//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use audit_queue::config::{RetryConfig, WorkerConfig};
use audit_queue::error::{Error, Result};
use audit_queue::job::{Job, JobId, JobStatus, Target};
use audit_queue::lease::LeaseManager;
use audit_queue::pipeline::{Orchestrator, Phase, PhaseOutcome, PhasePlan, PhaseStrategy};
use audit_queue::store::{JobStore, MemoryStore, Records, Versioned};

/// Returns a fixed outcome after an optional delay and records every budget
/// it was handed.
pub struct Scripted {
    outcome: PhaseOutcome,
    delay: Duration,
    budgets: Mutex<Vec<Duration>>,
    calls: AtomicUsize,
}

impl Scripted {
    pub fn found(value: &str, attempts: u64) -> Arc<Self> {
        Self::with(PhaseOutcome::Found {
            value: value.to_string(),
            attempts,
        })
    }

    pub fn not_found(attempts: u64) -> Arc<Self> {
        Self::with(PhaseOutcome::NotFound { attempts })
    }

    pub fn with(outcome: PhaseOutcome) -> Arc<Self> {
        Arc::new(Self {
            outcome,
            delay: Duration::ZERO,
            budgets: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn delayed(outcome: PhaseOutcome, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            outcome,
            delay,
            budgets: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn budgets(&self) -> Vec<Duration> {
        self.budgets.lock().unwrap().clone()
    }
}

#[async_trait]
impl PhaseStrategy for Scripted {
    async fn run(&self, _: &Target, budget: Duration, cancel: CancellationToken) -> Result<PhaseOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.budgets.lock().unwrap().push(budget);
        if !self.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = cancel.cancelled() => return Ok(PhaseOutcome::NotFound { attempts: 0 }),
            }
        }
        Ok(self.outcome.clone())
    }
}

/// Always fails with a strategy fault.
pub struct Faulty;

#[async_trait]
impl PhaseStrategy for Faulty {
    async fn run(&self, _: &Target, _: Duration, _: CancellationToken) -> Result<PhaseOutcome> {
        Err(Error::StrategyFault("tool crashed".into()))
    }
}

/// Ignores both its budget and the cancel signal.
pub struct Stubborn {
    pub sleep: Duration,
}

#[async_trait]
impl PhaseStrategy for Stubborn {
    async fn run(&self, _: &Target, _: Duration, _: CancellationToken) -> Result<PhaseOutcome> {
        tokio::time::sleep(self.sleep).await;
        Ok(PhaseOutcome::Found {
            value: "too-late".into(),
            attempts: 1,
        })
    }
}

/// Uses its whole budget, then reports nothing found.
pub struct BudgetEater;

#[async_trait]
impl PhaseStrategy for BudgetEater {
    async fn run(&self, _: &Target, budget: Duration, cancel: CancellationToken) -> Result<PhaseOutcome> {
        tokio::select! {
            _ = tokio::time::sleep(budget) => {}
            _ = cancel.cancelled() => {}
        }
        Ok(PhaseOutcome::NotFound { attempts: 10 })
    }
}

pub fn phase(name: &str, ratio: f64, strategy: Arc<dyn PhaseStrategy>) -> Phase {
    Phase::new(name, ratio, strategy)
}

/// Plan with a 200ms hard-stop grace.
pub fn plan(phases: Vec<Phase>) -> PhasePlan {
    PhasePlan::new(phases, Duration::from_millis(200)).unwrap()
}

/// The four-phase table used throughout: dictionary, rules, generative, mask.
pub fn standard_plan(strategies: [Arc<dyn PhaseStrategy>; 4]) -> PhasePlan {
    let [dictionary, rules, generative, mask] = strategies;
    plan(vec![
        phase("dictionary", 0.10, dictionary),
        phase("rules", 0.25, rules),
        phase("generative", 0.35, generative),
        phase("mask", 0.30, mask),
    ])
}

pub fn leases(records: &Records) -> LeaseManager {
    LeaseManager::new(records.clone(), Duration::from_secs(3600))
}

pub fn orchestrator(records: &Records, plan: PhasePlan) -> Orchestrator {
    Orchestrator::new(Arc::new(plan), leases(records))
}

pub fn fast_worker(id: &str) -> WorkerConfig {
    WorkerConfig {
        poll_timeout: Duration::from_millis(20),
        sweep_interval: Duration::from_millis(100),
        ..WorkerConfig::new(id).with_heartbeat_interval(Duration::from_millis(50))
    }
}

pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        ..RetryConfig::default()
    }
}

pub async fn submit(records: &Records, value: &str, budget: Duration) -> Job {
    records
        .create(Job::new(Target::new(value), Default::default(), budget))
        .await
        .unwrap()
}

/// Poll until the job is terminal.
pub async fn wait_terminal(records: &Records, id: JobId, within: Duration) -> Job {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let job = records.get(id).await.unwrap();
        if job.status.is_terminal() {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {} still {} after {:?}",
            id,
            job.status,
            within
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn assert_status(job: &Job, status: JobStatus) {
    assert_eq!(job.status, status, "unexpected status for {:?}", job);
}

/// A store whose next `failures` calls fail with a transient error.
#[derive(Clone, Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    failures: Arc<Mutex<VecDeque<()>>>,
    pub calls: Arc<AtomicUsize>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: usize) {
        let mut failures = self.failures.lock().unwrap();
        failures.extend(std::iter::repeat(()).take(n));
    }

    fn trip(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.failures.lock().unwrap().pop_front() {
            Some(()) => Err(Error::Store("connection reset".into())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn create(&self, job: Job) -> Result<Versioned<Job>> {
        self.trip()?;
        self.inner.create(job).await
    }

    async fn get(&self, id: JobId) -> Result<Versioned<Job>> {
        self.trip()?;
        self.inner.get(id).await
    }

    async fn compare_and_swap(
        &self,
        id: JobId,
        expected_version: u64,
        job: Job,
    ) -> Result<Versioned<Job>> {
        self.trip()?;
        self.inner.compare_and_swap(id, expected_version, job).await
    }

    async fn expire_after(&self, id: JobId, retention: Duration) -> Result<()> {
        self.trip()?;
        self.inner.expire_after(id, retention).await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        self.trip()?;
        self.inner.purge_expired(now).await
    }

    async fn len(&self) -> Result<usize> {
        self.inner.len().await
    }
}

/// A store that rejects chosen writes with a transient error: the next
/// `n` CASes that would move a record to a given status, and optionally
/// every `expire_after`.
#[derive(Clone, Default)]
pub struct PickyStore {
    inner: MemoryStore,
    status_failures: Arc<Mutex<Option<(JobStatus, usize)>>>,
    refuse_expiry: Arc<AtomicBool>,
}

impl PickyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes_to(&self, status: JobStatus, n: usize) {
        *self.status_failures.lock().unwrap() = Some((status, n));
    }

    pub fn refuse_expiry(&self) {
        self.refuse_expiry.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl JobStore for PickyStore {
    async fn create(&self, job: Job) -> Result<Versioned<Job>> {
        self.inner.create(job).await
    }

    async fn get(&self, id: JobId) -> Result<Versioned<Job>> {
        self.inner.get(id).await
    }

    async fn compare_and_swap(
        &self,
        id: JobId,
        expected_version: u64,
        job: Job,
    ) -> Result<Versioned<Job>> {
        {
            let mut failures = self.status_failures.lock().unwrap();
            if let Some((status, left)) = failures.as_mut() {
                if *status == job.status && *left > 0 {
                    *left -= 1;
                    return Err(Error::Store("write timed out".into()));
                }
            }
        }
        self.inner.compare_and_swap(id, expected_version, job).await
    }

    async fn expire_after(&self, id: JobId, retention: Duration) -> Result<()> {
        if self.refuse_expiry.load(Ordering::SeqCst) {
            return Err(Error::Store("expiry unavailable".into()));
        }
        self.inner.expire_after(id, retention).await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        self.inner.purge_expired(now).await
    }

    async fn len(&self) -> Result<usize> {
        self.inner.len().await
    }
}
