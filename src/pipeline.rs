//! Multi-phase pipeline orchestration.
//!
//! A job runs through a fixed, ordered [`PhasePlan`]. Each phase owns a slice
//! of the job's total budget (`ratio × total_budget`) and delegates the actual
//! attack to a [`PhaseStrategy`]. Between phases the [`Orchestrator`] checks
//! for cancellation and budget exhaustion, renews the lease, and writes
//! progress under the lease owner's identity.
//!
//! # Budget rules
//!
//! - Slots are fixed: time a phase leaves unused is not rolled over.
//! - Overrun is not forgiven: a phase that ran past its slot eats into the
//!   next phase's slot.
//! - A phase is hard-stopped `phase_grace` after its slot ends.
//! - No phase starts once `elapsed >= total_budget`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{PhaseConfig, PipelineConfig};
use crate::error::{Error, Result};
use crate::job::{FailureReason, Job, JobId, JobResult, PhaseFault, Target};
use crate::lease::{LeaseManager, Outcome};
use crate::store::JobPatch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseOutcome {
    Found { value: String, attempts: u64 },
    NotFound { attempts: u64 },
}

/// One attack technique. Implementations must return by `budget` or shortly
/// after, and should stop early once `cancel` fires.
#[async_trait]
pub trait PhaseStrategy: Send + Sync {
    async fn run(
        &self,
        target: &Target,
        budget: Duration,
        cancel: CancellationToken,
    ) -> Result<PhaseOutcome>;
}

#[derive(Clone)]
pub struct Phase {
    pub name: String,
    pub ratio: f64,
    pub weight: f64,
    pub strategy: Arc<dyn PhaseStrategy>,
}

impl Phase {
    pub fn new(name: impl Into<String>, ratio: f64, strategy: Arc<dyn PhaseStrategy>) -> Self {
        Self {
            name: name.into(),
            ratio,
            weight: 1.0,
            strategy,
        }
    }
}

impl std::fmt::Debug for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Phase")
            .field("name", &self.name)
            .field("ratio", &self.ratio)
            .field("weight", &self.weight)
            .finish_non_exhaustive()
    }
}

/// The deployment-wide ordered phase table.
#[derive(Debug, Clone)]
pub struct PhasePlan {
    phases: Vec<Phase>,
    grace: Duration,
}

impl PhasePlan {
    pub fn new(phases: Vec<Phase>, grace: Duration) -> Result<Self> {
        let config = PipelineConfig {
            phases: phases
                .iter()
                .map(|p| PhaseConfig::new(p.name.clone(), p.ratio).with_weight(p.weight))
                .collect(),
            phase_grace: grace,
            ..PipelineConfig::default()
        };
        config.validate()?;
        Ok(Self { phases, grace })
    }

    /// Build the plan from config, resolving each phase's strategy with `resolve`.
    pub fn from_config<F>(config: &PipelineConfig, mut resolve: F) -> Result<Self>
    where
        F: FnMut(&PhaseConfig) -> Result<Arc<dyn PhaseStrategy>>,
    {
        config.validate()?;
        let phases = config
            .phases
            .iter()
            .map(|pc| {
                Ok(Phase {
                    name: pc.name.clone(),
                    ratio: pc.ratio,
                    weight: pc.weight,
                    strategy: resolve(pc)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            phases,
            grace: config.phase_grace,
        })
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Absolute budget of each phase for a job with `total` budget, at
    /// millisecond granularity.
    pub fn budgets(&self, total: Duration) -> Vec<Duration> {
        let total_ms = total.as_millis() as f64;
        self.phases
            .iter()
            .map(|p| Duration::from_millis((total_ms * p.ratio).round() as u64))
            .collect()
    }

    /// Time actually handed to phase `index` when `elapsed` has been consumed:
    /// its fixed budget minus any overrun of earlier phases, never past the
    /// end of the total budget.
    pub fn slot(&self, index: usize, total: Duration, elapsed: Duration) -> Duration {
        let budgets = self.budgets(total);
        let Some(own) = budgets.get(index).copied() else {
            return Duration::ZERO;
        };
        let slot_start: Duration = budgets[..index].iter().sum();
        let overrun = elapsed.saturating_sub(slot_start);
        own.saturating_sub(overrun).min(total.saturating_sub(elapsed))
    }

    /// `progress_percent` once the first `completed` phases have run.
    pub fn progress_after(&self, completed: usize) -> u8 {
        let total: f64 = self.phases.iter().map(|p| p.weight).sum();
        if total <= 0.0 {
            return 0;
        }
        let done: f64 = self.phases.iter().take(completed).map(|p| p.weight).sum();
        ((done / total) * 100.0).round().clamp(0.0, 100.0) as u8
    }
}

/// Signals the worker hands to a running pipeline.
#[derive(Debug, Clone, Default)]
pub struct RunSignals {
    /// Fired by the heartbeat once a renewal reports `LeaseLost`.
    pub lease_lost: CancellationToken,
    /// Fired when the worker is shutting down.
    pub shutdown: CancellationToken,
}

#[derive(Debug)]
pub enum RunOutcome {
    /// Terminal record written.
    Finished(Job),
    /// Another owner may hold the job; nothing more was written.
    LeaseLost,
    /// Worker shutdown interrupted the job before a terminal write.
    Interrupted,
}

enum Invocation {
    Returned(Result<PhaseOutcome>),
    Overran,
    Skipped,
}

#[derive(Clone)]
pub struct Orchestrator {
    plan: Arc<PhasePlan>,
    leases: LeaseManager,
}

impl Orchestrator {
    pub fn new(plan: Arc<PhasePlan>, leases: LeaseManager) -> Self {
        Self { plan, leases }
    }

    pub fn plan(&self) -> &PhasePlan {
        &self.plan
    }

    /// Drive `job` (freshly acquired by `owner_id`) through the remaining
    /// phases. Resumes at `phases_completed` with the recorded elapsed time,
    /// so a reclaimed orphan does not get its budget back.
    pub async fn run(
        &self,
        job: Job,
        owner_id: &str,
        ttl: Duration,
        signals: &RunSignals,
    ) -> Result<RunOutcome> {
        let job_id = job.id;
        let total = job.total_budget;
        let base_elapsed = job.elapsed;
        let started = Instant::now();
        let mut attempts = job.attempts;

        tracing::info!(
            job_id = %job_id,
            owner = owner_id,
            total_budget_ms = total.as_millis() as u64,
            resume_at = job.phases_completed,
            "Pipeline started"
        );

        for index in job.phases_completed..self.plan.len() {
            let phase = &self.plan.phases[index];
            let elapsed = base_elapsed + started.elapsed();

            let current = match self.leases.records().get(job_id).await {
                Ok(current) => current,
                Err(Error::NotFound(_)) => return Ok(RunOutcome::LeaseLost),
                Err(e) => return Err(e),
            };
            if current.cancel_requested {
                tracing::info!(job_id = %job_id, phase_index = index, "Cancellation observed at phase boundary");
                return self
                    .finish(job_id, owner_id, Outcome::Cancelled { attempts }, elapsed)
                    .await;
            }
            if elapsed >= total {
                let outcome = Outcome::Completed(JobResult::Failed {
                    reason: FailureReason::Timeout,
                    attempts,
                    last_phase: index.checked_sub(1),
                });
                return self.finish(job_id, owner_id, outcome, elapsed).await;
            }

            if let Err(e) = self.leases.renew(job_id, owner_id, ttl).await {
                return lease_lost_or(e);
            }
            let marked = self
                .leases
                .record_progress(
                    job_id,
                    owner_id,
                    JobPatch {
                        current_phase_index: Some(index),
                        elapsed: Some(elapsed),
                        ..Default::default()
                    },
                )
                .await;
            if let Err(e) = marked {
                return lease_lost_or(e);
            }

            let slot = self.plan.slot(index, total, elapsed);
            tracing::info!(
                job_id = %job_id,
                phase = %phase.name,
                phase_index = index,
                slot_ms = slot.as_millis() as u64,
                "Phase started"
            );

            let invocation = if slot.is_zero() {
                Invocation::Skipped
            } else {
                let cancel = CancellationToken::new();
                let run = phase.strategy.run(&job.target, slot, cancel.clone());
                tokio::pin!(run);
                tokio::select! {
                    result = &mut run => Invocation::Returned(result),
                    _ = tokio::time::sleep(slot + self.plan.grace) => {
                        cancel.cancel();
                        Invocation::Overran
                    }
                    _ = signals.lease_lost.cancelled() => {
                        cancel.cancel();
                        tracing::warn!(job_id = %job_id, phase = %phase.name, "Lease lost mid-phase, abandoning job");
                        return Ok(RunOutcome::LeaseLost);
                    }
                    _ = signals.shutdown.cancelled() => {
                        cancel.cancel();
                        tracing::info!(job_id = %job_id, phase = %phase.name, "Shutdown interrupted phase");
                        return Ok(RunOutcome::Interrupted);
                    }
                }
            };

            let mut found = None;
            let mut fault = None;
            match invocation {
                Invocation::Returned(Ok(PhaseOutcome::Found { value, attempts: n })) => {
                    attempts += n;
                    found = Some(value);
                }
                Invocation::Returned(Ok(PhaseOutcome::NotFound { attempts: n })) => {
                    attempts += n;
                }
                Invocation::Returned(Err(e)) => {
                    tracing::warn!(job_id = %job_id, phase = %phase.name, error = %e, "Phase strategy fault, continuing");
                    fault = Some(e.to_string());
                }
                Invocation::Overran => {
                    tracing::warn!(job_id = %job_id, phase = %phase.name, "Phase overran its slot, stopped");
                    fault = Some(format!(
                        "deadline exceeded: no result within {:?} + {:?} grace",
                        slot, self.plan.grace
                    ));
                }
                Invocation::Skipped => {
                    tracing::debug!(job_id = %job_id, phase = %phase.name, "No time left in slot, phase skipped");
                }
            }

            let elapsed = base_elapsed + started.elapsed();
            let patch = JobPatch {
                current_phase_index: Some(index),
                phases_completed: Some(index + 1),
                progress_percent: Some(self.plan.progress_after(index + 1)),
                elapsed: Some(elapsed),
                attempts: Some(attempts),
                fault: fault.map(|detail| PhaseFault {
                    phase_index: index,
                    phase: phase.name.clone(),
                    detail,
                    at: Utc::now(),
                }),
            };
            tracing::info!(
                job_id = %job_id,
                phase = %phase.name,
                phase_index = index,
                attempts,
                found = found.is_some(),
                "Phase finished"
            );

            if let Some(value) = found {
                let outcome = Outcome::Completed(JobResult::Found {
                    value,
                    phase: phase.name.clone(),
                    phase_index: index,
                    attempts,
                });
                // Progress and the result land together, or not at all.
                return match self
                    .leases
                    .finish_with(job_id, owner_id, patch, outcome, elapsed)
                    .await
                {
                    Ok(job) => Ok(RunOutcome::Finished(job)),
                    Err(e) => lease_lost_or(e),
                };
            }

            if let Err(e) = self.leases.record_progress(job_id, owner_id, patch).await {
                return lease_lost_or(e);
            }
        }

        // The end of the last phase is a boundary too.
        let elapsed = base_elapsed + started.elapsed();
        match self.leases.records().get(job_id).await {
            Ok(current) if current.cancel_requested => {
                return self
                    .finish(job_id, owner_id, Outcome::Cancelled { attempts }, elapsed)
                    .await;
            }
            Ok(_) => {}
            Err(Error::NotFound(_)) => return Ok(RunOutcome::LeaseLost),
            Err(e) => return Err(e),
        }
        let outcome = Outcome::Completed(JobResult::Failed {
            reason: FailureReason::Exhausted,
            attempts,
            last_phase: self.plan.len().checked_sub(1),
        });
        self.finish(job_id, owner_id, outcome, elapsed).await
    }

    async fn finish(
        &self,
        job_id: JobId,
        owner_id: &str,
        outcome: Outcome,
        elapsed: Duration,
    ) -> Result<RunOutcome> {
        match self.leases.finish(job_id, owner_id, outcome, elapsed).await {
            Ok(job) => Ok(RunOutcome::Finished(job)),
            Err(e) => lease_lost_or(e),
        }
    }
}

fn lease_lost_or(e: Error) -> Result<RunOutcome> {
    match e {
        Error::LeaseLost { .. } | Error::NotFound(_) => Ok(RunOutcome::LeaseLost),
        other => Err(other),
    }
}
