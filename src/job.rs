use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type JobId = Uuid;

/// Priority tier, fixed at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    /// Tiers in the order idle workers drain them.
    pub const DRAIN_ORDER: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    pub(crate) fn slot(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Success => write!(f, "success"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What is being attacked. Opaque to the queue and orchestrator; only phase
/// strategies interpret it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub value: String,
    /// Hash type tag, e.g. a hashcat mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl Target {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            kind: None,
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }
}

/// Exclusive, time-bounded claim of a job by one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub job_id: JobId,
    pub owner_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_held_by(&self, owner_id: &str, now: DateTime<Utc>) -> bool {
        self.owner_id == owner_id && !self.is_expired_at(now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureReason {
    /// Total budget ran out before a phase could start.
    Timeout,
    /// Every phase ran without recovering the value.
    Exhausted,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Timeout => write!(f, "timeout"),
            FailureReason::Exhausted => write!(f, "exhausted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum JobResult {
    Found {
        value: String,
        phase: String,
        phase_index: usize,
        attempts: u64,
    },
    Failed {
        reason: FailureReason,
        attempts: u64,
        last_phase: Option<usize>,
    },
}

impl JobResult {
    pub fn attempts(&self) -> u64 {
        match self {
            JobResult::Found { attempts, .. } | JobResult::Failed { attempts, .. } => *attempts,
        }
    }
}

/// An execution fault raised by a phase strategy. Recorded for observability,
/// never changes the job status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseFault {
    pub phase_index: usize,
    pub phase: String,
    pub detail: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub target: Target,
    pub priority: Priority,
    #[serde(with = "duration_ms")]
    pub total_budget: Duration,
    pub status: JobStatus,
    pub current_phase_index: usize,
    /// Phases fully run so far; a reclaiming worker resumes here.
    pub phases_completed: usize,
    pub progress_percent: u8,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
    pub attempts: u64,
    pub result: Option<JobResult>,
    pub cancel_requested: bool,
    pub faults: Vec<PhaseFault>,
    /// Number of successful lease acquisitions.
    pub claims: u32,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub terminal_at: Option<DateTime<Utc>>,
    pub lease: Option<Lease>,
    pub purge_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(target: Target, priority: Priority, total_budget: Duration) -> Self {
        Self::with_id(Uuid::new_v4(), target, priority, total_budget, Utc::now())
    }

    pub fn with_id(
        id: JobId,
        target: Target,
        priority: Priority,
        total_budget: Duration,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            target,
            priority,
            total_budget,
            status: JobStatus::Pending,
            current_phase_index: 0,
            phases_completed: 0,
            progress_percent: 0,
            elapsed: Duration::ZERO,
            attempts: 0,
            result: None,
            cancel_requested: false,
            faults: Vec::new(),
            claims: 0,
            submitted_at,
            started_at: None,
            terminal_at: None,
            lease: None,
            purge_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Running under a lease that has not expired at `now`.
    pub fn has_live_lease(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Running
            && self
                .lease
                .as_ref()
                .is_some_and(|lease| !lease.is_expired_at(now))
    }
}

/// Serialize durations as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_is_pending_without_lease() {
        let job = Job::new(Target::new("t1"), Priority::High, Duration::from_secs(60));
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.lease.is_none());
        assert!(job.started_at.is_none());
        assert!(job.terminal_at.is_none());
        assert_eq!(job.progress_percent, 0);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Success.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn priority_parses_case_insensitively() {
        assert_eq!("HIGH".parse::<Priority>(), Ok(Priority::High));
        assert_eq!("normal".parse::<Priority>(), Ok(Priority::Normal));
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn expired_lease_is_not_live() {
        let now = Utc::now();
        let mut job = Job::new(Target::new("t1"), Priority::Low, Duration::from_secs(10));
        job.status = JobStatus::Running;
        job.lease = Some(Lease {
            job_id: job.id,
            owner_id: "w1".into(),
            acquired_at: now - chrono::Duration::seconds(20),
            expires_at: now - chrono::Duration::seconds(5),
        });
        assert!(!job.has_live_lease(now));
        assert!(job.lease.as_ref().unwrap().is_expired_at(now));
    }

    #[test]
    fn durations_serialize_as_millis() {
        let job = Job::new(Target::new("t1"), Priority::Normal, Duration::from_secs(5));
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["total_budget"], 5000);
        assert_eq!(json["status"], "pending");
        assert_eq!(json["priority"], "normal");
    }
}
