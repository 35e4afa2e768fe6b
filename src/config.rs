use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Bounded retry policy for the shared store.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts per operation on transient store failures, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Read-modify-CAS rounds before giving up on a contended record.
    pub max_cas_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_secs(1),
            max_cas_attempts: 32,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// How long terminal records are kept before purge.
    pub retention: Duration,
    /// How often the service sweeps purged records.
    pub purge_interval: Duration,
    pub retry: RetryConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(24 * 60 * 60),
            purge_interval: Duration::from_secs(60),
            retry: RetryConfig::default(),
        }
    }
}

/// One entry of the deployment-time phase table.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseConfig {
    pub name: String,
    /// Fraction of the total budget allotted to this phase.
    pub ratio: f64,
    /// Share of `progress_percent` credited when the phase completes.
    pub weight: f64,
    /// Shell command run by the command strategy, if this phase uses one.
    pub command: Option<String>,
}

impl PhaseConfig {
    pub fn new(name: impl Into<String>, ratio: f64) -> Self {
        Self {
            name: name.into(),
            ratio,
            weight: 1.0,
            command: None,
        }
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub phases: Vec<PhaseConfig>,
    /// Hard overrun tolerance after a phase's slot before its cancel signal fires.
    pub phase_grace: Duration,
    pub min_total_budget: Duration,
    pub max_total_budget: Duration,
}

const RATIO_EPSILON: f64 = 1e-6;

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            phases: vec![
                PhaseConfig::new("dictionary", 0.10),
                PhaseConfig::new("rules", 0.25),
                PhaseConfig::new("generative", 0.35),
                PhaseConfig::new("mask", 0.30),
            ],
            phase_grace: Duration::from_secs(2),
            min_total_budget: Duration::from_secs(1),
            max_total_budget: Duration::from_secs(3600),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.phases.is_empty() {
            return Err(Error::InvalidConfig("phase table is empty".into()));
        }
        for phase in &self.phases {
            if !(phase.ratio > 0.0 && phase.ratio <= 1.0) {
                return Err(Error::InvalidConfig(format!(
                    "phase '{}' ratio {} is outside (0, 1]",
                    phase.name, phase.ratio
                )));
            }
            if !(phase.weight > 0.0) {
                return Err(Error::InvalidConfig(format!(
                    "phase '{}' weight must be positive",
                    phase.name
                )));
            }
        }
        let sum: f64 = self.phases.iter().map(|p| p.ratio).sum();
        if (sum - 1.0).abs() > RATIO_EPSILON {
            return Err(Error::InvalidConfig(format!(
                "phase ratios sum to {}, expected 1.0",
                sum
            )));
        }
        if self.min_total_budget > self.max_total_budget {
            return Err(Error::InvalidConfig(
                "min_total_budget exceeds max_total_budget".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub heartbeat_interval: Duration,
    /// Replaces the derived `heartbeat_interval * 3` TTL when set.
    pub lease_ttl_override: Option<Duration>,
    /// How long an idle worker blocks on an empty queue before re-checking
    /// shutdown and the sweep timer.
    pub poll_timeout: Duration,
    pub sweep_interval: Duration,
}

/// A single missed heartbeat must not cost the lease.
pub const LEASE_TTL_HEARTBEATS: u32 = 3;

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
            heartbeat_interval: Duration::from_secs(5),
            lease_ttl_override: None,
            poll_timeout: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl_override
            .unwrap_or(self.heartbeat_interval * LEASE_TTL_HEARTBEATS)
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// HTTP adapter address; `None` runs workers only.
    pub listen_addr: Option<SocketAddr>,
    pub workers: usize,
    pub worker: WorkerConfig,
    pub pipeline: PipelineConfig,
    pub store: StoreConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: Some(
                "127.0.0.1:8080"
                    .parse()
                    .expect("default listen address is valid"),
            ),
            workers: 2,
            worker: WorkerConfig::default(),
            pipeline: PipelineConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

/// Parse `name:ratio[:command]` phase specs. The command may itself contain
/// colons; only the first two separators are significant.
pub fn parse_phase(spec: &str) -> Result<PhaseConfig> {
    let mut parts = spec.splitn(3, ':');
    let name = parts.next().unwrap_or_default().trim();
    let ratio = parts.next().map(str::trim);
    let command = parts.next().map(str::trim).filter(|c| !c.is_empty());

    let ratio: f64 = match ratio {
        Some(r) => r
            .parse()
            .map_err(|_| Error::InvalidConfig(format!("invalid ratio in phase '{}'", spec)))?,
        None => {
            return Err(Error::InvalidConfig(format!(
                "invalid phase '{}', expected name:ratio[:command]",
                spec
            )))
        }
    };
    if name.is_empty() {
        return Err(Error::InvalidConfig(format!("phase '{}' has no name", spec)));
    }

    let mut phase = PhaseConfig::new(name, ratio);
    phase.command = command.map(str::to_string);
    Ok(phase)
}
