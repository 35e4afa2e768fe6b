use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::job::Target;
use crate::pipeline::{PhaseOutcome, PhaseStrategy};

/// Phase strategy that delegates to an external cracking tool.
///
/// The configured command runs under `sh -c` with the job described in
/// environment variables:
/// - `AUDIT_TARGET`: the target value
/// - `AUDIT_TARGET_KIND`: the target's type tag, empty if unset
/// - `AUDIT_BUDGET_SECS` / `AUDIT_BUDGET_MS`: the phase slot
///
/// The tool reports on stdout with `found:<value>` and `attempts:<n>` lines,
/// read as they are printed. Exit status 0 or 1 is a normal result; anything
/// else is a fault. The child is killed once the slot elapses or the cancel
/// signal fires, and whatever it reported up to then still counts.
#[derive(Debug, Clone)]
pub struct CommandStrategy {
    name: String,
    command: String,
}

impl CommandStrategy {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
        }
    }

    fn conclude(&self, status: ExitStatus, report: Report, stderr: String) -> Result<PhaseOutcome> {
        match status.code() {
            Some(0) | Some(1) => {
                let outcome = match report.found {
                    Some(value) if status.success() => PhaseOutcome::Found {
                        value,
                        attempts: report.attempts,
                    },
                    _ => PhaseOutcome::NotFound {
                        attempts: report.attempts,
                    },
                };
                tracing::debug!(phase = %self.name, exit_code = ?status.code(), "Tool exited");
                Ok(outcome)
            }
            code => {
                let detail = if stderr.trim().is_empty() {
                    format!("{} exited with {:?}", self.name, code)
                } else {
                    format!("{} exited with {:?}: {}", self.name, code, stderr.trim())
                };
                Err(Error::StrategyFault(detail))
            }
        }
    }

    /// Outcome for a tool stopped before it exited. A value it already
    /// printed is kept.
    fn interrupted(&self, report: Report, why: &str) -> PhaseOutcome {
        tracing::info!(phase = %self.name, attempts = report.attempts, found = report.found.is_some(), "{}", why);
        match report.found {
            Some(value) => PhaseOutcome::Found {
                value,
                attempts: report.attempts,
            },
            None => PhaseOutcome::NotFound {
                attempts: report.attempts,
            },
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Report {
    found: Option<String>,
    attempts: u64,
}

impl Report {
    fn ingest(&mut self, line: &str) {
        if let Some(value) = line.strip_prefix("found:") {
            if self.found.is_none() && !value.is_empty() {
                self.found = Some(value.to_string());
            }
        } else if let Some(n) = line.strip_prefix("attempts:") {
            if let Ok(n) = n.trim().parse::<u64>() {
                self.attempts = self.attempts.max(n);
            }
        }
    }
}

async fn read_to_string(pipe: Option<impl AsyncRead + Unpin>) -> String {
    let mut buf = String::new();
    if let Some(mut pipe) = pipe {
        let mut bytes = Vec::new();
        if pipe.read_to_end(&mut bytes).await.is_ok() {
            buf = String::from_utf8_lossy(&bytes).into_owned();
        }
    }
    buf
}

#[async_trait]
impl PhaseStrategy for CommandStrategy {
    async fn run(
        &self,
        target: &Target,
        budget: Duration,
        cancel: CancellationToken,
    ) -> Result<PhaseOutcome> {
        let budget_secs = budget.as_millis().div_ceil(1000).max(1);
        tracing::info!(phase = %self.name, command = %self.command, budget_ms = budget.as_millis() as u64, "Launching tool");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("AUDIT_TARGET", &target.value)
            .env("AUDIT_TARGET_KIND", target.kind.as_deref().unwrap_or(""))
            .env("AUDIT_BUDGET_SECS", budget_secs.to_string())
            .env("AUDIT_BUDGET_MS", budget.as_millis().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::StrategyFault(format!("failed to launch {}: {}", self.name, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::StrategyFault(format!("{} has no stdout pipe", self.name)))?;
        let stderr = tokio::spawn(read_to_string(child.stderr.take()));
        let mut lines = BufReader::new(stdout).lines();
        let mut report = Report::default();
        let deadline = tokio::time::sleep(budget);
        tokio::pin!(deadline);

        let mut stdout_open = true;
        let status = loop {
            tokio::select! {
                line = lines.next_line(), if stdout_open => match line {
                    Ok(Some(line)) => report.ingest(&line),
                    Ok(None) => stdout_open = false,
                    Err(e) => {
                        return Err(Error::StrategyFault(format!("{} i/o error: {}", self.name, e)));
                    }
                },
                status = child.wait(), if !stdout_open => {
                    break status
                        .map_err(|e| Error::StrategyFault(format!("{} i/o error: {}", self.name, e)))?;
                }
                _ = &mut deadline => {
                    let _ = child.start_kill();
                    return Ok(self.interrupted(report, "Tool still running at end of slot, killed"));
                }
                _ = cancel.cancelled() => {
                    let _ = child.start_kill();
                    return Ok(self.interrupted(report, "Tool cancelled"));
                }
            }
        };

        let stderr = stderr.await.unwrap_or_default();
        self.conclude(status, report, stderr)
    }
}
