/// Execution strategies: how long the target is monitored while capture runs.
///
/// All strategies share one scheduling model. Each iteration checks the
/// cancellation token and the target's liveness, then echoes one buffered
/// output line if there is one, or sleeps a poll interval if not. Stop
/// latency after cancellation is therefore bounded by one poll interval.
use crate::process::{ManagedProcess, ProcessError, ProcessLabel, ProcessState};
use crate::signals::CancellationToken;
use std::io::Write;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStrategy {
    /// Monitor until the target exits, then report its exit code.
    FollowTarget,
    /// Monitor for a fixed window; the target may be left running.
    FixedDuration(Duration),
    /// Monitor until the target exits or a stop is requested.
    Manual,
}

impl ExecutionStrategy {
    /// Map the `--duration` flag: positive seconds give a fixed window,
    /// anything else follows the target. `manual` takes precedence.
    pub fn from_duration_secs(duration: i64, manual: bool) -> Self {
        if manual {
            ExecutionStrategy::Manual
        } else if duration > 0 {
            ExecutionStrategy::FixedDuration(Duration::from_secs(duration as u64))
        } else {
            ExecutionStrategy::FollowTarget
        }
    }
}

impl std::fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStrategy::FollowTarget => f.write_str("follow target"),
            ExecutionStrategy::FixedDuration(d) => write!(f, "fixed duration ({}s)", d.as_secs()),
            ExecutionStrategy::Manual => f.write_str("manual"),
        }
    }
}

/// Why the monitoring loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    TargetExited,
    DurationElapsed,
    Cancelled,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::TargetExited => f.write_str("target exited"),
            StopReason::DurationElapsed => f.write_str("duration elapsed"),
            StopReason::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MonitorState {
    Running,
    Done(StopReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorOutcome {
    pub reason: StopReason,
    /// Target exit code, when it exited and the code is known.
    pub exit_code: Option<i32>,
    pub elapsed: Duration,
}

/// Failures while monitoring the target.
#[derive(Debug)]
pub enum MonitorError {
    Process(ProcessError),
    Echo(std::io::Error),
}

impl std::fmt::Display for MonitorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitorError::Process(e) => write!(f, "lost track of target: {e}"),
            MonitorError::Echo(e) => write!(f, "failed to echo target output: {e}"),
        }
    }
}

impl std::error::Error for MonitorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MonitorError::Process(e) => Some(e),
            MonitorError::Echo(e) => Some(e),
        }
    }
}

impl From<ProcessError> for MonitorError {
    fn from(e: ProcessError) -> Self {
        MonitorError::Process(e)
    }
}

impl From<std::io::Error> for MonitorError {
    fn from(e: std::io::Error) -> Self {
        MonitorError::Echo(e)
    }
}

/// Drives an [`ExecutionStrategy`] against a running target.
pub struct Monitor<'a> {
    strategy: ExecutionStrategy,
    poll_interval: Duration,
    residual_drain: Duration,
    token: &'a CancellationToken,
}

impl<'a> Monitor<'a> {
    pub fn new(
        strategy: ExecutionStrategy,
        poll_interval: Duration,
        residual_drain: Duration,
        token: &'a CancellationToken,
    ) -> Self {
        Self {
            strategy,
            poll_interval,
            residual_drain,
            token,
        }
    }

    pub async fn run<W: Write>(
        &self,
        target: &mut ManagedProcess,
        out: &mut W,
    ) -> Result<MonitorOutcome, MonitorError> {
        match self.strategy {
            ExecutionStrategy::FollowTarget => {
                writeln!(out, "Waiting for target command to complete...")?
            }
            ExecutionStrategy::FixedDuration(d) => {
                writeln!(out, "Running trace collection for {} seconds...", d.as_secs())?
            }
            ExecutionStrategy::Manual => {
                writeln!(out, "Trace collection running. Press Ctrl+C to stop...")?
            }
        }
        writeln!(out, "=== Target Program Output ===")?;

        let started = Instant::now();
        let reason = loop {
            if let MonitorState::Done(reason) = self.step(target, started, out).await? {
                break reason;
            }
        };
        tracing::debug!(%reason, strategy = %self.strategy, "monitoring stopped");

        let mut exit_code = match target.state() {
            ProcessState::Exited(code) => code,
            _ => None,
        };

        match self.strategy {
            ExecutionStrategy::FollowTarget => {
                self.echo_residual(target, out).await?;
                if reason != StopReason::Cancelled {
                    exit_code = target.wait().await?;
                    match exit_code {
                        Some(code) => {
                            writeln!(out, "=== Target Program Finished (exit code: {code}) ===")?
                        }
                        None => writeln!(out, "=== Target Program Finished (killed by signal) ===")?,
                    }
                }
            }
            ExecutionStrategy::FixedDuration(_) => {
                if reason == StopReason::TargetExited {
                    writeln!(out, "Target command finished before duration elapsed")?;
                    self.echo_residual(target, out).await?;
                }
            }
            ExecutionStrategy::Manual => {
                if reason == StopReason::TargetExited {
                    writeln!(out, "Target command finished")?;
                    self.echo_residual(target, out).await?;
                }
            }
        }

        Ok(MonitorOutcome {
            reason,
            exit_code,
            elapsed: started.elapsed(),
        })
    }

    /// One iteration of the shared poll loop.
    async fn step<W: Write>(
        &self,
        target: &mut ManagedProcess,
        started: Instant,
        out: &mut W,
    ) -> Result<MonitorState, MonitorError> {
        if self.token.is_cancelled() {
            return Ok(MonitorState::Done(StopReason::Cancelled));
        }
        if let ProcessState::Exited(_) = target.poll_state()? {
            return Ok(MonitorState::Done(StopReason::TargetExited));
        }
        if let ExecutionStrategy::FixedDuration(window) = self.strategy {
            if started.elapsed() >= window {
                return Ok(MonitorState::Done(StopReason::DurationElapsed));
            }
        }
        match target.try_read_line(Duration::ZERO).await {
            Some(line) => echo(out, target.label(), &line)?,
            None => tokio::time::sleep(self.poll_interval).await,
        }
        Ok(MonitorState::Running)
    }

    async fn echo_residual<W: Write>(
        &self,
        target: &mut ManagedProcess,
        out: &mut W,
    ) -> Result<(), MonitorError> {
        let residual = target.drain_remaining_output(self.residual_drain).await;
        for line in residual.lines().filter(|l| !l.trim().is_empty()) {
            echo(out, target.label(), line)?;
        }
        Ok(())
    }
}

fn echo<W: Write>(out: &mut W, label: ProcessLabel, line: &str) -> std::io::Result<()> {
    writeln!(out, "{}: {}", label.echo_prefix(), line.trim_end())
}
