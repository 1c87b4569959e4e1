/// Ordered, best-effort teardown of a collection session.
///
/// Target first, then controller, then receiver. The order never changes and
/// a failure on one process never prevents the next step. Each step signals,
/// waits a bounded grace period, then escalates to a kill.
use crate::config::TimingConfig;
use crate::process::{ManagedProcess, ProcessError, ProcessLabel, ProcessState};
use std::io::Write;
use std::time::Duration;

/// How a process is asked to stop before the kill escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Terminate,
    Interrupt,
}

/// Result of tearing down one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownOutcome {
    NotStarted,
    /// Already gone before shutdown reached it.
    AlreadyExited(Option<i32>),
    /// Exited within the grace period after the stop signal.
    Stopped(Option<i32>),
    /// Outlived the grace period and was killed.
    Killed,
    /// Teardown could not be confirmed; the error was logged.
    Failed(String),
}

impl std::fmt::Display for TeardownOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TeardownOutcome::NotStarted => f.write_str("not started"),
            TeardownOutcome::AlreadyExited(Some(code)) => write!(f, "already exited ({code})"),
            TeardownOutcome::AlreadyExited(None) => f.write_str("already exited (signal)"),
            TeardownOutcome::Stopped(Some(code)) => write!(f, "stopped ({code})"),
            TeardownOutcome::Stopped(None) => f.write_str("stopped (signal)"),
            TeardownOutcome::Killed => f.write_str("killed after grace period"),
            TeardownOutcome::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownStep {
    pub label: ProcessLabel,
    pub outcome: TeardownOutcome,
}

/// Per-process teardown results, in the order they were performed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub steps: Vec<TeardownStep>,
}

impl ShutdownReport {
    #[cfg(test)]
    pub fn outcome(&self, label: ProcessLabel) -> Option<&TeardownOutcome> {
        self.steps
            .iter()
            .find(|s| s.label == label)
            .map(|s| &s.outcome)
    }
}

/// Teardown failures. Logged by the coordinator and never propagated.
#[derive(Debug)]
pub enum ShutdownError {
    Signal(ProcessError),
    Wait(ProcessError),
    Kill(ProcessError),
}

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownError::Signal(e) => write!(f, "stop signal failed: {e}"),
            ShutdownError::Wait(e) => write!(f, "wait failed: {e}"),
            ShutdownError::Kill(e) => write!(f, "kill failed: {e}"),
        }
    }
}

impl std::error::Error for ShutdownError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ShutdownError::Signal(e) | ShutdownError::Wait(e) | ShutdownError::Kill(e) => Some(e),
        }
    }
}

pub struct ShutdownCoordinator {
    target_grace: Duration,
    controller_grace: Duration,
    receiver_grace: Duration,
    /// Bound on reaping a process after SIGKILL.
    reap_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timing: &TimingConfig) -> Self {
        Self {
            target_grace: timing.target_grace(),
            controller_grace: timing.controller_grace(),
            receiver_grace: timing.receiver_grace(),
            reap_timeout: Duration::from_secs(1),
        }
    }

    /// Tear down whatever was started, in strict order.
    pub async fn shutdown<W: Write>(
        &self,
        target: Option<&mut ManagedProcess>,
        controller: Option<&mut ManagedProcess>,
        receiver: Option<&mut ManagedProcess>,
        out: &mut W,
    ) -> ShutdownReport {
        let _ = writeln!(out, "Stopping trace collection...");
        let mut report = ShutdownReport::default();

        let plan = [
            (
                ProcessLabel::Target,
                target,
                StopSignal::Terminate,
                self.target_grace,
                "Terminating target command...",
            ),
            (
                ProcessLabel::Controller,
                controller,
                StopSignal::Interrupt,
                self.controller_grace,
                "Stopping trace controller...",
            ),
            (
                ProcessLabel::Receiver,
                receiver,
                StopSignal::Interrupt,
                self.receiver_grace,
                "Stopping trace receiver...",
            ),
        ];

        for (label, process, signal, grace, status) in plan {
            let outcome = match process {
                None => TeardownOutcome::NotStarted,
                Some(process) => {
                    if process.is_alive() {
                        let _ = writeln!(out, "{status}");
                    }
                    self.teardown(process, signal, grace)
                        .await
                        .unwrap_or_else(|e| {
                            tracing::warn!(%label, error = %e, "teardown failed, continuing");
                            TeardownOutcome::Failed(e.to_string())
                        })
                }
            };
            tracing::debug!(%label, ?outcome, "teardown step complete");
            report.steps.push(TeardownStep { label, outcome });
        }

        report
    }

    async fn teardown(
        &self,
        process: &mut ManagedProcess,
        signal: StopSignal,
        grace: Duration,
    ) -> Result<TeardownOutcome, ShutdownError> {
        match process.poll_state().map_err(ShutdownError::Wait)? {
            ProcessState::NotStarted => return Ok(TeardownOutcome::NotStarted),
            ProcessState::Exited(code) => return Ok(TeardownOutcome::AlreadyExited(code)),
            ProcessState::Running => {}
        }

        let sent = match signal {
            StopSignal::Terminate => process.terminate(),
            StopSignal::Interrupt => process.interrupt(),
        };
        // A failed signal still gets the grace wait and the kill escalation
        if let Err(e) = sent.map_err(ShutdownError::Signal) {
            tracing::warn!(label = %process.label(), error = %e, "continuing teardown");
        }

        match process
            .wait_timeout(grace)
            .await
            .map_err(ShutdownError::Wait)?
        {
            Some(ProcessState::Exited(code)) => return Ok(TeardownOutcome::Stopped(code)),
            Some(_) | None => {}
        }

        tracing::warn!(
            label = %process.label(),
            grace_ms = grace.as_millis() as u64,
            "process outlived grace period, killing"
        );
        process.kill().map_err(ShutdownError::Kill)?;
        if process
            .wait_timeout(self.reap_timeout)
            .await
            .map_err(ShutdownError::Wait)?
            .is_none()
        {
            tracing::warn!(label = %process.label(), "killed process not yet reaped");
        }
        Ok(TeardownOutcome::Killed)
    }
}
