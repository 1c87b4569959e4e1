/// Collection session lifecycle: launch receiver, controller and target in
/// order, monitor the target under the chosen strategy, tear everything down,
/// then surface statistics.
///
/// Launch and monitoring failures short-circuit into the same shutdown path
/// as a normal finish, so whatever was started is always torn down.
use crate::config::CollectConfig;
use crate::launch::{
    arm_controller, capitalize, report_launch_failure, start_target, GracePeriod, LaunchError,
    LocalProcessLauncher, RemoteProcessLauncher,
};
use crate::process::{ManagedProcess, ProcessLabel, ProcessState};
use crate::shutdown::{ShutdownCoordinator, ShutdownReport};
use crate::signals::CancellationToken;
use crate::statistics::StatisticsExtractor;
use crate::strategy::{ExecutionStrategy, Monitor, MonitorError, MonitorOutcome};
use chrono::{DateTime, Local};
use std::io::Write;

/// Errors that end a session with a failure exit code.
#[derive(Debug)]
pub enum CollectError {
    /// Not running with elevated local privileges.
    Privilege { euid: u32 },
    NoTargetCommand,
    Launch(LaunchError),
    Runtime(MonitorError),
}

impl std::fmt::Display for CollectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectError::Privilege { euid } => write!(
                f,
                "must be run as root for hardware access and process control (euid {euid})"
            ),
            CollectError::NoTargetCommand => write!(f, "no target command provided"),
            CollectError::Launch(e) => write!(f, "launch failed: {e}"),
            CollectError::Runtime(e) => write!(f, "collection failed: {e}"),
        }
    }
}

impl std::error::Error for CollectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CollectError::Launch(e) => Some(e),
            CollectError::Runtime(e) => Some(e),
            _ => None,
        }
    }
}

impl From<LaunchError> for CollectError {
    fn from(e: LaunchError) -> Self {
        CollectError::Launch(e)
    }
}

/// Refuse to run without an effective uid of root.
pub fn ensure_privileged() -> Result<(), CollectError> {
    let euid = nix::unistd::geteuid();
    if euid.is_root() {
        Ok(())
    } else {
        Err(CollectError::Privilege {
            euid: euid.as_raw(),
        })
    }
}

/// What a successful session produced.
#[derive(Debug)]
pub struct SessionSummary {
    pub started_at: DateTime<Local>,
    pub strategy: ExecutionStrategy,
    pub monitor: MonitorOutcome,
    pub shutdown: ShutdownReport,
    pub controller_statistics: Vec<String>,
    pub receiver_statistics: Vec<String>,
}

/// One trace collection run. Owns every process it starts.
pub struct CollectionSession {
    config: CollectConfig,
    strategy: ExecutionStrategy,
    token: CancellationToken,
    target_command: Vec<String>,
    receiver: Option<ManagedProcess>,
    controller: Option<ManagedProcess>,
    target: Option<ManagedProcess>,
    shutdown: Option<ShutdownReport>,
}

impl CollectionSession {
    pub fn new(
        config: CollectConfig,
        strategy: ExecutionStrategy,
        target_command: Vec<String>,
        token: CancellationToken,
    ) -> Result<Self, CollectError> {
        if target_command.is_empty() {
            return Err(CollectError::NoTargetCommand);
        }
        Ok(Self {
            config,
            strategy,
            token,
            target_command,
            receiver: None,
            controller: None,
            target: None,
            shutdown: None,
        })
    }

    /// Commands that `run` would start, in launch order.
    pub fn launch_plan(&self) -> Vec<(ProcessLabel, String)> {
        let (receiver, controller) = launchers(&self.config);
        vec![
            (ProcessLabel::Receiver, receiver.command().to_string()),
            (ProcessLabel::Controller, controller.command().to_string()),
            (ProcessLabel::Target, self.target_command.join(" ")),
        ]
    }

    /// Report from the most recent teardown, including after a failed run.
    pub fn shutdown_report(&self) -> Option<&ShutdownReport> {
        self.shutdown.as_ref()
    }

    /// Run the whole session. Shutdown always runs before this returns.
    pub async fn run<W: Write>(&mut self, out: &mut W) -> Result<SessionSummary, CollectError> {
        let started_at = Local::now();
        tracing::info!(strategy = %self.strategy, "collection session starting");

        let result = self.launch_and_monitor(out).await;
        if let Err(CollectError::Runtime(ref e)) = result {
            tracing::error!(error = %e, "monitoring failed");
            let _ = writeln!(out, "Error during trace collection: {e}");
            self.report_residual_output(out).await;
        }

        let coordinator = ShutdownCoordinator::new(&self.config.timing);
        let report = coordinator
            .shutdown(
                self.target.as_mut(),
                self.controller.as_mut(),
                self.receiver.as_mut(),
                out,
            )
            .await;
        self.shutdown = Some(report.clone());

        let monitor = result?;

        let _ = writeln!(out, "--- Trace Collection Complete ---");
        let _ = writeln!(
            out,
            "Trace file saved on {}:{}",
            self.config.receiver.host, self.config.receiver.trace_file
        );

        let (controller_statistics, receiver_statistics) = self.collect_statistics().await;
        for line in &controller_statistics {
            let _ = writeln!(out, "{}", line.trim());
        }
        if !receiver_statistics.is_empty() {
            let _ = writeln!(out, "\nTrace Statistics:");
            for line in &receiver_statistics {
                let _ = writeln!(out, "  {}", line.trim());
            }
        }
        if controller_statistics.is_empty() && receiver_statistics.is_empty() {
            tracing::info!("no trace statistics found in controller or receiver output");
        }

        Ok(SessionSummary {
            started_at,
            strategy: self.strategy,
            monitor,
            shutdown: report,
            controller_statistics,
            receiver_statistics,
        })
    }

    async fn launch_and_monitor<W: Write>(
        &mut self,
        out: &mut W,
    ) -> Result<MonitorOutcome, CollectError> {
        let timing = &self.config.timing;
        let host = &self.config.receiver.host;
        let token = &self.token;
        let (receiver_launcher, controller_launcher) = launchers(&self.config);

        if token.is_cancelled() {
            return Err(launch_failed(
                out,
                LaunchError::Cancelled {
                    label: ProcessLabel::Receiver,
                },
            ));
        }

        let _ = writeln!(out, "Starting trace receiver on {host}...");
        let spawned = receiver_launcher.spawn().map_err(|e| launch_failed(out, e))?;
        let receiver = self.receiver.insert(spawned);
        let _ = writeln!(out, "Receiver started on {host}");
        receiver_launcher
            .confirm(receiver, token)
            .await
            .map_err(|e| launch_failed(out, e))?;

        let _ = writeln!(out, "Starting trace controller...");
        let spawned = controller_launcher
            .spawn()
            .map_err(|e| launch_failed(out, e))?;
        let controller = self.controller.insert(spawned);
        let _ = writeln!(out, "Controller started");
        controller_launcher
            .confirm(controller, token)
            .await
            .map_err(|e| launch_failed(out, e))?;

        let _ = writeln!(out, "Target command: {}", self.target_command.join(" "));
        let _ = writeln!(out, "Starting trace collection...");
        let armed = arm_controller(controller, timing.arm_delay(), token).await;
        if !armed {
            return Err(launch_failed(
                out,
                LaunchError::Cancelled {
                    label: ProcessLabel::Target,
                },
            ));
        }

        let _ = writeln!(out, "Executing target command...");
        let spawned = start_target(&self.target_command).map_err(|e| launch_failed(out, e))?;
        let target = self.target.insert(spawned);

        Monitor::new(
            self.strategy,
            timing.poll_interval(),
            timing.residual_drain(),
            token,
        )
        .run(target, out)
        .await
        .map_err(CollectError::Runtime)
    }

    /// Print leftover output of controller and receiver if they already exited.
    async fn report_residual_output<W: Write>(&mut self, out: &mut W) {
        let drain = self.config.timing.residual_drain();
        for process in [self.controller.as_mut(), self.receiver.as_mut()]
            .into_iter()
            .flatten()
        {
            if !matches!(process.poll_state(), Ok(ProcessState::Exited(_))) {
                continue;
            }
            let name = process.label().as_str();
            let stdout = process.drain_remaining_output(drain).await;
            let stderr = process.drain_remaining_errors(drain).await;
            if !stdout.trim().is_empty() {
                let _ = writeln!(out, "Final {name} stdout: {stdout}");
            }
            if !stderr.trim().is_empty() {
                let _ = writeln!(out, "Final {name} stderr: {stderr}");
            }
        }
    }

    async fn collect_statistics(&mut self) -> (Vec<String>, Vec<String>) {
        let extractor = StatisticsExtractor::new(self.config.statistics.markers.clone());
        let drain = self.config.timing.statistics_drain();
        let controller = match self.controller.as_mut() {
            Some(process) => extractor.collect(process, drain).await,
            None => Vec::new(),
        };
        let receiver = match self.receiver.as_mut() {
            Some(process) => extractor.collect(process, drain).await,
            None => Vec::new(),
        };
        (controller, receiver)
    }
}

fn launchers(config: &CollectConfig) -> (RemoteProcessLauncher<'_>, LocalProcessLauncher<'_>) {
    let timing = &config.timing;
    let grace = |confirm| GracePeriod {
        confirm,
        diagnostics: timing.residual_drain(),
    };
    (
        RemoteProcessLauncher::new(&config.receiver, grace(timing.receiver_confirm())),
        LocalProcessLauncher::new(
            &config.controller,
            &config.receiver.host,
            grace(timing.controller_confirm()),
        ),
    )
}

fn launch_failed<W: Write>(out: &mut W, err: LaunchError) -> CollectError {
    tracing::error!(
        label = err.label().map(|l| l.as_str()).unwrap_or("unknown"),
        error = %err,
        "launch failed"
    );
    match err {
        LaunchError::Spawn(_) => {
            let label = err.label().map(|l| l.as_str()).unwrap_or("process");
            let _ = writeln!(out, "Failed to start {label}: {err}");
        }
        LaunchError::Cancelled { .. } => {
            let _ = writeln!(out, "{}", capitalize(&err.to_string()));
        }
        LaunchError::ExitedEarly { .. } => report_launch_failure(out, &err),
    }
    CollectError::Launch(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimingConfig;
    use crate::shutdown::TeardownOutcome;
    use crate::strategy::StopReason;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    const RECEIVER_FLUSHES_ON_INT: &str = "\
trap 'echo \"Trace statistics:\"; echo \"  Dropped traces: 0\"; echo \"  Written traces: 42\"; exit 0' INT
echo \"Output file: $1\"
while true; do sleep 0.05; done
";

    const CONTROLLER_FLUSHES_ON_INT: &str = "\
trap 'echo \"Stopped trace collection\"; echo \"Dropped traces: 0\"; echo \"Written traces: 42\"; exit 0' INT
echo 'Setup complete. Press enter to begin trace collection...'
read _go
echo 'Trace collection is running...'
while true; do sleep 0.05; done
";

    fn controller_script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("trace_controller");
        std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn test_config(dir: &Path, receiver: &str, controller: &str) -> CollectConfig {
        std::fs::write(dir.join("trace_receiver"), receiver).unwrap();
        let mut config = CollectConfig::default();
        config.receiver.host = "trace-host".to_string();
        config.receiver.user = "lab".to_string();
        config.receiver.path = dir.display().to_string();
        config.receiver.privilege_command = "sh".to_string();
        config.receiver.ssh_program = "sh".to_string();
        config.receiver.ssh_options = vec![
            "-c".to_string(),
            "eval \"$2\"".to_string(),
            "ssh".to_string(),
        ];
        config.controller.binary = Some(controller_script(dir, controller));
        config.timing = TimingConfig {
            receiver_confirm_ms: 300,
            controller_confirm_ms: 300,
            arm_delay_ms: 50,
            poll_interval_ms: 20,
            residual_drain_ms: 500,
            target_grace_ms: 1_000,
            controller_grace_ms: 2_000,
            receiver_grace_ms: 2_000,
            statistics_drain_ms: 1_000,
        };
        config
    }

    fn argv(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn torn_down(outcome: Option<&TeardownOutcome>) -> bool {
        matches!(
            outcome,
            Some(TeardownOutcome::Stopped(_)) | Some(TeardownOutcome::Killed)
        )
    }

    #[test]
    fn test_empty_target_command_rejected() {
        let err = CollectionSession::new(
            CollectConfig::default(),
            ExecutionStrategy::FollowTarget,
            vec![],
            CancellationToken::new(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, CollectError::NoTargetCommand));
    }

    #[test]
    fn test_privilege_check_matches_euid() {
        let result = ensure_privileged();
        if nix::unistd::geteuid().is_root() {
            assert!(result.is_ok());
        } else {
            let err = result.unwrap_err();
            assert!(matches!(err, CollectError::Privilege { .. }));
            assert!(err.to_string().contains("root"));
        }
    }

    #[test]
    fn test_launch_plan() {
        let mut config = CollectConfig::default();
        config.receiver.host = "10.0.1.50".to_string();
        config.receiver.user = "lab".to_string();
        config.controller.binary = Some(PathBuf::from("/opt/trace/trace_controller"));
        let session = CollectionSession::new(
            config,
            ExecutionStrategy::FollowTarget,
            vec!["./my_app".to_string(), "arg1".to_string()],
            CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(
            session.launch_plan(),
            vec![
                (
                    ProcessLabel::Receiver,
                    "ssh lab@10.0.1.50 \"cd /opt/trace && sudo ./trace_receiver /tmp/trace_record.bin 10\""
                        .to_string()
                ),
                (
                    ProcessLabel::Controller,
                    "/opt/trace/trace_controller 0000:40:00.1 10.0.1.50".to_string()
                ),
                (ProcessLabel::Target, "./my_app arg1".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_receiver_early_exit_never_starts_controller() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(
            dir.path(),
            "echo 'Failed to setup server socket' >&2\nexit 1\n",
            "touch \"$(dirname \"$0\")/controller-started\"\nsleep 10\n",
        );
        let mut session = CollectionSession::new(
            config,
            ExecutionStrategy::FollowTarget,
            argv("echo never"),
            CancellationToken::new(),
        )
        .unwrap();

        let mut out = Vec::new();
        let err = session.run(&mut out).await.unwrap_err();
        assert!(matches!(
            err,
            CollectError::Launch(LaunchError::ExitedEarly {
                label: ProcessLabel::Receiver,
                ..
            })
        ));
        assert!(session.controller.is_none());
        assert!(session.target.is_none());
        assert!(!dir.path().join("controller-started").exists());

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Receiver exited early with code: 1"));
        assert!(text.contains("Receiver stderr: Failed to setup server socket"));
        assert!(!text.contains("Starting trace controller"));
    }

    #[tokio::test]
    async fn test_controller_failure_tears_down_receiver() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(
            dir.path(),
            RECEIVER_FLUSHES_ON_INT,
            "echo 'Failed to connect to receiver' >&2\nexit 1\n",
        );
        let mut session = CollectionSession::new(
            config,
            ExecutionStrategy::FollowTarget,
            argv("echo never"),
            CancellationToken::new(),
        )
        .unwrap();

        let mut out = Vec::new();
        let err = session.run(&mut out).await.unwrap_err();
        assert!(matches!(
            err,
            CollectError::Launch(LaunchError::ExitedEarly {
                label: ProcessLabel::Controller,
                ..
            })
        ));

        let report = session.shutdown_report().unwrap();
        assert!(torn_down(report.outcome(ProcessLabel::Receiver)));
        assert_eq!(
            report.outcome(ProcessLabel::Target),
            Some(&TeardownOutcome::NotStarted)
        );
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Controller stderr: Failed to connect to receiver"));
        assert!(text.contains("Stopping trace receiver..."));
    }

    #[tokio::test]
    async fn test_follow_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), RECEIVER_FLUSHES_ON_INT, CONTROLLER_FLUSHES_ON_INT);
        let mut session = CollectionSession::new(
            config,
            ExecutionStrategy::FollowTarget,
            argv("echo one; echo two; exit 3"),
            CancellationToken::new(),
        )
        .unwrap();

        let mut out = Vec::new();
        let summary = session.run(&mut out).await.unwrap();

        assert_eq!(summary.monitor.reason, StopReason::TargetExited);
        assert_eq!(summary.monitor.exit_code, Some(3));

        let text = String::from_utf8(out).unwrap();
        let one = text.find("TARGET: one").unwrap();
        let two = text.find("TARGET: two").unwrap();
        assert!(one < two);

        assert_eq!(
            summary.shutdown.outcome(ProcessLabel::Target),
            Some(&TeardownOutcome::AlreadyExited(Some(3)))
        );
        assert_eq!(
            summary.shutdown.outcome(ProcessLabel::Controller),
            Some(&TeardownOutcome::Stopped(Some(0)))
        );
        assert!(torn_down(summary.shutdown.outcome(ProcessLabel::Receiver)));

        assert_eq!(
            summary.controller_statistics,
            vec!["Dropped traces: 0", "Written traces: 42"]
        );
        assert!(summary
            .receiver_statistics
            .contains(&"  Written traces: 42".to_string()));
        assert!(text.contains("Trace file saved on trace-host:/tmp/trace_record.bin"));
    }

    #[tokio::test]
    async fn test_fixed_duration_target_reaped_in_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), RECEIVER_FLUSHES_ON_INT, CONTROLLER_FLUSHES_ON_INT);
        let mut session = CollectionSession::new(
            config,
            ExecutionStrategy::FixedDuration(Duration::from_millis(300)),
            argv("sleep 30"),
            CancellationToken::new(),
        )
        .unwrap();

        let mut out = Vec::new();
        let summary = session.run(&mut out).await.unwrap();
        assert_eq!(summary.monitor.reason, StopReason::DurationElapsed);
        assert!(matches!(
            summary.shutdown.outcome(ProcessLabel::Target),
            Some(TeardownOutcome::Stopped(_))
        ));
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Terminating target command..."));
    }

    #[tokio::test]
    async fn test_cancelled_before_launch_starts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), RECEIVER_FLUSHES_ON_INT, CONTROLLER_FLUSHES_ON_INT);
        let token = CancellationToken::new();
        token.cancel();
        let mut session =
            CollectionSession::new(config, ExecutionStrategy::Manual, argv("sleep 30"), token)
                .unwrap();

        let mut out = Vec::new();
        let err = session.run(&mut out).await.unwrap_err();
        assert!(matches!(
            err,
            CollectError::Launch(LaunchError::Cancelled { .. })
        ));
        assert!(session.receiver.is_none());
        let report = session.shutdown_report().unwrap();
        assert!(report
            .steps
            .iter()
            .all(|s| s.outcome == TeardownOutcome::NotStarted));
    }

    #[tokio::test]
    async fn test_cancel_during_manual_collection() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), RECEIVER_FLUSHES_ON_INT, CONTROLLER_FLUSHES_ON_INT);
        let token = CancellationToken::new();
        let mut session = CollectionSession::new(
            config,
            ExecutionStrategy::Manual,
            argv("echo working; sleep 30"),
            token.clone(),
        )
        .unwrap();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1_200)).await;
            token.cancel();
        });

        let mut out = Vec::new();
        let summary = session.run(&mut out).await.unwrap();
        assert_eq!(summary.monitor.reason, StopReason::Cancelled);
        assert!(torn_down(summary.shutdown.outcome(ProcessLabel::Target)));
        assert!(torn_down(summary.shutdown.outcome(ProcessLabel::Controller)));
        assert!(torn_down(summary.shutdown.outcome(ProcessLabel::Receiver)));
    }
}
