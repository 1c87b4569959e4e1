/// Sequenced startup of the receiver, controller and target processes.
///
/// Receiver and controller are confirmed by waiting out a grace period and
/// checking they are still alive. The target is started without confirmation
/// and handed straight to the execution strategy.
use crate::config::{ControllerConfig, ReceiverConfig};
use crate::process::{
    ManagedProcess, OutputMode, ProcessCommand, ProcessError, ProcessLabel, ProcessState,
    SpawnOptions,
};
use crate::signals::{self, CancellationToken};
use std::io::Write;
use std::time::Duration;

/// Launch failures. Any of these aborts the remaining launch sequence.
#[derive(Debug)]
pub enum LaunchError {
    Spawn(ProcessError),
    /// The process exited inside its grace period.
    ExitedEarly {
        label: ProcessLabel,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    /// A stop was requested before the launch sequence finished.
    Cancelled { label: ProcessLabel },
}

impl std::fmt::Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchError::Spawn(e) => write!(f, "{e}"),
            LaunchError::ExitedEarly {
                label, exit_code, ..
            } => match exit_code {
                Some(code) => write!(f, "{label} exited early with code: {code}"),
                None => write!(f, "{label} exited early (killed by signal)"),
            },
            LaunchError::Cancelled { label } => {
                write!(f, "cancelled while starting {label}")
            }
        }
    }
}

impl std::error::Error for LaunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LaunchError::Spawn(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ProcessError> for LaunchError {
    fn from(e: ProcessError) -> Self {
        LaunchError::Spawn(e)
    }
}

impl LaunchError {
    pub fn label(&self) -> Option<ProcessLabel> {
        match self {
            LaunchError::Spawn(
                ProcessError::Spawn { label, .. }
                | ProcessError::Status { label, .. }
                | ProcessError::Signal { label, .. }
                | ProcessError::NotStarted { label },
            ) => Some(*label),
            LaunchError::ExitedEarly { label, .. } | LaunchError::Cancelled { label } => {
                Some(*label)
            }
        }
    }
}

/// How long to wait before deciding a freshly started process survived.
#[derive(Debug, Clone, Copy)]
pub struct GracePeriod {
    pub confirm: Duration,
    /// Bound on collecting diagnostics from a process that died early.
    pub diagnostics: Duration,
}

/// Wait out the grace period, then require the process to still be alive.
async fn confirm_alive(
    process: &mut ManagedProcess,
    grace: GracePeriod,
    token: &CancellationToken,
) -> Result<(), LaunchError> {
    let label = process.label();
    if !signals::sleep(token, grace.confirm).await {
        return Err(LaunchError::Cancelled { label });
    }
    if process.is_alive() {
        tracing::debug!(%label, grace_ms = grace.confirm.as_millis() as u64, "process survived grace period");
        return Ok(());
    }
    let exit_code = match process.state() {
        ProcessState::Exited(code) => code,
        _ => None,
    };
    let stdout = process.drain_remaining_output(grace.diagnostics).await;
    let stderr = process.drain_remaining_errors(grace.diagnostics).await;
    Err(LaunchError::ExitedEarly {
        label,
        exit_code,
        stdout,
        stderr,
    })
}

/// Starts the trace receiver on the remote host through a remote session.
pub struct RemoteProcessLauncher<'a> {
    config: &'a ReceiverConfig,
    grace: GracePeriod,
}

impl<'a> RemoteProcessLauncher<'a> {
    pub fn new(config: &'a ReceiverConfig, grace: GracePeriod) -> Self {
        Self { config, grace }
    }

    pub fn command(&self) -> ProcessCommand {
        ProcessCommand::Remote {
            session_program: self.config.ssh_program.clone(),
            session_options: self.config.ssh_options.clone(),
            destination: self.config.destination(),
            command: self.config.remote_command(),
        }
    }

    pub fn spawn(&self) -> Result<ManagedProcess, LaunchError> {
        let mut process = ManagedProcess::new(ProcessLabel::Receiver, self.command());
        process.start(SpawnOptions {
            stdin: false,
            output: OutputMode::Separate,
        })?;
        tracing::info!(host = %self.config.host, pid = ?process.pid(), "receiver session started");
        Ok(process)
    }

    /// Liveness here is the session's, not the remote program's.
    pub async fn confirm(
        &self,
        process: &mut ManagedProcess,
        token: &CancellationToken,
    ) -> Result<(), LaunchError> {
        confirm_alive(process, self.grace, token).await
    }
}

/// Starts the trace controller on the local host.
pub struct LocalProcessLauncher<'a> {
    config: &'a ControllerConfig,
    receiver_host: &'a str,
    grace: GracePeriod,
}

impl<'a> LocalProcessLauncher<'a> {
    pub fn new(config: &'a ControllerConfig, receiver_host: &'a str, grace: GracePeriod) -> Self {
        Self {
            config,
            receiver_host,
            grace,
        }
    }

    pub fn command(&self) -> ProcessCommand {
        ProcessCommand::Local {
            program: self.config.resolve_binary().display().to_string(),
            args: vec![
                self.config.pci_device.clone(),
                self.receiver_host.to_string(),
            ],
        }
    }

    pub fn spawn(&self) -> Result<ManagedProcess, LaunchError> {
        let mut process = ManagedProcess::new(ProcessLabel::Controller, self.command());
        process.start(SpawnOptions {
            stdin: true,
            output: OutputMode::Separate,
        })?;
        tracing::info!(pci_device = %self.config.pci_device, pid = ?process.pid(), "controller started");
        Ok(process)
    }

    pub async fn confirm(
        &self,
        process: &mut ManagedProcess,
        token: &CancellationToken,
    ) -> Result<(), LaunchError> {
        confirm_alive(process, self.grace, token).await
    }
}

/// Tell the controller to begin capture: one newline on its stdin.
///
/// Fire-and-forget. The following delay bounds the race between arming and
/// the target's first activity. Returns `false` if cancelled during the delay.
pub async fn arm_controller(
    controller: &mut ManagedProcess,
    delay: Duration,
    token: &CancellationToken,
) -> bool {
    controller.write_line("").await;
    tracing::debug!("controller armed");
    signals::sleep(token, delay).await
}

/// Spawn the target workload with stderr merged into stdout. Does not wait.
pub fn start_target(argv: &[String]) -> Result<ManagedProcess, LaunchError> {
    let Some((program, args)) = argv.split_first() else {
        return Err(LaunchError::Spawn(ProcessError::NotStarted {
            label: ProcessLabel::Target,
        }));
    };
    let mut process = ManagedProcess::new(
        ProcessLabel::Target,
        ProcessCommand::Local {
            program: program.clone(),
            args: args.to_vec(),
        },
    );
    process.start(SpawnOptions {
        stdin: false,
        output: OutputMode::Merged,
    })?;
    tracing::info!(pid = ?process.pid(), "target started");
    Ok(process)
}

/// Print what an early-exiting process left behind.
pub fn report_launch_failure<W: Write>(out: &mut W, err: &LaunchError) {
    let _ = writeln!(out, "{}", capitalize(&err.to_string()));
    if let LaunchError::ExitedEarly {
        label,
        stdout,
        stderr,
        ..
    } = err
    {
        let name = capitalize(label.as_str());
        if !stdout.trim().is_empty() {
            let _ = writeln!(out, "{name} stdout: {stdout}");
        }
        if !stderr.trim().is_empty() {
            let _ = writeln!(out, "{name} stderr: {stderr}");
        }
    }
}

pub(crate) fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grace(ms: u64) -> GracePeriod {
        GracePeriod {
            confirm: Duration::from_millis(ms),
            diagnostics: Duration::from_secs(1),
        }
    }

    fn stand_in_receiver(dir: &std::path::Path, script: &str) -> ReceiverConfig {
        std::fs::write(dir.join("trace_receiver"), script).unwrap();
        ReceiverConfig {
            host: "trace-host".to_string(),
            user: "lab".to_string(),
            path: dir.display().to_string(),
            privilege_command: "sh".to_string(),
            ssh_program: "sh".to_string(),
            ssh_options: vec![
                "-c".to_string(),
                "eval \"$2\"".to_string(),
                "ssh".to_string(),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_receiver_command_shape() {
        let config = ReceiverConfig {
            host: "10.0.0.9".to_string(),
            user: "lab".to_string(),
            path: "/srv/trace".to_string(),
            ..Default::default()
        };
        let launcher = RemoteProcessLauncher::new(&config, grace(0));
        assert_eq!(
            launcher.command(),
            ProcessCommand::Remote {
                session_program: "ssh".to_string(),
                session_options: vec![],
                destination: "lab@10.0.0.9".to_string(),
                command: "cd /srv/trace && sudo ./trace_receiver /tmp/trace_record.bin 10"
                    .to_string(),
            }
        );
    }

    #[test]
    fn test_controller_command_shape() {
        let config = ControllerConfig {
            binary: Some("/opt/trace/trace_controller".into()),
            pci_device: "0000:49:00.1".to_string(),
        };
        let launcher = LocalProcessLauncher::new(&config, "192.168.1.100", grace(0));
        assert_eq!(
            launcher.command(),
            ProcessCommand::Local {
                program: "/opt/trace/trace_controller".to_string(),
                args: vec!["0000:49:00.1".to_string(), "192.168.1.100".to_string()],
            }
        );
    }

    #[tokio::test]
    async fn test_receiver_confirmed_when_alive() {
        let dir = tempfile::tempdir().unwrap();
        let config = stand_in_receiver(dir.path(), "sleep 5\n");
        let launcher = RemoteProcessLauncher::new(&config, grace(150));
        let mut process = launcher.spawn().unwrap();
        let token = CancellationToken::new();
        launcher.confirm(&mut process, &token).await.unwrap();
        assert!(process.is_alive());
        process.kill().unwrap();
    }

    #[tokio::test]
    async fn test_receiver_early_exit_surfaces_output() {
        let dir = tempfile::tempdir().unwrap();
        let config = stand_in_receiver(
            dir.path(),
            "echo \"Output file: $1\"\necho 'mmap failed' >&2\nexit 2\n",
        );
        let launcher = RemoteProcessLauncher::new(&config, grace(300));
        let mut process = launcher.spawn().unwrap();
        let token = CancellationToken::new();
        let err = launcher.confirm(&mut process, &token).await.unwrap_err();
        match err {
            LaunchError::ExitedEarly {
                label,
                exit_code,
                ref stdout,
                ref stderr,
            } => {
                assert_eq!(label, ProcessLabel::Receiver);
                assert_eq!(exit_code, Some(2));
                assert_eq!(stdout, "Output file: /tmp/trace_record.bin");
                assert_eq!(stderr, "mmap failed");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_confirm_observes_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let config = stand_in_receiver(dir.path(), "sleep 5\n");
        let launcher = RemoteProcessLauncher::new(&config, grace(5_000));
        let mut process = launcher.spawn().unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let err = launcher.confirm(&mut process, &token).await.unwrap_err();
        assert!(matches!(err, LaunchError::Cancelled { .. }));
        assert_eq!(process.state(), ProcessState::Running);
        process.kill().unwrap();
    }

    #[tokio::test]
    async fn test_controller_missing_binary_is_spawn_error() {
        let config = ControllerConfig {
            binary: Some("/nonexistent/trace_controller".into()),
            ..Default::default()
        };
        let launcher = LocalProcessLauncher::new(&config, "10.0.0.1", grace(0));
        let err = launcher.spawn().unwrap_err();
        assert!(matches!(err, LaunchError::Spawn(ProcessError::Spawn { .. })));
        assert_eq!(err.label(), Some(ProcessLabel::Controller));
    }

    #[tokio::test]
    async fn test_arm_sends_newline() {
        let mut controller = ManagedProcess::new(
            ProcessLabel::Controller,
            ProcessCommand::Local {
                program: "sh".to_string(),
                args: vec![
                    "-c".to_string(),
                    "read line; echo \"armed:[$line]\"".to_string(),
                ],
            },
        );
        controller
            .start(SpawnOptions {
                stdin: true,
                output: OutputMode::Separate,
            })
            .unwrap();
        let token = CancellationToken::new();
        let armed = arm_controller(&mut controller, Duration::from_millis(50), &token).await;
        assert!(armed);
        assert_eq!(
            controller
                .try_read_line(Duration::from_secs(2))
                .await
                .as_deref(),
            Some("armed:[]")
        );
    }

    #[tokio::test]
    async fn test_start_target_keeps_stdout_stderr_interleaving() {
        let argv = vec![
            "sh".to_string(),
            "-c".to_string(),
            "for i in 1 2 3 4 5 6 7 8; do echo out$i; echo err$i >&2; done".to_string(),
        ];
        let expected: Vec<String> = (1..=8)
            .flat_map(|i| [format!("out{i}"), format!("err{i}")])
            .collect();

        for _ in 0..10 {
            let mut target = start_target(&argv).unwrap();
            target.wait().await.unwrap();
            let output = target.drain_remaining_output(Duration::from_secs(2)).await;
            let lines: Vec<String> = output.lines().map(str::to_string).collect();
            assert_eq!(lines, expected);
        }
    }

    #[test]
    fn test_start_target_rejects_empty_command() {
        assert!(start_target(&[]).is_err());
    }

    #[test]
    fn test_report_launch_failure_lines() {
        let err = LaunchError::ExitedEarly {
            label: ProcessLabel::Controller,
            exit_code: Some(1),
            stdout: "Connecting to trace receiver at 10.0.0.1...".to_string(),
            stderr: "Failed to connect to receiver".to_string(),
        };
        let mut out = Vec::new();
        report_launch_failure(&mut out, &err);
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "Controller exited early with code: 1\n\
             Controller stdout: Connecting to trace receiver at 10.0.0.1...\n\
             Controller stderr: Failed to connect to receiver\n"
        );
    }
}
