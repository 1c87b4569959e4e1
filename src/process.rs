//! Uniform handle over a spawned child process, local or remote.
//!
//! A remote process is started by running the remote-session program (`ssh`)
//! locally. Its handle is that session process, so liveness and exit codes
//! describe the session, which normally but not necessarily tracks the remote
//! program. Launchers compensate with a grace-period liveness check rather than
//! relying on remote exit-code fidelity.
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::os::fd::OwnedFd;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::net::unix::pipe;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Identity of a process within a collection session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessLabel {
    Receiver,
    Controller,
    Target,
}

impl ProcessLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessLabel::Receiver => "receiver",
            ProcessLabel::Controller => "controller",
            ProcessLabel::Target => "target",
        }
    }

    /// Prefix used when echoing this process's output to the console.
    pub fn echo_prefix(&self) -> &'static str {
        match self {
            ProcessLabel::Receiver => "RECEIVER",
            ProcessLabel::Controller => "CONTROLLER",
            ProcessLabel::Target => "TARGET",
        }
    }
}

impl std::fmt::Display for ProcessLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a managed process. `Exited(None)` means it died from a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Running,
    Exited(Option<i32>),
}

/// How to start a process: directly, or through a remote session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessCommand {
    Local {
        program: String,
        args: Vec<String>,
    },
    Remote {
        session_program: String,
        session_options: Vec<String>,
        destination: String,
        command: String,
    },
}

impl ProcessCommand {
    fn to_command(&self) -> Command {
        match self {
            ProcessCommand::Local { program, args } => {
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
            ProcessCommand::Remote {
                session_program,
                session_options,
                destination,
                command,
            } => {
                let mut cmd = Command::new(session_program);
                cmd.args(session_options).arg(destination).arg(command);
                cmd
            }
        }
    }

    fn program(&self) -> &str {
        match self {
            ProcessCommand::Local { program, .. } => program,
            ProcessCommand::Remote {
                session_program, ..
            } => session_program,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, ProcessCommand::Remote { .. })
    }
}

impl std::fmt::Display for ProcessCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessCommand::Local { program, args } => {
                write!(f, "{program}")?;
                for arg in args {
                    write!(f, " {arg}")?;
                }
                Ok(())
            }
            ProcessCommand::Remote {
                session_program,
                session_options,
                destination,
                command,
            } => {
                write!(f, "{session_program}")?;
                for opt in session_options {
                    write!(f, " {opt}")?;
                }
                write!(f, " {destination} \"{command}\"")
            }
        }
    }
}

/// Whether stderr gets its own channel or is merged into stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Separate,
    Merged,
}

#[derive(Debug, Clone, Copy)]
pub struct SpawnOptions {
    pub stdin: bool,
    pub output: OutputMode,
}

/// Errors from spawning, polling or signalling a managed process.
#[derive(Debug)]
pub enum ProcessError {
    Spawn {
        label: ProcessLabel,
        program: String,
        source: std::io::Error,
    },
    Status {
        label: ProcessLabel,
        source: std::io::Error,
    },
    Signal {
        label: ProcessLabel,
        signal: Signal,
        source: nix::Error,
    },
    NotStarted {
        label: ProcessLabel,
    },
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessError::Spawn {
                label,
                program,
                source,
            } => write!(f, "failed to spawn {label} ({program}): {source}"),
            ProcessError::Status { label, source } => {
                write!(f, "failed to query {label} status: {source}")
            }
            ProcessError::Signal {
                label,
                signal,
                source,
            } => write!(f, "failed to send {signal} to {label}: {source}"),
            ProcessError::NotStarted { label } => write!(f, "{label} has not been started"),
        }
    }
}

impl std::error::Error for ProcessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProcessError::Spawn { source, .. } => Some(source),
            ProcessError::Status { source, .. } => Some(source),
            ProcessError::Signal { source, .. } => Some(source),
            ProcessError::NotStarted { .. } => None,
        }
    }
}

/// A child process owned by a collection session.
///
/// Output is forwarded line by line into channels by background reader tasks,
/// so reads never block the caller beyond the timeout they ask for.
#[derive(Debug)]
pub struct ManagedProcess {
    label: ProcessLabel,
    command: ProcessCommand,
    state: ProcessState,
    child: Option<Child>,
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    stdout: Option<mpsc::UnboundedReceiver<String>>,
    stderr: Option<mpsc::UnboundedReceiver<String>>,
}

impl ManagedProcess {
    pub fn new(label: ProcessLabel, command: ProcessCommand) -> Self {
        Self {
            label,
            command,
            state: ProcessState::NotStarted,
            child: None,
            pid: None,
            stdin: None,
            stdout: None,
            stderr: None,
        }
    }

    pub fn label(&self) -> ProcessLabel {
        self.label
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Last observed state; call [`poll_state`](Self::poll_state) to refresh.
    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Spawn the process in its own process group with piped output.
    ///
    /// In `Merged` mode stdout and stderr share one pipe, so the child's
    /// interleaving of the two streams is preserved line for line.
    pub fn start(&mut self, options: SpawnOptions) -> Result<(), ProcessError> {
        let spawn_error = |source| ProcessError::Spawn {
            label: self.label,
            program: self.command.program().to_string(),
            source,
        };

        let mut cmd = self.command.to_command();
        cmd.stdin(if options.stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .process_group(0) // Own group: terminal Ctrl-C reaches only us
        .kill_on_drop(true);

        let merged = match options.output {
            OutputMode::Merged => {
                let (reader, writer) = std::io::pipe().map_err(spawn_error)?;
                let writer_err = writer.try_clone().map_err(spawn_error)?;
                cmd.stdout(writer).stderr(writer_err);
                Some(reader)
            }
            OutputMode::Separate => {
                cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
                None
            }
        };

        let mut child = cmd.spawn().map_err(spawn_error)?;
        // Our copies of the write end must close or the reader never sees EOF
        drop(cmd);

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        match merged {
            Some(reader) => {
                let reader = pipe::Receiver::from_owned_fd(OwnedFd::from(reader))
                    .map_err(spawn_error)?;
                forward_lines(reader, out_tx);
            }
            None => {
                if let Some(stdout) = child.stdout.take() {
                    forward_lines(stdout, out_tx);
                }
                if let Some(stderr) = child.stderr.take() {
                    let (err_tx, err_rx) = mpsc::unbounded_channel();
                    forward_lines(stderr, err_tx);
                    self.stderr = Some(err_rx);
                }
            }
        }

        self.pid = child.id();
        self.stdin = child.stdin.take();
        self.stdout = Some(out_rx);
        self.child = Some(child);
        self.state = ProcessState::Running;

        tracing::debug!(
            label = %self.label,
            pid = ?self.pid,
            remote = self.command.is_remote(),
            command = %self.command,
            "process started"
        );
        Ok(())
    }

    /// Refresh and return the lifecycle state without blocking.
    pub fn poll_state(&mut self) -> Result<ProcessState, ProcessError> {
        if self.state != ProcessState::Running {
            return Ok(self.state);
        }
        let Some(child) = self.child.as_mut() else {
            return Ok(self.state);
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                self.state = ProcessState::Exited(status.code());
                tracing::debug!(label = %self.label, exit_code = ?status.code(), "process exited");
            }
            Ok(None) => {}
            Err(e) => {
                return Err(ProcessError::Status {
                    label: self.label,
                    source: e,
                })
            }
        }
        Ok(self.state)
    }

    /// Whether the process is running. Status errors count as not alive.
    pub fn is_alive(&mut self) -> bool {
        match self.poll_state() {
            Ok(state) => state == ProcessState::Running,
            Err(e) => {
                tracing::warn!(error = %e, "treating process as exited");
                false
            }
        }
    }

    /// Next output line, waiting at most `timeout`. A zero timeout never waits.
    pub async fn try_read_line(&mut self, timeout: Duration) -> Option<String> {
        let rx = self.stdout.as_mut()?;
        if let Ok(line) = rx.try_recv() {
            return Some(line);
        }
        if timeout.is_zero() {
            return None;
        }
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    /// Write `line` plus a newline to stdin and flush.
    ///
    /// Silently does nothing when stdin is closed or the process has exited.
    pub async fn write_line(&mut self, line: &str) {
        if !self.is_alive() {
            tracing::debug!(label = %self.label, "not writing to exited process");
            return;
        }
        let Some(stdin) = self.stdin.as_mut() else {
            tracing::debug!(label = %self.label, "no stdin to write to");
            return;
        };
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        let result = async {
            stdin.write_all(&buf).await?;
            stdin.flush().await
        }
        .await;
        if let Err(e) = result {
            tracing::debug!(label = %self.label, error = %e, "write to stdin failed");
        }
    }

    /// Graceful stop: SIGTERM to the process group.
    pub fn terminate(&self) -> Result<(), ProcessError> {
        self.signal_group(Signal::SIGTERM)
    }

    /// Interrupt: SIGINT to the process group, the same as Ctrl-C.
    pub fn interrupt(&self) -> Result<(), ProcessError> {
        self.signal_group(Signal::SIGINT)
    }

    /// Forceful, unconditional stop: SIGKILL to the group, then the child itself.
    pub fn kill(&mut self) -> Result<(), ProcessError> {
        let group = self.signal_group(Signal::SIGKILL);
        let Some(child) = self.child.as_mut() else {
            return group;
        };
        match child.start_kill() {
            Ok(()) => Ok(()),
            // Already reaped or gone with its group
            Err(_) if group.is_ok() => Ok(()),
            Err(e) => Err(ProcessError::Status {
                label: self.label,
                source: e,
            }),
        }
    }

    /// Wait up to `timeout` for the process to exit.
    ///
    /// Returns the exit state, or `None` if it is still running at the deadline.
    pub async fn wait_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<ProcessState>, ProcessError> {
        if let ProcessState::Exited(_) = self.poll_state()? {
            return Ok(Some(self.state));
        }
        let Some(child) = self.child.as_mut() else {
            return Err(ProcessError::NotStarted { label: self.label });
        };
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                self.state = ProcessState::Exited(status.code());
                Ok(Some(self.state))
            }
            Ok(Err(e)) => Err(ProcessError::Status {
                label: self.label,
                source: e,
            }),
            Err(_) => Ok(None),
        }
    }

    /// Block until the process exits and return its exit code.
    pub async fn wait(&mut self) -> Result<Option<i32>, ProcessError> {
        if let ProcessState::Exited(code) = self.poll_state()? {
            return Ok(code);
        }
        let Some(child) = self.child.as_mut() else {
            return Err(ProcessError::NotStarted { label: self.label });
        };
        let status = child.wait().await.map_err(|e| ProcessError::Status {
            label: self.label,
            source: e,
        })?;
        self.state = ProcessState::Exited(status.code());
        Ok(status.code())
    }

    /// Collect buffered stdout until the stream closes or `timeout` elapses.
    pub async fn drain_remaining_output(&mut self, timeout: Duration) -> String {
        match self.stdout.as_mut() {
            Some(rx) => drain(rx, timeout).await.join("\n"),
            None => String::new(),
        }
    }

    /// Collect buffered stderr; empty when stderr is merged into stdout.
    pub async fn drain_remaining_errors(&mut self, timeout: Duration) -> String {
        match self.stderr.as_mut() {
            Some(rx) => drain(rx, timeout).await.join("\n"),
            None => String::new(),
        }
    }

    fn signal_group(&self, signal: Signal) -> Result<(), ProcessError> {
        let Some(pid) = self.pid else {
            return Err(ProcessError::NotStarted { label: self.label });
        };
        killpg(Pid::from_raw(pid as i32), signal).map_err(|e| ProcessError::Signal {
            label: self.label,
            signal,
            source: e,
        })
    }
}

async fn drain(rx: &mut mpsc::UnboundedReceiver<String>, timeout: Duration) -> Vec<String> {
    let deadline = Instant::now() + timeout;
    let mut lines = Vec::new();
    // Buffered lines are taken even after the deadline: timeout polls recv first
    while let Ok(Some(line)) = tokio::time::timeout_at(deadline, rx.recv()).await {
        lines.push(line);
    }
    lines
}

/// Forward lines from `reader` into `tx` until EOF. Invalid UTF-8 is replaced.
fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']).to_string();
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "output stream closed with error");
                    break;
                }
            }
        }
    });
}
