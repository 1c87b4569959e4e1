mod config;
mod launch;
mod process;
mod session;
mod shutdown;
mod signals;
mod statistics;
mod strategy;

use clap::Parser;
use config::CollectConfig;
use session::{CollectError, CollectionSession, SessionSummary};
use signals::CancellationToken;
use std::path::PathBuf;
use std::process::ExitCode;
use strategy::ExecutionStrategy;
use tracing_subscriber::EnvFilter;

/// Distributed hardware trace collection: start the trace receiver on a
/// remote host, arm the local trace controller, run the target command and
/// stop everything in order when the execution window closes.
///
/// Must be run as root for PCI device access and process control.
#[derive(Parser, Debug)]
#[command(name = "tracecollect", version, about)]
pub struct Cli {
    /// IP address of the trace receiver host
    #[arg(long)]
    trace_receiver_ip: Option<String>,

    /// PCI device ID passed to the trace controller
    #[arg(long)]
    pci_device: Option<String>,

    /// Username for the remote session to the trace receiver
    #[arg(long)]
    trace_receiver_user: Option<String>,

    /// Output trace file path on the trace receiver
    #[arg(long)]
    trace_file: Option<String>,

    /// Trace buffer size in GB
    #[arg(long)]
    buffer_size: Option<u32>,

    /// Directory holding the trace receiver binary on the receiver host
    #[arg(long)]
    trace_receiver_path: Option<String>,

    /// Seconds to collect for; 0 or negative follows the target to completion
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    duration: i64,

    /// Collect until Ctrl-C or until the target exits
    #[arg(long, conflicts_with = "duration")]
    manual: bool,

    /// Path to the local trace controller binary
    #[arg(long)]
    controller_binary: Option<PathBuf>,

    /// Config file path
    #[arg(short, long, default_value = "tracecollect.toml")]
    config: PathBuf,

    /// Print resolved settings and launch commands, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (launch checks, teardown decisions)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors in the log
    #[arg(short, long)]
    quiet: bool,

    /// Target command to run while tracing
    #[arg(last = true, value_name = "TARGET_COMMAND")]
    target: Vec<String>,
}

impl Cli {
    /// Apply command-line overrides on top of file configuration.
    fn apply_overrides(&self, config: &mut CollectConfig) {
        if let Some(ref ip) = self.trace_receiver_ip {
            config.receiver.host = ip.clone();
        }
        if let Some(ref user) = self.trace_receiver_user {
            config.receiver.user = user.clone();
        }
        if let Some(ref file) = self.trace_file {
            config.receiver.trace_file = file.clone();
        }
        if let Some(size) = self.buffer_size {
            config.receiver.buffer_size_gb = size;
        }
        if let Some(ref path) = self.trace_receiver_path {
            config.receiver.path = path.clone();
        }
        if let Some(ref device) = self.pci_device {
            config.controller.pci_device = device.clone();
        }
        if let Some(ref binary) = self.controller_binary {
            config.controller.binary = Some(binary.clone());
        }
    }

    fn strategy(&self) -> ExecutionStrategy {
        ExecutionStrategy::from_duration_secs(self.duration, self.manual)
    }
}

fn init_logging(cli: &Cli) {
    let default_level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

fn load_config(cli: &Cli) -> Result<CollectConfig, config::ConfigError> {
    let mut config = CollectConfig::load(&cli.config)?;
    cli.apply_overrides(&mut config);
    config.validate()?;
    Ok(config)
}

fn print_summary(summary: &SessionSummary) {
    let exit = match summary.monitor.exit_code {
        Some(code) => code.to_string(),
        None => "n/a".to_string(),
    };
    println!(
        "Session started {} ({}): stopped because {}, target exit code {}, ran {:.1}s",
        summary.started_at.format("%Y-%m-%d %H:%M:%S"),
        summary.strategy,
        summary.monitor.reason,
        exit,
        summary.monitor.elapsed.as_secs_f64()
    );
    for step in &summary.shutdown.steps {
        println!("  {}: {}", step.label, step.outcome);
    }
    let found = summary.controller_statistics.len() + summary.receiver_statistics.len();
    tracing::info!(found, "statistics lines surfaced");
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);
    tracing::debug!(?cli, "parsed CLI arguments");

    if !cli.dry_run {
        if let Err(e) = session::ensure_privileged() {
            eprintln!("Error: {e}");
            eprintln!("Usage: sudo tracecollect [options] -- <target_command>");
            return ExitCode::FAILURE;
        }
    }

    let config = match load_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    if cli.dry_run {
        println!("tracecollect v{}", env!("CARGO_PKG_VERSION"));
        println!("Config file: {}", cli.config.display());
        println!("Strategy: {}", cli.strategy());
        println!("{config:#?}");
        match CollectionSession::new(
            config,
            cli.strategy(),
            cli.target.clone(),
            CancellationToken::new(),
        ) {
            Ok(session) => {
                for (label, command) in session.launch_plan() {
                    println!("{label}: {command}");
                }
            }
            Err(e) => println!("Not runnable: {e}"),
        }
        println!("Dry run mode, config validated, not running.");
        return ExitCode::SUCCESS;
    }

    let token = CancellationToken::new();
    let mut session = match CollectionSession::new(config, cli.strategy(), cli.target, token.clone())
    {
        Ok(s) => s,
        Err(CollectError::NoTargetCommand) => {
            eprintln!("Error: No target command provided");
            eprintln!("Usage: sudo tracecollect [options] -- <target_command>");
            return ExitCode::FAILURE;
        }
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = signals::install(token) {
        eprintln!("Error: failed to install signal handlers: {e}");
        return ExitCode::FAILURE;
    }

    let mut stdout = std::io::stdout();
    match session.run(&mut stdout).await {
        Ok(summary) => {
            print_summary(&summary);
            ExitCode::SUCCESS
        }
        Err(e) => {
            if let Some(report) = session.shutdown_report() {
                tracing::debug!(?report, "shutdown report");
            }
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
