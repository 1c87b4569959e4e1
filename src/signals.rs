/// Signal handling and cooperative cancellation.
///
/// SIGINT (Ctrl-C) and SIGTERM both cancel a shared [`CancellationToken`].
/// Nothing is interrupted preemptively: the monitoring loop checks the token
/// every poll interval and grace-period waits race it, so a stop request is
/// observed within one poll interval.
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
pub use tokio_util::sync::CancellationToken;

/// Sleep for `duration` unless `token` is cancelled first.
///
/// Returns `true` if the full duration elapsed without cancellation.
pub async fn sleep(token: &CancellationToken, duration: Duration) -> bool {
    if token.is_cancelled() {
        return false;
    }
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => !token.is_cancelled(),
    }
}

/// Install SIGINT and SIGTERM handlers that cancel `token`.
///
/// The handlers live on a background task for the rest of the process.
pub fn install(token: CancellationToken) -> std::io::Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                Some(()) = sigint.recv() => "SIGINT",
                Some(()) = sigterm.recv() => "SIGTERM",
                else => break,
            };
            if !token.is_cancelled() {
                token.cancel();
                println!("\nReceived signal {name}. Stopping trace collection...");
                tracing::info!(signal = name, "cancellation requested");
            } else {
                tracing::debug!(signal = name, "already stopping, ignoring repeated signal");
            }
        }
    });

    Ok(())
}
