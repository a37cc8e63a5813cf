use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Cancellation root for a process. SIGTERM or SIGINT cancels the
/// returned token; subsystems hang their drain logic off it.
pub fn shutdown_token() -> CancellationToken {
    let root = CancellationToken::new();

    let trigger = root.clone();
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(name) => {
                tracing::info!(signal = name, "shutdown signal received, draining");
                trigger.cancel();
            }
            Err(e) => {
                // Without signal handlers the process can only be killed
                // hard; keep running rather than cancel spuriously.
                tracing::error!(error = %e, "failed to install signal handlers");
            }
        }
    });

    root
}

async fn wait_for_signal() -> std::io::Result<&'static str> {
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    let name = tokio::select! {
        _ = term.recv() => "SIGTERM",
        _ = int.recv() => "SIGINT",
    };
    Ok(name)
}
