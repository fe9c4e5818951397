use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Cancel `token` on the first SIGTERM or SIGINT.
///
/// Signal streams are registered before returning so a signal that arrives
/// right after startup is not missed. The dispatcher stops taking new work
/// when the token fires; units already running keep their own timers.
pub fn install_shutdown_handler(token: CancellationToken) -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, stopping dispatch");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, stopping dispatch");
            }
            _ = token.cancelled() => return,
        }
        token.cancel();
    });

    Ok(())
}
