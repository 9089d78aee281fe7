//! Cooperative shutdown wiring shared by every reconciler binary.

use tokio_util::sync::CancellationToken;
use tracing::info;

/// Returns a token that is cancelled on SIGINT or SIGTERM.
///
/// Reconciler loops observe the token between iterations; in-flight work
/// finishes its current step. Abrupt termination is covered by lease
/// expiry, so there is nothing else to clean up here.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let signal_token = token.clone();

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut terminate =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(signal) => signal,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to install SIGTERM handler");
                        let _ = tokio::signal::ctrl_c().await;
                        info!("received shutdown signal");
                        signal_token.cancel();
                        return;
                    }
                };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("received shutdown signal");
        signal_token.cancel();
    });

    token
}
