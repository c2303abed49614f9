use tokio::task::JoinHandle;
use tracing::{info, warn};
use worker::{CancelReason, Cancellation};

/// Escucha Ctrl-C (y SIGTERM en unix) y cancela la corrida. El handle se
/// aborta cuando la corrida termina.
pub fn watch_signals(cancel: Cancellation) -> JoinHandle<()> {
    tokio::spawn(async move {
        wait_for_signal().await;
        if cancel.cancel(CancelReason::Signal) {
            info!("señal recibida, cancelando los workers");
        }
    })
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!("no se pudo escuchar SIGTERM: {e}");
            ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    ctrl_c().await;
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("no se pudo escuchar Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
}
