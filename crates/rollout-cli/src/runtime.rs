use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Run `task` on a fresh runtime. Ctrl-C or SIGTERM cancels the token it
/// receives; the core then stops at its next wait and reports `Cancelled`.
pub fn block_on<T, F, Fut>(task: F) -> anyhow::Result<T>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = rollout_core::Result<T>>,
{
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            tracing::warn!("interrupt received, cancelling");
            trigger.cancel();
        });
        Ok(task(cancel).await?)
    })
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::debug!("SIGTERM handler unavailable: {e}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
