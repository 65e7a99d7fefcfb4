//! 停机信号

use std::future::Future;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 外部注入的停机信号
pub type ShutdownSignal = Pin<Box<dyn Future<Output = ()> + Send>>;

/// 等待 SIGINT 或 SIGTERM（非 unix 平台只有 Ctrl+C）
pub async fn os_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = ctrl_c() => info!("Shutdown signal received (SIGINT)"),
                    _ = terminate.recv() => info!("Shutdown signal received (SIGTERM)"),
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler, listening for Ctrl+C only");
                ctrl_c().await;
                info!("Shutdown signal received (SIGINT)");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c().await;
        info!("Shutdown signal received (Ctrl+C)");
    }
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
}

/// 等待任一停机信号并取消 `cancel`；`cancel` 先被触发时直接返回
pub async fn watch_shutdown(
    cancel: CancellationToken,
    injected: Option<ShutdownSignal>,
    handle_os_signals: bool,
) {
    let injected = async move {
        match injected {
            Some(signal) => {
                signal.await;
                info!("Shutdown signal received");
            }
            None => std::future::pending().await,
        }
    };
    let os = async move {
        if handle_os_signals {
            os_signal().await;
        } else {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = injected => cancel.cancel(),
        _ = os => cancel.cancel(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn injected_signal_cancels() {
        let cancel = CancellationToken::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let watcher = tokio::spawn(watch_shutdown(
            cancel.clone(),
            Some(Box::pin(async move {
                let _ = rx.await;
            })),
            false,
        ));

        tx.send(()).unwrap();
        watcher.await.unwrap();
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn returns_when_already_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), watch_shutdown(cancel, None, false))
            .await
            .unwrap();
    }
}
