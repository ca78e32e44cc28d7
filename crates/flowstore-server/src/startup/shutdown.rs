//! Shutdown signal handling for the simulation binary

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Shutdown signal sender and receiver
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: broadcast::Sender<()>,
    triggered: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self {
            sender,
            triggered: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Get a receiver for shutdown notifications
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }

    pub fn shutdown(&self) {
        self.triggered.store(true, Ordering::SeqCst);
        let _ = self.sender.send(());
    }

    pub fn is_shutdown(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for Ctrl+C or SIGTERM in the background
///
/// Returns the signal that fires once either arrives. If a handler cannot be
/// installed the error is logged and that source never fires.
pub fn wait_for_shutdown_signal() -> ShutdownSignal {
    let shutdown = ShutdownSignal::new();
    let shutdown_clone = shutdown.clone();

    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C, initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
        }

        shutdown_clone.shutdown();
    });

    shutdown
}

/// Run a future until it finishes or a shutdown signal arrives
pub async fn run_with_shutdown<F, T>(
    future: F,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Option<T>
where
    F: std::future::Future<Output = T>,
{
    tokio::select! {
        result = future => Some(result),
        _ = shutdown_rx.recv() => {
            warn!("Shutdown signal received, cancelling operation");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_shutdown_signal() {
        let signal = ShutdownSignal::new();
        let mut rx = signal.subscribe();
        assert!(!signal.is_shutdown());

        let signal_clone = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            signal_clone.shutdown();
        });

        let result = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(result.is_ok());
        assert!(signal.is_shutdown());
    }

    #[tokio::test]
    async fn test_run_with_shutdown_cancels() {
        let signal = ShutdownSignal::new();
        let rx = signal.subscribe();

        let task = async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            42
        };

        let signal_clone = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            signal_clone.shutdown();
        });

        assert!(run_with_shutdown(task, rx).await.is_none());
    }

    #[tokio::test]
    async fn test_run_with_shutdown_completes() {
        let signal = ShutdownSignal::new();
        let result = run_with_shutdown(async { 7 }, signal.subscribe()).await;
        assert_eq!(result, Some(7));
    }
}
