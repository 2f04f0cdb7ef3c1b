//! Operator interrupt handling
//!
//! The watcher turns an interrupt source (SIGINT/SIGTERM in production, any
//! future in tests) into cancellation of the run-phase token, and records that
//! the cancellation was operator-initiated.

use console::style;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Listens for one interrupt and cancels the run token in response
#[derive(Debug)]
pub struct CancellationWatcher {
    interrupted: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl CancellationWatcher {
    /// Start watching `interrupt` until it fires or `token` is cancelled elsewhere.
    ///
    /// Only the first interrupt is acted on; the source is dropped afterwards.
    pub fn spawn<F>(interrupt: F, token: CancellationToken) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let interrupted = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&interrupted);

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Run context finished without an operator interrupt");
                }
                _ = interrupt => {
                    flag.store(true, Ordering::SeqCst);
                    info!("Operator interrupt received");
                    eprintln!("\n{}\n", style("Stopping containers...").yellow().bold());
                    token.cancel();
                }
            }
        });

        Self {
            interrupted,
            handle,
        }
    }

    /// Shared operator-interrupt flag
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupted)
    }

    pub fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Stop watching and wait for the listener task to exit
    pub async fn finish(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }
}

/// Exit status used when a second interrupt abandons cleanup
pub const FORCED_EXIT_CODE: i32 = 130;

/// Run `action` on the first interrupt that arrives after `armed` resolves.
///
/// Cleanup stops containers one grace period at a time, so once the run
/// watcher has stopped listening the operator must still be able to abort.
/// The interrupt source is not polled before `armed` resolves.
pub fn spawn_forced_exit<A, F, E>(armed: A, interrupt: F, action: E) -> JoinHandle<()>
where
    A: Future<Output = ()> + Send + 'static,
    F: Future<Output = ()> + Send + 'static,
    E: FnOnce() + Send + 'static,
{
    tokio::spawn(async move {
        armed.await;
        debug!("Listening for a second interrupt during shutdown");
        interrupt.await;
        warn!("Second interrupt received; abandoning cleanup");
        action();
    })
}

/// Terminate the process, leaving any remaining containers behind
pub fn force_exit() {
    eprintln!(
        "\n{}",
        style("Interrupted again; exiting without finishing cleanup").red().bold()
    );
    std::process::exit(FORCED_EXIT_CODE);
}

/// Resolves on the first SIGINT (Ctrl+C) or, on unix, SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => debug!("Received SIGINT"),
        _ = terminate => debug!("Received SIGTERM"),
    }
}
