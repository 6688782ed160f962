//! Signal & Shutdown Coordinator (spec §4.K).
//!
//! Generalizes `codescope::main.rs`'s `shutdown_signal()` (a `tokio::select!`
//! over `ctrl_c`/`sigterm` that just logs and returns) into a full
//! coordinator: SIGHUP is routed to config reload rather than shutdown, an
//! uncaught panic is funneled through the same shutdown path via
//! `std::panic::set_hook`, and shutdown itself runs the ordered sequence in
//! §4.K rather than handing control straight back to `axum`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::manager::FolderManager;
use crate::model_registry::ModelRegistry;
use crate::singleton::SingletonGuard;

/// The reason the coordinator woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Terminate,
    Reload,
    Panic,
}

/// Tracks whether a shutdown has already begun, so a second signal (or a
/// panic during shutdown itself) doesn't re-enter the sequence.
#[derive(Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn mark(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    /// Mark shutting-down directly, without running the full sequence.
    /// Exposed for tests that only need to exercise the flag's effect on
    /// another component (e.g. the control plane's short-circuit checks).
    #[cfg(test)]
    pub fn mark_for_test(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Install a panic hook that, on first panic, logs and sends
/// [`ShutdownSignal::Panic`] down `tx` so the coordinator can still run the
/// graceful sequence before the process exits (§4.K "uncaught panic in any
/// async task is treated as fatal and routed through the same shutdown
/// path").
pub fn install_panic_hook(tx: mpsc::UnboundedSender<ShutdownSignal>) {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        error!(panic = %info, "uncaught panic, initiating shutdown");
        let _ = tx.send(ShutdownSignal::Panic);
        default_hook(info);
    }));
}

/// Wait for SIGINT/SIGTERM/SIGHUP (SIGHUP maps to [`ShutdownSignal::Reload`],
/// not shutdown) on Unix, or Ctrl+C alone elsewhere (§4.K).
#[cfg(unix)]
pub async fn wait_for_os_signal() -> ShutdownSignal {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    let mut sighup = signal(SignalKind::hangup()).expect("failed to register SIGHUP handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => { info!("received SIGINT"); ShutdownSignal::Terminate }
        _ = sigterm.recv() => { info!("received SIGTERM"); ShutdownSignal::Terminate }
        _ = sighup.recv() => { info!("received SIGHUP, will reload configuration"); ShutdownSignal::Reload }
    }
}

#[cfg(not(unix))]
pub async fn wait_for_os_signal() -> ShutdownSignal {
    tokio::signal::ctrl_c().await.expect("failed to listen for Ctrl+C");
    info!("received Ctrl+C");
    ShutdownSignal::Terminate
}

/// Run the ordered graceful shutdown sequence (§4.K step 5):
/// mark shutting-down, stop every folder, unload every model, release the
/// singleton registry entry. `supervisor_stop` is a caller-supplied closure
/// so this module doesn't need to own a concrete supervisor instance.
pub async fn graceful_shutdown<F, Fut>(
    flag: &ShutdownFlag,
    manager: &FolderManager,
    registry: &ModelRegistry,
    singleton: Option<SingletonGuard>,
    supervisor_stop: F,
) where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    if !flag.mark() {
        warn!("shutdown already in progress, ignoring duplicate trigger");
        return;
    }

    info!("beginning graceful shutdown");
    manager.stop_all().await;
    registry.shutdown().await;

    match tokio::time::timeout(Duration::from_secs(10), supervisor_stop()).await {
        Ok(()) => {}
        Err(_) => warn!("supervisor did not stop within the shutdown timeout"),
    }

    if let Some(guard) = singleton {
        guard.release();
    }
    info!("shutdown complete");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_marks_only_once() {
        let flag = ShutdownFlag::new();
        assert!(flag.mark());
        assert!(!flag.mark());
        assert!(flag.is_shutting_down());
    }

    #[tokio::test]
    async fn graceful_shutdown_is_idempotent() {
        let flag = ShutdownFlag::new();
        let manager = FolderManager::new(Arc::new(ModelRegistry::new(2)));
        let registry = ModelRegistry::new(2);

        graceful_shutdown(&flag, &manager, &registry, None, || async {}).await;
        // second call must not panic or double-run the sequence
        graceful_shutdown(&flag, &manager, &registry, None, || async {}).await;
        assert!(flag.is_shutting_down());
    }
}
