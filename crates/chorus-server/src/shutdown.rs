use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::fanout::FanoutBus;
use crate::presence::{PresenceCounter, ReconcileReport};
use crate::registry::Registry;

/// Process-wide "we are exiting" marker, shared with the session coordinator.
#[derive(Clone, Debug, Default)]
pub struct ExitFlag(Arc<AtomicBool>);

impl ExitFlag {
    pub fn is_exiting(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Returns whether the flag was already set.
    fn mark(&self) -> bool {
        self.0.swap(true, Ordering::SeqCst)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShutdownReport {
    pub connections_closed: usize,
    pub presence: ReconcileReport,
}

/// Takes this process out of the fleet cleanly.
pub struct ShutdownReconciler {
    exit: ExitFlag,
    registry: Arc<Registry>,
    presence: Arc<PresenceCounter>,
    bus: Arc<FanoutBus>,
    grace: Duration,
}

impl ShutdownReconciler {
    pub fn new(
        exit: ExitFlag,
        registry: Arc<Registry>,
        presence: Arc<PresenceCounter>,
        bus: Arc<FanoutBus>,
        grace: Duration,
    ) -> Self {
        Self {
            exit,
            registry,
            presence,
            bus,
            grace,
        }
    }

    pub fn is_exiting(&self) -> bool {
        self.exit.is_exiting()
    }

    /// Close every connection, subtract this process's presence share, then
    /// stop the fan-out bus, all within the grace period.
    ///
    /// Only the first call does anything; later calls return `None`. `None`
    /// is also returned when the grace period runs out.
    pub async fn shutdown(&self) -> Option<ShutdownReport> {
        if self.exit.mark() {
            tracing::debug!("Shutdown already in progress");
            return None;
        }
        tracing::info!(grace_secs = self.grace.as_secs(), "Shutting down");

        let sequence = async {
            let connections_closed = self.registry.close_all().await;
            let presence = self.presence.reconcile_on_shutdown().await;
            self.bus.stop().await;
            ShutdownReport {
                connections_closed,
                presence,
            }
        };

        match tokio::time::timeout(self.grace, sequence).await {
            Ok(report) => {
                tracing::info!(
                    connections_closed = report.connections_closed,
                    "Shutdown complete"
                );
                Some(report)
            }
            Err(_) => {
                tracing::error!(grace_secs = self.grace.as_secs(), "Shutdown exceeded grace period");
                None
            }
        }
    }
}

/// Resolves on SIGINT, or SIGTERM on unix.
pub async fn termination_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
