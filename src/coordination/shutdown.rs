//! Graceful Shutdown Handler
//!
//! Sequences the engine stop: refuse new placements, drain the ones already
//! in flight, flush state, then close venue sessions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Operator `stop`, SIGTERM, SIGINT
    Graceful,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Graceful => write!(f, "graceful"),
        }
    }
}

/// Configuration for graceful shutdown
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Total timeout for graceful shutdown (default: 60s)
    pub total_timeout_secs: u64,
    /// Time to wait for in-flight placements to ack or time out (default: 30s)
    pub order_drain_timeout_secs: u64,
    /// Time to wait for the state/journal flush (default: 10s)
    pub flush_timeout_secs: u64,
    /// Time to wait for venue sessions to close (default: 10s)
    pub venue_close_timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            total_timeout_secs: 60,
            order_drain_timeout_secs: 30,
            flush_timeout_secs: 10,
            venue_close_timeout_secs: 10,
        }
    }
}

/// Shutdown phase tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    /// Stopping new placement acceptance
    StoppingNewOrders,
    /// Waiting for in-flight placements
    DrainingOrders,
    /// Flushing state store and journal
    Flushing,
    /// Closing venue sessions
    ClosingVenues,
    Complete,
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownPhase::Running => write!(f, "running"),
            ShutdownPhase::StoppingNewOrders => write!(f, "stopping_new_orders"),
            ShutdownPhase::DrainingOrders => write!(f, "draining_orders"),
            ShutdownPhase::Flushing => write!(f, "flushing"),
            ShutdownPhase::ClosingVenues => write!(f, "closing_venues"),
            ShutdownPhase::Complete => write!(f, "complete"),
        }
    }
}

/// Steps the engine plugs into the shutdown sequence
pub struct ShutdownSteps<'a> {
    pub stop_new_orders: BoxFuture<'a, ()>,
    /// Resolves to true when every in-flight placement finished
    pub drain_orders: BoxFuture<'a, bool>,
    pub flush: BoxFuture<'a, Result<(), String>>,
    pub close_venues: BoxFuture<'a, ()>,
}

/// Graceful shutdown coordinator
pub struct GracefulShutdown {
    config: ShutdownConfig,
    shutdown_requested: AtomicBool,
    phase: watch::Sender<ShutdownPhase>,
    phase_rx: watch::Receiver<ShutdownPhase>,
    signal_tx: broadcast::Sender<ShutdownSignal>,
    requested_rx: watch::Receiver<Option<ShutdownSignal>>,
    requested_tx: watch::Sender<Option<ShutdownSignal>>,
}

impl GracefulShutdown {
    pub fn new(config: ShutdownConfig) -> Self {
        let (phase_tx, phase_rx) = watch::channel(ShutdownPhase::Running);
        let (signal_tx, _) = broadcast::channel(8);
        let (requested_tx, requested_rx) = watch::channel(None);

        Self {
            config,
            shutdown_requested: AtomicBool::new(false),
            phase: phase_tx,
            phase_rx,
            signal_tx,
            requested_rx,
            requested_tx,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ShutdownConfig::default())
    }

    /// Subscribe to shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.signal_tx.subscribe()
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    pub fn current_phase(&self) -> ShutdownPhase {
        *self.phase_rx.borrow()
    }

    /// Request shutdown; duplicates are ignored
    pub fn request_shutdown(&self, signal: ShutdownSignal) {
        if self.shutdown_requested.swap(true, Ordering::SeqCst) {
            warn!("Shutdown already requested, ignoring duplicate signal: {}", signal);
            return;
        }

        info!("Shutdown requested: {}", signal);
        let _ = self.requested_tx.send(Some(signal));
        let _ = self.signal_tx.send(signal);
    }

    /// Resolve once a shutdown has been requested, even if the request came
    /// before this call.
    pub async fn wait_for_request(&self) -> ShutdownSignal {
        let mut rx = self.requested_rx.clone();
        loop {
            if let Some(signal) = *rx.borrow_and_update() {
                return signal;
            }
            if rx.changed().await.is_err() {
                return ShutdownSignal::Graceful;
            }
        }
    }

    fn set_phase(&self, phase: ShutdownPhase) {
        let _ = self.phase.send(phase);
        info!("Shutdown phase: {}", phase);
    }

    /// Execute the shutdown sequence
    pub async fn execute(&self, steps: ShutdownSteps<'_>) -> Result<(), ShutdownError> {
        let start = std::time::Instant::now();
        let total_timeout = Duration::from_secs(self.config.total_timeout_secs);

        info!(
            "Starting graceful shutdown (timeout: {}s)",
            self.config.total_timeout_secs
        );

        self.set_phase(ShutdownPhase::StoppingNewOrders);
        steps.stop_new_orders.await;
        debug!("New placement acceptance stopped");

        self.set_phase(ShutdownPhase::DrainingOrders);
        let drain_timeout = Duration::from_secs(self.config.order_drain_timeout_secs);
        let mut drained = false;
        match tokio::time::timeout(drain_timeout, steps.drain_orders).await {
            Ok(true) => {
                drained = true;
                info!("All in-flight placements drained");
            }
            Ok(false) => warn!("Some placements may not have completed during drain"),
            Err(_) => warn!(
                "Placement drain timeout after {}s, proceeding anyway",
                self.config.order_drain_timeout_secs
            ),
        }

        if start.elapsed() > total_timeout {
            error!("Total shutdown timeout exceeded");
            self.set_phase(ShutdownPhase::Complete);
            return Err(ShutdownError::Timeout);
        }

        self.set_phase(ShutdownPhase::Flushing);
        let flush_timeout = Duration::from_secs(self.config.flush_timeout_secs);
        match tokio::time::timeout(flush_timeout, steps.flush).await {
            Ok(Ok(())) => debug!("State flushed"),
            Ok(Err(e)) => warn!("Flush error: {}", e),
            Err(_) => warn!("Flush timeout after {}s", self.config.flush_timeout_secs),
        }

        // Venue sessions close only after the drain so no ack is lost
        self.set_phase(ShutdownPhase::ClosingVenues);
        let close_timeout = Duration::from_secs(self.config.venue_close_timeout_secs);
        if tokio::time::timeout(close_timeout, steps.close_venues)
            .await
            .is_err()
        {
            warn!(
                "Venue close timeout after {}s",
                self.config.venue_close_timeout_secs
            );
        }

        self.set_phase(ShutdownPhase::Complete);
        info!("Graceful shutdown completed in {:?}", start.elapsed());

        if drained {
            Ok(())
        } else {
            Err(ShutdownError::DrainIncomplete)
        }
    }
}

/// Shutdown errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
    Timeout,
    /// Placements were still in flight when the drain window closed
    DrainIncomplete,
}

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownError::Timeout => write!(f, "shutdown timed out"),
            ShutdownError::DrainIncomplete => write!(f, "in-flight placements did not drain"),
        }
    }
}

impl std::error::Error for ShutdownError {}

/// Install SIGTERM/SIGINT handlers that request a graceful shutdown
pub fn install_signal_handlers(shutdown: Arc<GracefulShutdown>) {
    tokio::spawn(async move {
        wait_for_os_signal().await;
        shutdown.request_shutdown(ShutdownSignal::Graceful);
    });
}

async fn wait_for_os_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
