//! Coordination primitives shared by the engine's concurrent units:
//! - Bounded retry policy for network and store calls
//! - In-flight placement tracking for drains
//! - Graceful shutdown sequencing

pub mod inflight;
pub mod retry;
pub mod shutdown;

pub use inflight::{InFlightGuard, InFlightTracker};
pub use retry::RetryPolicy;
pub use shutdown::{
    install_signal_handlers, GracefulShutdown, ShutdownConfig, ShutdownError, ShutdownPhase,
    ShutdownSignal, ShutdownSteps,
};
