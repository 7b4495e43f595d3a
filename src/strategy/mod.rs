//! Strategy module
//!
//! Trading strategies and the runtime that drives them.
//!
//! ## Architecture
//!
//! - `traits` - the `Strategy` contract and the closed set of strategy kinds
//! - `funding_arb`, `momentum`, `anomaly` - signal logic, no I/O
//! - `runtime` - one runner task per strategy: sizing, risk approval,
//!   placement and position bookkeeping
//! - `reconciliation` - startup check of the store against the venues

// =============================================================================
// Strategy trait and inputs
// =============================================================================

pub mod feeds;
pub mod sizing;
pub mod traits;

pub use feeds::{MarketFeed, SentimentOracle};
pub use sizing::{round_down_to_step, SizingRules};
pub use traits::{Signal, Strategy, StrategyKind};

// =============================================================================
// Strategies
// =============================================================================

pub mod anomaly;
pub mod funding_arb;
pub mod momentum;

pub use anomaly::{AnomalyEntry, ANOMALY};
pub use funding_arb::{FundingArb, FUNDING_ARB};
pub use momentum::{Momentum, MOMENTUM};

// =============================================================================
// Runtime
// =============================================================================

pub mod reconciliation;
pub mod runtime;

pub use reconciliation::{reconcile, MismatchKind, ReconciliationMismatch, ReconciliationReport};
pub use runtime::{RunnerCommand, RunnerHandle, RunnerSettings, RuntimeServices, StrategyRunner};
