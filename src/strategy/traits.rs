//! Strategy capability interface
//!
//! Strategies are a closed set of variants. Each one turns a market snapshot
//! (plus the position it currently owns) into an optional signal; everything
//! else (sizing, risk approval, execution, persistence) is the runner's job.

use chrono::{DateTime, Utc};

use super::anomaly::AnomalyEntry;
use super::funding_arb::FundingArb;
use super::momentum::Momentum;
use crate::domain::{Fill, MarketKind, MarketSnapshot, Position, PositionSide};
use crate::risk::RiskEvent;

/// What a strategy wants to do with one symbol
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Enter {
        side: PositionSide,
        /// Market of the primary leg for long entries
        long_market: MarketKind,
        reason: String,
    },
    Exit {
        reason: String,
    },
}

impl Signal {
    pub fn enter(side: PositionSide, long_market: MarketKind, reason: impl Into<String>) -> Self {
        Signal::Enter {
            side,
            long_market,
            reason: reason.into(),
        }
    }

    pub fn exit(reason: impl Into<String>) -> Self {
        Signal::Exit {
            reason: reason.into(),
        }
    }
}

pub trait Strategy: Send {
    fn id(&self) -> &'static str;

    /// Decide on one symbol. `position` is the strategy's live position on
    /// that symbol as read from the state store.
    fn generate_signal(
        &mut self,
        snapshot: &MarketSnapshot,
        position: Option<&Position>,
        now: DateTime<Utc>,
    ) -> Option<Signal>;

    fn on_fill(&mut self, _fill: &Fill) {}

    /// The cycle for `symbol` exceeded its timeout
    fn on_timeout(&mut self, _symbol: &str) {}

    /// Operator exit request. Returns true when the strategy will emit the
    /// exit itself on its next signal; false lets the runner close directly.
    fn on_external_trigger(&mut self, _symbol: &str) -> bool {
        false
    }

    /// Risk conditions observed while generating signals
    fn drain_risk_reports(&mut self) -> Vec<RiskEvent> {
        Vec::new()
    }

    /// Whether snapshots need an external sentiment score
    fn needs_sentiment(&self) -> bool {
        false
    }
}

/// The strategies this engine runs
pub enum StrategyKind {
    FundingArb(FundingArb),
    Momentum(Momentum),
    Anomaly(AnomalyEntry),
}

impl StrategyKind {
    fn inner(&self) -> &dyn Strategy {
        match self {
            StrategyKind::FundingArb(s) => s,
            StrategyKind::Momentum(s) => s,
            StrategyKind::Anomaly(s) => s,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Strategy {
        match self {
            StrategyKind::FundingArb(s) => s,
            StrategyKind::Momentum(s) => s,
            StrategyKind::Anomaly(s) => s,
        }
    }
}

impl Strategy for StrategyKind {
    fn id(&self) -> &'static str {
        self.inner().id()
    }

    fn generate_signal(
        &mut self,
        snapshot: &MarketSnapshot,
        position: Option<&Position>,
        now: DateTime<Utc>,
    ) -> Option<Signal> {
        self.inner_mut().generate_signal(snapshot, position, now)
    }

    fn on_fill(&mut self, fill: &Fill) {
        self.inner_mut().on_fill(fill)
    }

    fn on_timeout(&mut self, symbol: &str) {
        self.inner_mut().on_timeout(symbol)
    }

    fn on_external_trigger(&mut self, symbol: &str) -> bool {
        self.inner_mut().on_external_trigger(symbol)
    }

    fn drain_risk_reports(&mut self) -> Vec<RiskEvent> {
        self.inner_mut().drain_risk_reports()
    }

    fn needs_sentiment(&self) -> bool {
        self.inner().needs_sentiment()
    }
}
