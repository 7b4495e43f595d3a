use rust_decimal::Decimal;
use serde::Serialize;

/// Signals the governor consumes between evaluation ticks
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RiskEvent {
    /// Rolling average call latency for a venue crossed the threshold
    HighLatency { venue: String, average_ms: u64 },
    LatencyRecovered { venue: String, average_ms: u64 },
    /// A hedged strategy observed basis beyond its limit
    BasisBreach {
        strategy_id: String,
        symbol: String,
        basis: Decimal,
    },
}

impl RiskEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            RiskEvent::HighLatency { .. } => "high_latency",
            RiskEvent::LatencyRecovered { .. } => "latency_recovered",
            RiskEvent::BasisBreach { .. } => "basis_breach",
        }
    }
}
