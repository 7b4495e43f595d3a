use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::order::MarketKind;
use super::position::Mark;

/// Point-in-time market view handed to strategies.
///
/// Indicator fields are outputs of the signal-generation collaborators
/// (trend, order flow, open interest, relative volume, sentiment). The engine
/// only reads the numbers; how they are computed lives outside this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    /// Last traded / mark price of the primary instrument
    pub price: Decimal,
    #[serde(default)]
    pub spot_price: Option<Decimal>,
    /// Current perpetual funding rate per interval
    #[serde(default)]
    pub funding_rate: Option<Decimal>,
    /// Trend line (e.g. SuperTrend) level
    #[serde(default)]
    pub trend_line: Option<Decimal>,
    /// Change in cumulative volume delta over the last bar
    #[serde(default)]
    pub order_flow_delta: Option<Decimal>,
    /// Current open interest divided by open interest one lookback ago
    #[serde(default)]
    pub open_interest_ratio: Option<Decimal>,
    /// Current volume divided by the trailing average volume
    #[serde(default)]
    pub relative_volume: Option<Decimal>,
    /// 24h price change as a fraction
    #[serde(default)]
    pub price_change: Option<Decimal>,
    /// External sentiment score (0-100)
    #[serde(default)]
    pub sentiment: Option<Decimal>,
}

impl MarketSnapshot {
    pub fn new(symbol: impl Into<String>, price: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            timestamp: Utc::now(),
            price,
            spot_price: None,
            funding_rate: None,
            trend_line: None,
            order_flow_delta: None,
            open_interest_ratio: None,
            relative_volume: None,
            price_change: None,
            sentiment: None,
        }
    }

    /// Perp premium over spot as a fraction of spot
    pub fn basis(&self) -> Option<Decimal> {
        match self.spot_price {
            Some(spot) if spot > Decimal::ZERO => Some((self.price - spot) / spot),
            _ => None,
        }
    }

    /// Execution reference for a market segment; spot falls back to the perp price
    pub fn price_for(&self, market: MarketKind) -> Decimal {
        match market {
            MarketKind::Perp => self.price,
            MarketKind::Spot => self.spot_price.unwrap_or(self.price),
        }
    }

    pub fn mark(&self) -> Mark {
        Mark {
            price: self.price,
            spot_price: self.spot_price,
        }
    }
}
