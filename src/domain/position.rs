use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::order::{Fill, MarketKind, PositionSide};

/// Position lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Open,
    Closing,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "OPEN",
            PositionStatus::Closing => "CLOSING",
            PositionStatus::Closed => "CLOSED",
        }
    }

    /// Check if this status can transition to another status
    pub fn can_transition_to(&self, target: PositionStatus) -> bool {
        use PositionStatus::*;

        match (self, target) {
            // Exit signal or kill switch
            (Open, Closing) => true,
            // Confirmed exit fill
            (Closing, Closed) => true,
            // Reconciliation: venue is already flat
            (Open, Closed) => true,
            _ => false,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, PositionStatus::Open | PositionStatus::Closing)
    }
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Store key of a position: one per (strategy, symbol)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PositionKey {
    pub strategy_id: String,
    pub symbol: String,
}

impl PositionKey {
    pub fn new(strategy_id: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            strategy_id: strategy_id.into(),
            symbol: symbol.into(),
        }
    }
}

impl std::fmt::Display for PositionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.strategy_id, self.symbol)
    }
}

/// Prices used to value a position
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mark {
    pub price: Decimal,
    pub spot_price: Option<Decimal>,
}

impl Mark {
    pub fn new(price: Decimal) -> Self {
        Self {
            price,
            spot_price: None,
        }
    }

    pub fn with_spot(price: Decimal, spot_price: Decimal) -> Self {
        Self {
            price,
            spot_price: Some(spot_price),
        }
    }
}

/// Exposure owned by exactly one strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub strategy_id: String,
    pub symbol: String,
    pub venue: String,
    pub side: PositionSide,
    /// Market of the primary leg
    pub market: MarketKind,
    pub size: Decimal,
    pub entry_price: Decimal,
    /// Spot leg entry for hedges
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hedge_entry_price: Option<Decimal>,
    pub opened_at: DateTime<Utc>,
    pub status: PositionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realized_pnl: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<String>,
}

impl Position {
    /// Build an OPEN position from a confirmed entry fill
    pub fn from_fill(fill: &Fill, market: MarketKind) -> Self {
        Self {
            strategy_id: fill.strategy_id.clone(),
            symbol: fill.symbol.clone(),
            venue: fill.venue.clone(),
            side: fill.side,
            market,
            size: fill.size,
            entry_price: fill.price,
            hedge_entry_price: fill.hedge_price,
            opened_at: fill.filled_at,
            status: PositionStatus::Open,
            exit_price: None,
            realized_pnl: None,
            closed_at: None,
            close_reason: None,
        }
    }

    pub fn key(&self) -> PositionKey {
        PositionKey::new(&self.strategy_id, &self.symbol)
    }

    pub fn is_live(&self) -> bool {
        self.status.is_live()
    }

    /// Entry notional of the primary leg
    pub fn notional(&self) -> Decimal {
        self.size * self.entry_price
    }

    /// Mark-to-market PnL
    pub fn unrealized_pnl(&self, mark: &Mark) -> Decimal {
        self.pnl_at(mark.price, mark.spot_price)
    }

    /// PnL if the position were closed at the given prices
    pub fn pnl_at(&self, price: Decimal, spot_price: Option<Decimal>) -> Decimal {
        match self.side {
            PositionSide::Long => (price - self.entry_price) * self.size,
            PositionSide::Short => (self.entry_price - price) * self.size,
            PositionSide::Hedge => {
                let perp = (self.entry_price - price) * self.size;
                let spot = match (self.hedge_entry_price, spot_price) {
                    (Some(entry), Some(exit)) => (exit - entry) * self.size,
                    _ => Decimal::ZERO,
                };
                perp + spot
            }
        }
    }

    /// Move to a new status, enforcing the lifecycle
    pub fn transition(&mut self, target: PositionStatus) -> Result<(), String> {
        if !self.status.can_transition_to(target) {
            return Err(format!(
                "invalid position transition {} -> {} for {}",
                self.status,
                target,
                self.key()
            ));
        }
        self.status = target;
        Ok(())
    }

    /// Record a confirmed exit and mark the position CLOSED
    pub fn close_with(
        &mut self,
        exit_price: Decimal,
        exit_spot: Option<Decimal>,
        reason: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Result<Decimal, String> {
        self.transition(PositionStatus::Closed)?;
        let pnl = self.pnl_at(exit_price, exit_spot);
        self.exit_price = Some(exit_price);
        self.realized_pnl = Some(pnl);
        self.closed_at = Some(at);
        self.close_reason = Some(reason.into());
        Ok(pnl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn position(side: PositionSide) -> Position {
        Position {
            strategy_id: "s".into(),
            symbol: "ETHUSDT".into(),
            venue: "binance".into(),
            side,
            market: MarketKind::Perp,
            size: dec!(2),
            entry_price: dec!(100),
            hedge_entry_price: Some(dec!(99.5)),
            opened_at: Utc::now(),
            status: PositionStatus::Open,
            exit_price: None,
            realized_pnl: None,
            closed_at: None,
            close_reason: None,
        }
    }

    #[test]
    fn test_status_transitions() {
        use PositionStatus::*;
        assert!(Open.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Closed));
        assert!(!Closing.can_transition_to(Open));
        assert!(!Closed.can_transition_to(Open));
        assert!(!Closed.can_transition_to(Closing));
    }

    #[test]
    fn test_directional_pnl() {
        let long = position(PositionSide::Long);
        assert_eq!(long.unrealized_pnl(&Mark::new(dec!(110))), dec!(20));

        let short = position(PositionSide::Short);
        assert_eq!(short.unrealized_pnl(&Mark::new(dec!(110))), dec!(-20));
    }

    #[test]
    fn test_hedge_pnl_nets_legs() {
        let hedge = position(PositionSide::Hedge);
        // perp: (100 - 105) * 2 = -10, spot: (104.5 - 99.5) * 2 = 10
        let pnl = hedge.unrealized_pnl(&Mark::with_spot(dec!(105), dec!(104.5)));
        assert_eq!(pnl, dec!(0));
    }

    #[test]
    fn test_close_requires_closing_or_open() {
        let mut p = position(PositionSide::Long);
        p.transition(PositionStatus::Closing).unwrap();
        let pnl = p
            .close_with(dec!(90), None, "stop", Utc::now())
            .unwrap();
        assert_eq!(pnl, dec!(-20));
        assert_eq!(p.status, PositionStatus::Closed);
        assert!(p.transition(PositionStatus::Open).is_err());
    }
}
