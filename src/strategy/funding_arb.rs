//! Funding-rate arbitrage
//!
//! Holds a delta-neutral hedge (short perp, long spot) while perpetual
//! funding pays shorts. Exits when funding reverts or when the spread
//! between the legs grows past the basis limit; the latter is also reported
//! to the risk governor.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use super::traits::{Signal, Strategy};
use crate::config::FundingArbParams;
use crate::domain::{MarketKind, MarketSnapshot, Position, PositionSide, PositionStatus};
use crate::risk::RiskEvent;

pub const FUNDING_ARB: &str = "funding_arb";

pub struct FundingArb {
    params: FundingArbParams,
    max_basis: Decimal,
    reports: Vec<RiskEvent>,
}

impl FundingArb {
    /// `default_max_basis` applies when the strategy sets no limit of its own
    pub fn new(params: FundingArbParams, default_max_basis: Decimal) -> Self {
        let max_basis = params.max_basis.unwrap_or(default_max_basis);
        Self {
            params,
            max_basis,
            reports: Vec::new(),
        }
    }

    pub fn max_basis(&self) -> Decimal {
        self.max_basis
    }
}

impl Strategy for FundingArb {
    fn id(&self) -> &'static str {
        FUNDING_ARB
    }

    fn generate_signal(
        &mut self,
        snapshot: &MarketSnapshot,
        position: Option<&Position>,
        _now: DateTime<Utc>,
    ) -> Option<Signal> {
        let (Some(funding), Some(basis)) = (snapshot.funding_rate, snapshot.basis()) else {
            debug!(symbol = %snapshot.symbol, "Funding or spot price missing, skipping");
            return None;
        };

        match position {
            Some(p) if p.status == PositionStatus::Open => {
                if basis.abs() > self.max_basis {
                    warn!(
                        symbol = %snapshot.symbol,
                        basis = %basis,
                        limit = %self.max_basis,
                        "Basis limit breached on open hedge"
                    );
                    self.reports.push(RiskEvent::BasisBreach {
                        strategy_id: FUNDING_ARB.to_string(),
                        symbol: snapshot.symbol.clone(),
                        basis,
                    });
                    return Some(Signal::exit(format!(
                        "basis {} beyond limit {}",
                        basis, self.max_basis
                    )));
                }
                let exit_below = self.params.min_funding_rate * self.params.exit_funding_fraction;
                if funding < exit_below {
                    return Some(Signal::exit(format!(
                        "funding {} reverted below {}",
                        funding, exit_below
                    )));
                }
                None
            }
            Some(_) => None,
            None => {
                let entry_basis = self.max_basis * self.params.entry_basis_fraction;
                if funding >= self.params.min_funding_rate && basis.abs() <= entry_basis {
                    info!(
                        symbol = %snapshot.symbol,
                        funding = %funding,
                        basis = %basis,
                        "Funding arbitrage entry"
                    );
                    return Some(Signal::enter(
                        PositionSide::Hedge,
                        MarketKind::Spot,
                        format!("funding {} >= {}", funding, self.params.min_funding_rate),
                    ));
                }
                None
            }
        }
    }

    fn drain_risk_reports(&mut self) -> Vec<RiskEvent> {
        std::mem::take(&mut self.reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn snapshot(funding: Decimal, basis: Decimal) -> MarketSnapshot {
        let spot = dec!(60000);
        let mut s = MarketSnapshot::new("BTCUSDT", spot * (Decimal::ONE + basis));
        s.spot_price = Some(spot);
        s.funding_rate = Some(funding);
        s
    }

    fn hedge() -> Position {
        Position {
            strategy_id: FUNDING_ARB.into(),
            symbol: "BTCUSDT".into(),
            venue: "paper".into(),
            side: PositionSide::Hedge,
            market: MarketKind::Perp,
            size: dec!(0.1),
            entry_price: dec!(60180),
            hedge_entry_price: Some(dec!(60000)),
            opened_at: Utc::now(),
            status: PositionStatus::Open,
            exit_price: None,
            realized_pnl: None,
            closed_at: None,
            close_reason: None,
        }
    }

    fn strategy() -> FundingArb {
        FundingArb::new(FundingArbParams::default(), dec!(0.01))
    }

    #[test]
    fn test_enters_on_high_funding_and_tight_basis() {
        let mut s = strategy();
        let signal = s.generate_signal(&snapshot(dec!(0.0003), dec!(0.003)), None, Utc::now());
        assert!(matches!(
            signal,
            Some(Signal::Enter {
                side: PositionSide::Hedge,
                ..
            })
        ));

        // Basis above half the limit blocks entry
        assert!(s
            .generate_signal(&snapshot(dec!(0.0003), dec!(0.006)), None, Utc::now())
            .is_none());
        // Funding below threshold
        assert!(s
            .generate_signal(&snapshot(dec!(0.00005), dec!(0.001)), None, Utc::now())
            .is_none());
    }

    #[test]
    fn test_basis_breach_exits_and_reports() {
        let mut s = strategy();
        let p = hedge();
        assert!(s
            .generate_signal(&snapshot(dec!(0.0003), dec!(0.003)), Some(&p), Utc::now())
            .is_none());

        let signal = s.generate_signal(&snapshot(dec!(0.0003), dec!(0.016)), Some(&p), Utc::now());
        assert!(matches!(signal, Some(Signal::Exit { .. })));
        let reports = s.drain_risk_reports();
        assert_eq!(reports.len(), 1);
        assert!(matches!(reports[0], RiskEvent::BasisBreach { .. }));
        assert!(s.drain_risk_reports().is_empty());
    }

    #[test]
    fn test_exits_on_funding_reversion() {
        let mut s = strategy();
        let signal = s.generate_signal(&snapshot(dec!(0.00004), dec!(0.002)), Some(&hedge()), Utc::now());
        match signal {
            Some(Signal::Exit { reason }) => assert!(reason.contains("reverted")),
            other => panic!("expected exit, got {:?}", other),
        }
        assert!(s.drain_risk_reports().is_empty());
    }
}
