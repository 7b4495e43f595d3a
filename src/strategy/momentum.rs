//! Momentum with confirmation
//!
//! Enters only when price, open interest and order flow agree; a trend move
//! that order flow does not confirm is treated as a fake move. Exits on a
//! trend reversal or when price gives back `trailing_stop_pct` from the best
//! price seen since entry.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::{debug, info};

use super::traits::{Signal, Strategy};
use crate::config::MomentumParams;
use crate::domain::{Fill, IntentKind, MarketKind, MarketSnapshot, Position, PositionSide, PositionStatus};

pub const MOMENTUM: &str = "momentum";

pub struct Momentum {
    params: MomentumParams,
    /// Best price since entry, per symbol
    best_price: HashMap<String, Decimal>,
}

impl Momentum {
    pub fn new(params: MomentumParams) -> Self {
        Self {
            params,
            best_price: HashMap::new(),
        }
    }

    fn exit_signal(&mut self, snapshot: &MarketSnapshot, position: &Position, trend: Decimal) -> Option<Signal> {
        let price = snapshot.price;
        let best = self
            .best_price
            .entry(snapshot.symbol.clone())
            .or_insert(position.entry_price);

        let retrace = match position.side {
            PositionSide::Long => {
                *best = (*best).max(price);
                (*best - price) / *best
            }
            PositionSide::Short => {
                *best = (*best).min(price);
                (price - *best) / *best
            }
            PositionSide::Hedge => return None,
        };

        if retrace >= self.params.trailing_stop_pct {
            return Some(Signal::exit(format!(
                "trailing stop: {} retraced {} from {}",
                price, retrace.round_dp(4), best
            )));
        }

        let reversed = match position.side {
            PositionSide::Long => price < trend,
            PositionSide::Short => price > trend,
            PositionSide::Hedge => false,
        };
        reversed.then(|| Signal::exit(format!("trend reversal: price {} vs trend {}", price, trend)))
    }
}

impl Strategy for Momentum {
    fn id(&self) -> &'static str {
        MOMENTUM
    }

    fn generate_signal(
        &mut self,
        snapshot: &MarketSnapshot,
        position: Option<&Position>,
        _now: DateTime<Utc>,
    ) -> Option<Signal> {
        let (Some(trend), Some(oi_ratio), Some(flow)) = (
            snapshot.trend_line,
            snapshot.open_interest_ratio,
            snapshot.order_flow_delta,
        ) else {
            debug!(symbol = %snapshot.symbol, "Indicators missing, skipping");
            return None;
        };

        match position {
            Some(p) if p.status == PositionStatus::Open => self.exit_signal(snapshot, p, trend),
            Some(_) => None,
            None => {
                let price = snapshot.price;
                let oi_surge = oi_ratio >= self.params.oi_surge_threshold;
                if !oi_surge {
                    return None;
                }

                if price > trend {
                    if flow > Decimal::ZERO {
                        info!(symbol = %snapshot.symbol, price = %price, oi = %oi_ratio, "Confirmed upside momentum");
                        return Some(Signal::enter(
                            PositionSide::Long,
                            MarketKind::Perp,
                            format!("breakout above {} with OI x{}", trend, oi_ratio),
                        ));
                    }
                    info!(symbol = %snapshot.symbol, flow = %flow, "Fake move rejected: order flow not rising");
                } else if price < trend && self.params.allow_short {
                    if flow < Decimal::ZERO {
                        info!(symbol = %snapshot.symbol, price = %price, oi = %oi_ratio, "Confirmed downside momentum");
                        return Some(Signal::enter(
                            PositionSide::Short,
                            MarketKind::Perp,
                            format!("breakdown below {} with OI x{}", trend, oi_ratio),
                        ));
                    }
                    info!(symbol = %snapshot.symbol, flow = %flow, "Fake move rejected: order flow not falling");
                }
                None
            }
        }
    }

    fn on_fill(&mut self, fill: &Fill) {
        match fill.kind {
            IntentKind::Open => {
                self.best_price.insert(fill.symbol.clone(), fill.price);
            }
            IntentKind::Close => {
                self.best_price.remove(&fill.symbol);
            }
        }
    }
}
