//! Anomaly-detection entry
//!
//! Buys spot when relative volume spikes while price has not moved yet and
//! an external sentiment score confirms. Positions are held for a fixed time
//! unless an operator trigger or the hard stop loss comes first; a stopped
//! out symbol is not traded again for the rest of the run.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::HashSet;
use tracing::{debug, info, warn};

use super::traits::{Signal, Strategy};
use crate::config::AnomalyParams;
use crate::domain::{MarketKind, MarketSnapshot, Position, PositionSide, PositionStatus};

pub const ANOMALY: &str = "anomaly";

pub struct AnomalyEntry {
    params: AnomalyParams,
    blacklist: HashSet<String>,
    exit_requested: HashSet<String>,
}

impl AnomalyEntry {
    pub fn new(params: AnomalyParams) -> Self {
        Self {
            params,
            blacklist: HashSet::new(),
            exit_requested: HashSet::new(),
        }
    }

    pub fn is_blacklisted(&self, symbol: &str) -> bool {
        self.blacklist.contains(symbol)
    }
}

impl Strategy for AnomalyEntry {
    fn id(&self) -> &'static str {
        ANOMALY
    }

    fn generate_signal(
        &mut self,
        snapshot: &MarketSnapshot,
        position: Option<&Position>,
        now: DateTime<Utc>,
    ) -> Option<Signal> {
        let symbol = &snapshot.symbol;
        match position {
            Some(p) if p.status == PositionStatus::Open => {
                if self.exit_requested.remove(symbol) {
                    return Some(Signal::exit("external trigger"));
                }

                let price = snapshot.price_for(p.market);
                if p.entry_price > Decimal::ZERO {
                    let change = (price - p.entry_price) / p.entry_price;
                    if change <= -self.params.stop_loss_pct {
                        warn!(symbol = %symbol, change = %change.round_dp(4), "Stop loss hit, blacklisting symbol");
                        self.blacklist.insert(symbol.clone());
                        return Some(Signal::exit(format!("stop loss at {}", price)));
                    }
                }

                let held = now - p.opened_at;
                let timeout = Duration::seconds(self.params.hold_timeout_secs as i64);
                (held >= timeout).then(|| {
                    Signal::exit(format!("hold timeout after {}s", held.num_seconds()))
                })
            }
            Some(_) => None,
            None => {
                self.exit_requested.remove(symbol);
                if self.blacklist.contains(symbol) {
                    return None;
                }
                let (Some(rvol), Some(change)) = (snapshot.relative_volume, snapshot.price_change)
                else {
                    return None;
                };
                if rvol < self.params.rvol_threshold || change.abs() >= self.params.price_change_max {
                    return None;
                }
                let Some(sentiment) = snapshot.sentiment else {
                    debug!(symbol = %symbol, "Volume anomaly without sentiment score, skipping");
                    return None;
                };
                if sentiment < self.params.sentiment_threshold {
                    info!(symbol = %symbol, rvol = %rvol, sentiment = %sentiment, "Volume anomaly not confirmed by sentiment");
                    return None;
                }
                info!(symbol = %symbol, rvol = %rvol, sentiment = %sentiment, "Volume anomaly entry");
                Some(Signal::enter(
                    PositionSide::Long,
                    MarketKind::Spot,
                    format!("rvol {} with sentiment {}", rvol, sentiment),
                ))
            }
        }
    }

    fn on_timeout(&mut self, symbol: &str) {
        debug!(symbol, "Anomaly cycle timed out");
    }

    fn on_external_trigger(&mut self, symbol: &str) -> bool {
        self.exit_requested.insert(symbol.to_string());
        true
    }

    fn needs_sentiment(&self) -> bool {
        true
    }
}
