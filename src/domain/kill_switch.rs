use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A condition that halted trading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HaltCause {
    Drawdown {
        drawdown: Decimal,
        limit: Decimal,
        equity: Decimal,
        high_water_mark: Decimal,
    },
    BasisBreach {
        strategy_id: String,
        symbol: String,
        basis: Decimal,
        limit: Decimal,
    },
    HighLatency {
        venue: String,
        avg_latency_ms: u64,
        threshold_ms: u64,
    },
}

impl std::fmt::Display for HaltCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HaltCause::Drawdown {
                drawdown, limit, ..
            } => write!(
                f,
                "drawdown {:.2}% exceeds {:.2}%",
                drawdown * Decimal::ONE_HUNDRED,
                limit * Decimal::ONE_HUNDRED
            ),
            HaltCause::BasisBreach {
                strategy_id,
                symbol,
                basis,
                limit,
            } => write!(
                f,
                "basis {:.3}% on {} ({}) exceeds {:.3}%",
                basis * Decimal::ONE_HUNDRED,
                symbol,
                strategy_id,
                limit * Decimal::ONE_HUNDRED
            ),
            HaltCause::HighLatency {
                venue,
                avg_latency_ms,
                threshold_ms,
            } => write!(
                f,
                "sustained latency on {} ({}ms > {}ms)",
                venue, avg_latency_ms, threshold_ms
            ),
        }
    }
}

/// Global kill switch record.
///
/// Single writer (the risk governor), many readers. Once `engaged` is set no
/// new position may be opened until an explicit reset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KillSwitchState {
    pub engaged: bool,
    pub reason: Option<String>,
    #[serde(default)]
    pub causes: Vec<HaltCause>,
    pub engaged_at: Option<DateTime<Utc>>,
    pub daily_pnl: Decimal,
    pub high_water_mark: Decimal,
    pub day_start_equity: Decimal,
    pub trading_day: NaiveDate,
    #[serde(default)]
    pub last_reset_by: Option<String>,
    #[serde(default)]
    pub last_reset_at: Option<DateTime<Utc>>,
}

impl KillSwitchState {
    pub fn new(trading_day: NaiveDate) -> Self {
        Self {
            engaged: false,
            reason: None,
            causes: Vec::new(),
            engaged_at: None,
            daily_pnl: Decimal::ZERO,
            high_water_mark: Decimal::ZERO,
            day_start_equity: Decimal::ZERO,
            trading_day,
            last_reset_by: None,
            last_reset_at: None,
        }
    }

    /// Engage with all contributing causes; a no-op when already engaged
    pub fn engage(&mut self, causes: Vec<HaltCause>, at: DateTime<Utc>) -> bool {
        if self.engaged || causes.is_empty() {
            return false;
        }
        let reason = causes
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        self.engaged = true;
        self.reason = Some(reason);
        self.causes = causes;
        self.engaged_at = Some(at);
        true
    }

    pub fn reset(&mut self, operator: &str, at: DateTime<Utc>) {
        self.engaged = false;
        self.reason = None;
        self.causes.clear();
        self.engaged_at = None;
        self.last_reset_by = Some(operator.to_string());
        self.last_reset_at = Some(at);
    }

    /// Start a new trading day at the given equity
    pub fn roll_day(&mut self, day: NaiveDate, equity: Decimal) {
        self.trading_day = day;
        self.day_start_equity = equity;
        self.high_water_mark = equity;
        self.daily_pnl = Decimal::ZERO;
    }

    /// Fractional drop of `equity` from the high-water-mark
    pub fn drawdown(&self, equity: Decimal) -> Decimal {
        if self.high_water_mark <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        ((self.high_water_mark - equity) / self.high_water_mark).max(Decimal::ZERO)
    }
}
