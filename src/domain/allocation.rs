use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Share of total capital assigned to one strategy.
///
/// Written only by the strategy runtime at startup or on an explicit reload;
/// `current_equity` is then adjusted by realized PnL as positions close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub strategy_id: String,
    pub capital_fraction: Decimal,
    pub current_equity: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl Allocation {
    pub fn new(strategy_id: impl Into<String>, capital_fraction: Decimal, total_equity: Decimal) -> Self {
        Self {
            strategy_id: strategy_id.into(),
            capital_fraction,
            current_equity: total_equity * capital_fraction,
            updated_at: Utc::now(),
        }
    }

    /// Apply realized PnL from a closed position
    pub fn apply_realized(&mut self, pnl: Decimal) {
        self.current_equity += pnl;
        self.updated_at = Utc::now();
    }
}

/// Check that fractions sum to at most 1.0 and are individually in (0, 1]
pub fn validate_fractions<'a, I>(fractions: I) -> Result<Decimal, String>
where
    I: IntoIterator<Item = (&'a str, Decimal)>,
{
    let mut total = Decimal::ZERO;
    for (id, fraction) in fractions {
        if fraction <= Decimal::ZERO || fraction > Decimal::ONE {
            return Err(format!("capital_fraction for {id} must be in (0, 1], got {fraction}"));
        }
        total += fraction;
    }
    if total > Decimal::ONE {
        return Err(format!("sum of capital fractions is {total}, must be <= 1.0"));
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_fraction_sum_invariant() {
        assert_eq!(
            validate_fractions([("a", dec!(0.4)), ("b", dec!(0.3)), ("c", dec!(0.3))]),
            Ok(dec!(1.0))
        );
        assert!(validate_fractions([("a", dec!(0.6)), ("b", dec!(0.5))]).is_err());
        assert!(validate_fractions([("a", dec!(0))]).is_err());
    }

    #[test]
    fn test_allocation_equity() {
        let mut alloc = Allocation::new("cash_cow", dec!(0.4), dec!(10000));
        assert_eq!(alloc.current_equity, dec!(4000));
        alloc.apply_realized(dec!(-250));
        assert_eq!(alloc.current_equity, dec!(3750));
    }
}
