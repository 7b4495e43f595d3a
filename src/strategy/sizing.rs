use rust_decimal::{Decimal, RoundingStrategy};

/// Inputs for turning allocated equity into an order size
#[derive(Debug, Clone)]
pub struct SizingRules {
    pub target_leverage: Decimal,
    pub max_leverage: Decimal,
    pub size_step: Decimal,
    pub min_notional: Decimal,
    /// Symbols sharing the allocation
    pub slots: usize,
}

impl SizingRules {
    /// Size for a new entry, or `None` when it would fall under the minimum notional.
    ///
    /// Each symbol gets an equal slice of the allocation, levered by the
    /// target (never above the governor's maximum) and rounded down to the
    /// venue step.
    pub fn size_for(&self, equity: Decimal, price: Decimal) -> Option<Decimal> {
        if equity <= Decimal::ZERO || price <= Decimal::ZERO {
            return None;
        }
        let leverage = self.target_leverage.min(self.max_leverage);
        let slice = equity / Decimal::from(self.slots.max(1) as u64);
        let raw = slice * leverage / price;
        let size = round_down_to_step(raw, self.size_step);
        if size <= Decimal::ZERO || size * price < self.min_notional {
            return None;
        }
        Some(size)
    }
}

pub fn round_down_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    ((value / step).round_dp_with_strategy(0, RoundingStrategy::ToZero) * step).normalize()
}
