use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Direction of a strategy position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
    /// Short perpetual + long spot of equal size
    Hedge,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "long",
            PositionSide::Short => "short",
            PositionSide::Hedge => "hedge",
        }
    }

    /// Order side that opens the primary leg
    pub fn entry_order_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short | PositionSide::Hedge => OrderSide::Sell,
        }
    }

    /// Market the primary leg trades on
    pub fn primary_market(&self, long_market: MarketKind) -> MarketKind {
        match self {
            PositionSide::Long => long_market,
            PositionSide::Short | PositionSide::Hedge => MarketKind::Perp,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Market segment an instrument trades on
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketKind {
    Perp,
    Spot,
}

impl std::fmt::Display for MarketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MarketKind::Perp => write!(f, "perp"),
            MarketKind::Spot => write!(f, "spot"),
        }
    }
}

/// Whether an intent opens new exposure or unwinds existing exposure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentKind {
    Open,
    Close,
}

/// Price protection attached to an intent
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PriceConstraint {
    /// Fill at market, rejecting fills further than `max_slippage` from the reference price
    Market { max_slippage: Decimal },
    /// Never fill worse than this price
    Limit(Decimal),
}

/// Order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    /// Order submitted to exchange
    Submitted,
    /// Order partially filled
    PartiallyFilled,
    /// Order fully filled
    Filled,
    /// Order cancelled
    Cancelled,
    /// Order rejected by exchange
    Rejected,
    /// Order expired
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Cancelled
                | OrderStatus::Rejected
                | OrderStatus::Expired
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, OrderStatus::Submitted | OrderStatus::PartiallyFilled)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderStatus::Submitted => "SUBMITTED",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Expired => "EXPIRED",
        };
        write!(f, "{}", s)
    }
}

/// Client-generated token that makes a placement safe to retry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Fresh random key for a new intent
    pub fn generate(strategy_id: &str) -> Self {
        Self(format!("{}-{}", strategy_id, Uuid::new_v4().simple()))
    }

    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Key for one leg of a multi-leg placement
    pub fn leg(&self, leg: &str) -> Self {
        Self(format!("{}:{}", self.0, leg))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ephemeral request to change a strategy's exposure.
///
/// Lives only for the duration of one placement attempt; the idempotency key
/// guarantees at most one live exchange order even across retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    pub strategy_id: String,
    pub venue: String,
    pub symbol: String,
    pub side: PositionSide,
    pub kind: IntentKind,
    /// Market used for the primary leg of a long position
    pub long_market: MarketKind,
    pub size: Decimal,
    /// Price the strategy observed when it produced the signal
    pub reference_price: Decimal,
    /// Spot reference for the second leg of a hedge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hedge_reference_price: Option<Decimal>,
    pub price_constraint: PriceConstraint,
    pub idempotency_key: IdempotencyKey,
    pub reason: String,
}

impl OrderIntent {
    pub fn is_closing(&self) -> bool {
        self.kind == IntentKind::Close
    }

    pub fn notional(&self) -> Decimal {
        self.size * self.reference_price
    }

    /// Deterministic fingerprint of the request fields, used to detect a key
    /// being reused for a different order.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.strategy_id.as_bytes());
        hasher.update(self.venue.as_bytes());
        hasher.update(self.symbol.as_bytes());
        hasher.update(self.side.as_str().as_bytes());
        hasher.update(format!("{:?}", self.kind).as_bytes());
        hasher.update(self.size.normalize().to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Worst acceptable fill price for an order on the given side
    pub fn price_limit(&self, order_side: OrderSide, reference: Decimal) -> Decimal {
        match self.price_constraint {
            PriceConstraint::Limit(price) => price,
            PriceConstraint::Market { max_slippage } => match order_side {
                OrderSide::Buy => reference * (Decimal::ONE + max_slippage),
                OrderSide::Sell => reference * (Decimal::ONE - max_slippage),
            },
        }
    }
}

/// Single-instrument order sent to a venue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueOrder {
    pub client_order_id: String,
    pub symbol: String,
    pub market: MarketKind,
    pub side: OrderSide,
    pub size: Decimal,
    /// Worst acceptable price; `None` for an unprotected market order
    pub price_limit: Option<Decimal>,
    pub reduce_only: bool,
}

/// Venue-side view of an order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueOrderState {
    pub order_id: String,
    pub client_order_id: String,
    pub status: OrderStatus,
    pub filled_size: Decimal,
    pub avg_price: Option<Decimal>,
}

/// One executed leg of a fill
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegFill {
    pub order_id: String,
    pub market: MarketKind,
    pub side: OrderSide,
    pub size: Decimal,
    pub price: Decimal,
}

/// Confirmed execution of an intent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub idempotency_key: IdempotencyKey,
    pub strategy_id: String,
    pub venue: String,
    pub symbol: String,
    pub side: PositionSide,
    pub kind: IntentKind,
    pub size: Decimal,
    /// Average price of the primary leg
    pub price: Decimal,
    /// Spot leg price for hedges
    pub hedge_price: Option<Decimal>,
    pub legs: Vec<LegFill>,
    pub filled_at: DateTime<Utc>,
}

impl Fill {
    pub fn primary_order_id(&self) -> &str {
        self.legs.first().map(|l| l.order_id.as_str()).unwrap_or("")
    }
}
