use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::{MarketKind, VenueOrder, VenueOrderState};
use crate::error::{ConnError, OrderError};

/// Account balances on one venue
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Balances {
    pub venue: String,
    /// Mark-to-market account value in quote currency
    pub total_equity: Decimal,
    /// Quote currency free for new orders
    pub available: Decimal,
    #[serde(default)]
    pub assets: BTreeMap<String, Decimal>,
}

/// Live exposure on a venue, signed (short is negative)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenuePosition {
    pub symbol: String,
    pub market: MarketKind,
    pub size: Decimal,
    pub entry_price: Decimal,
}

/// Wire-level connection to a single venue.
///
/// Implementations own the exchange-specific formats and signing; the gateway
/// adds retry, rate limiting, idempotency and latency sampling on top. Errors
/// must classify as transient (`ConnError::Timeout/Server/Network`) or
/// terminal (auth, validation, rejections).
#[async_trait]
pub trait VenueConnector: Send + Sync {
    fn venue(&self) -> &str;

    /// Submit an order tagged with `client_order_id`
    async fn submit_order(&self, order: &VenueOrder) -> Result<VenueOrderState, OrderError>;

    /// Look an order up by its client id; `None` if the venue never saw it
    async fn order_by_client_id(
        &self,
        client_order_id: &str,
    ) -> Result<Option<VenueOrderState>, OrderError>;

    async fn cancel_order(&self, order_id: &str) -> Result<(), OrderError>;

    async fn balances(&self) -> Result<Balances, ConnError>;

    /// Non-zero positions
    async fn open_positions(&self) -> Result<Vec<VenuePosition>, ConnError>;

    /// Release the session
    async fn close(&self) {}
}
