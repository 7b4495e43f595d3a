//! Inputs consumed by strategies.
//!
//! Indicator and sentiment math is owned by external collaborators; the
//! engine only sees their numeric outputs through these traits.

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::domain::MarketSnapshot;
use crate::error::ConnError;

/// Source of enriched market snapshots
#[async_trait]
pub trait MarketFeed: Send + Sync {
    async fn snapshot(&self, symbol: &str) -> Result<MarketSnapshot, ConnError>;
}

/// External sentiment score provider (0-100)
#[async_trait]
pub trait SentimentOracle: Send + Sync {
    async fn score(&self, symbol: &str) -> Result<Option<Decimal>, ConnError>;
}
