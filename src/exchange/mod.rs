//! Venue connectivity: connector trait, paper venue and the gateway that
//! enforces rate limits, idempotency and retries in front of them.

pub mod gateway;
pub mod idempotency;
pub mod latency;
pub mod paper;
pub mod rate_limit;
mod traits;

pub use gateway::{ExchangeGateway, GatewaySettings, VenueLatency};
pub use idempotency::{IdempotencyResult, PlacementRegistry};
pub use latency::{as_millis_u64, LatencyTracker, LatencyTransition};
pub use paper::{FaultInjector, PaperMarket, PaperVenue};
pub use rate_limit::TokenBucket;
pub use traits::{Balances, VenueConnector, VenuePosition};
