//! Risk governor and the events it consumes.

pub mod events;
pub mod governor;

pub use events::RiskEvent;
pub use governor::{check_leverage, unrealized_pnl, GovernorHandle, GovernorStatus, RiskGovernor};
