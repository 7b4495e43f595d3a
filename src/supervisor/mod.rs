pub mod alert_manager;

pub use alert_manager::{Alert, AlertChannel, AlertLevel, AlertManager, AlertManagerConfig};
