pub mod adapters;
pub mod cli;
pub mod config;
pub mod coordination;
pub mod coordinator;
pub mod domain;
pub mod error;
pub mod exchange;
pub mod persistence;
pub mod risk;
pub mod services;
pub mod strategy;
pub mod supervisor;

pub use config::AppConfig;
pub use coordination::{GracefulShutdown, ShutdownSignal};
pub use coordinator::{Engine, EngineOptions, ExitStatus};
pub use error::{PantherError, Result};
pub use exchange::ExchangeGateway;
pub use persistence::{FileStateStore, MemoryStateStore, StateStore};
pub use risk::{GovernorHandle, RiskGovernor};
pub use supervisor::{AlertLevel, AlertManager, AlertManagerConfig};
