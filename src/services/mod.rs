pub mod control;

pub use control::{router, serve, EngineControl, EngineStatus, KillSwitchView, ResetRequest};
