pub mod allocation;
pub mod kill_switch;
pub mod market;
pub mod order;
pub mod position;

pub use allocation::*;
pub use kill_switch::*;
pub use market::*;
pub use order::*;
pub use position::*;
