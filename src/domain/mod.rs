pub mod action;
pub mod battery;
pub mod dispatch;
pub mod ev_charger;
pub mod learning;
pub mod state;
pub mod types;
pub mod vehicle;

pub use action::*;
pub use battery::{BatteryCapabilities, BatteryState, BatteryStatus};
pub use dispatch::*;
pub use ev_charger::{ChargerCapabilities, ChargerState, ChargerStatus};
pub use learning::*;
pub use state::*;
pub use types::*;
pub use vehicle::*;
