pub mod config;
pub mod logging;

pub const APP_NAME: &str = "HEARTH";

pub use config::{HearthConfig, KillSwitchConfig, SchedulerConfig, SecurityConfig};
