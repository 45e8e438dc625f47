pub mod global;
pub mod modules;

pub use global::{GlobalKillSwitch, KillSwitchStatus};
pub use modules::ModuleSwitchboard;
