pub mod monitor;
pub mod price;
pub mod rules;
pub mod supervisor;

pub use monitor::MonitorConfig;
pub use price::{PriceFeedConfig, TieredPriceSource};
pub use rules::{CandleWindow, ExitRules, ExitSnapshot};
pub use supervisor::{MonitorSupervisor, SentinelCloseHook};
