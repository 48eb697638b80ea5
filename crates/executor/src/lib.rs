pub mod executor;

pub use executor::{ExecutorConfig, FillHook, LimitOrderExecutor, ScanReport};
