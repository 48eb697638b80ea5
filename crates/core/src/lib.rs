pub mod audit;
pub mod config;
pub mod error;
pub mod store;
pub mod traits;
pub mod types;

pub use audit::{
    BreakerAudit, BreakerEvent, BreakerEventKind, RegimeAudit, RegimeChange, RegimeSnapshot,
};
pub use config::DatabaseConfig;
pub use error::{EngineError, Result};
pub use store::{CloseApplied, CloseApply, LedgerStore, LimitFill, OpenInsert, PendingOrderInsert};
pub use traits::{CandleSource, PriceSource};
pub use types::{
    Account, Candle, CloseReason, Direction, Order, OrderKind, OrderStatus, Position,
    PositionStatus, Regime, Timeframe, Trade, TradeAction,
};
